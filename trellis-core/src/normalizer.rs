//! Module metadata normalizer.
//!
//! Turns one raw [`ModuleDecl`] into a [`NormalizedMeta`], resolving forward
//! references, partitioning imports and exports, and rejecting module shapes
//! that can never work. Normalization has no side effects. Normalizing a
//! module twice yields equal records as long as its providers are classes,
//! aliases or factories; `Provider::value` allocates on every `declare`, and
//! value providers only compare equal when they share the same allocation.

use crate::extensions::ExtensionDecl;
use crate::metadata::NormalizedMeta;
use crate::module::{ExportItem, ImportItem, ModuleDecl, ModuleRef};
use crate::provider::{PerScope, Provider, Scope};
use crate::token::Token;
use crate::{Error, Result};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ModuleNormalizer {
    warn_unregistered_extensions: bool,
}

impl Default for ModuleNormalizer {
    fn default() -> Self {
        Self {
            warn_unregistered_extensions: true,
        }
    }
}

impl ModuleNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn_unregistered_extensions(mut self, enabled: bool) -> Self {
        self.warn_unregistered_extensions = enabled;
        self
    }

    /// Declare and normalize a module reference
    pub fn normalize(&self, module: &ModuleRef) -> Result<NormalizedMeta> {
        let decl = module.module_type().declare();
        self.normalize_decl(module, decl)
    }

    /// Normalize an already obtained declaration for `module`
    pub fn normalize_decl(&self, module: &ModuleRef, decl: ModuleDecl) -> Result<NormalizedMeta> {
        let name = module.name().to_string();
        let kind = decl.kind.ok_or_else(|| {
            Error::Configuration(format!(
                "\"{}\" does not have the root or feature module marker",
                name
            ))
        })?;

        let ModuleDecl {
            id,
            imports,
            exports,
            mut providers,
            controllers,
            mut extensions,
            resolved_collisions,
            ..
        } = decl;

        let mut id = id;
        let mut export_items = exports;
        let mut prefix = None;
        let mut guards = Vec::new();

        if let Some(params) = module.params() {
            for scope in Scope::ALL {
                providers[scope].extend(params.providers[scope].iter().cloned());
            }
            export_items.extend(params.exports.iter().cloned().map(ExportItem::Token));
            if params.id.is_some() {
                id = params.id.clone();
            }
            prefix = params.prefix.clone();
            guards = params.guards.clone();
        }

        let mut import_modules = Vec::new();
        let mut import_with_params = Vec::new();
        let mut forward_imports = Vec::new();
        for item in imports {
            let imported = match item {
                ImportItem::Module(module) => module,
                ImportItem::Forward(forward) => {
                    let resolved = forward.resolve();
                    forward_imports.push(resolved.key());
                    resolved
                }
            };
            match imported {
                ModuleRef::WithParams(params) => import_with_params.push(params),
                plain => import_modules.push(plain),
            }
        }

        for guard in &guards {
            if !guard.class.is_guard() {
                return Err(Error::Configuration(format!(
                    "Import {} with guards failed: {} does not implement can_activate",
                    name,
                    guard.class.name()
                )));
            }
        }

        check_extensions(&name, &extensions, &providers)?;

        let mut meta = NormalizedMeta {
            module: module.clone(),
            name,
            id,
            kind,
            import_modules,
            import_with_params,
            forward_imports,
            export_modules: Vec::new(),
            export_with_params: Vec::new(),
            providers: PerScope::default(),
            exported_providers: PerScope::default(),
            exported_multi: PerScope::default(),
            reexported_tokens: Vec::new(),
            controllers,
            extensions: Vec::new(),
            resolved_collisions,
            prefix,
            guards,
        };

        let has_exports = !export_items.is_empty();
        let mut exported_tokens = Vec::new();
        for item in export_items {
            match item {
                ExportItem::Module(exported) => {
                    if !meta.imports_key(exported.key()) {
                        return Err(Error::Configuration(format!(
                            "Reexport from {} failed: {} includes in exports, but not includes in imports",
                            meta.name, exported
                        )));
                    }
                    match exported {
                        ModuleRef::WithParams(params) => meta.export_with_params.push(params),
                        plain => meta.export_modules.push(plain),
                    }
                }
                ExportItem::Token(token) => exported_tokens.push(token),
            }
        }

        // Tokens go second so they can be checked against every re-exported module
        let mut seen_tokens = HashSet::new();
        for token in exported_tokens {
            if seen_tokens.insert(token.clone()) {
                export_token(&mut meta, &providers, &mut extensions, token)?;
            }
        }

        if !meta.is_root()
            && !has_exports
            && meta.controllers.is_empty()
            && extensions.is_empty()
            && providers[Scope::App].is_empty()
        {
            return Err(Error::Configuration(format!(
                "Importing {} failed: this module should have providers per app, controllers, exports or extensions",
                meta.name
            )));
        }

        if self.warn_unregistered_extensions {
            warn_unregistered(&meta.name, &providers, &extensions);
        }

        meta.providers = providers;
        meta.extensions = extensions;
        tracing::trace!(module = %meta.name, "Normalized module metadata");
        Ok(meta)
    }
}

fn check_extensions(name: &str, extensions: &[ExtensionDecl], providers: &PerScope<Vec<Provider>>) -> Result<()> {
    for (i, ext) in extensions.iter().enumerate() {
        if !ext.extension.is_extension() {
            return Err(Error::Configuration(format!(
                "Importing {} failed: extension with index {} ({}) does not implement init",
                name,
                i,
                ext.extension.name()
            )));
        }
        let in_req = providers[Scope::Req]
            .iter()
            .any(|p| p.token == ext.group || p.token == ext.extension.token());
        if in_req {
            return Err(Error::Configuration(format!(
                "Importing {} failed: extension \"{}\" cannot be included in providers per request",
                name, ext.group
            )));
        }
    }
    Ok(())
}

fn export_token(
    meta: &mut NormalizedMeta,
    providers: &PerScope<Vec<Provider>>,
    extensions: &mut [ExtensionDecl],
    token: Token,
) -> Result<()> {
    let mut found = false;
    for scope in Scope::EXPORTABLE {
        let matching: Vec<&Provider> = providers[scope].iter().filter(|p| p.token == token).collect();
        if matching.is_empty() {
            continue;
        }
        found = true;
        for provider in &matching {
            if provider.multi {
                meta.exported_multi[scope].push((*provider).clone());
            }
        }
        // Later declarations of an ordinary token shadow earlier ones
        if let Some(last) = matching.iter().rev().find(|p| !p.multi) {
            meta.exported_providers[scope].push((*last).clone());
        }
    }
    if found {
        return Ok(());
    }

    let mut marked = false;
    for ext in extensions.iter_mut().filter(|e| e.group == token) {
        ext.exported = true;
        marked = true;
    }
    if marked {
        return Ok(());
    }

    if providers[Scope::App].iter().any(|p| p.token == token) {
        return Err(Error::Configuration(format!(
            "Exported {} from {} is declared in providers per app; those are exported automatically",
            token, meta.name
        )));
    }

    if meta.export_modules.is_empty() && meta.export_with_params.is_empty() {
        return Err(unresolved_export(&token, &meta.name));
    }

    meta.reexported_tokens.push(token);
    Ok(())
}

pub(crate) fn unresolved_export(token: &Token, module: &str) -> Error {
    Error::Configuration(format!(
        "Exported {} from {} should be declared in providers per mod, rou or req, \
         in the exports of a re-exported module, or be the group of one of its extensions",
        token, module
    ))
}

fn warn_unregistered(name: &str, providers: &PerScope<Vec<Provider>>, extensions: &[ExtensionDecl]) {
    for (_, list) in providers.iter() {
        for provider in list.iter().filter(|p| p.multi) {
            let Some(class) = provider.class_def() else {
                continue;
            };
            let extension_like = provider.token.name().to_lowercase().contains("extension");
            if extension_like && class.is_extension() && !extensions.iter().any(|e| e.group == provider.token) {
                tracing::warn!(
                    module = %name,
                    token = %provider.token,
                    extension = class.name(),
                    "Extension-like provider is not registered in the module's extensions"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{Extension, ExtensionData};
    use crate::extensions_manager::ExtensionsManager;
    use crate::guard::{Guard, GuardContext, GuardItem, GuardOutcome};
    use crate::module::{ControllerDef, Module};
    use crate::provider::{ClassDef, Deps, Injectable};
    use crate::token::InjectionToken;
    use async_trait::async_trait;
    use std::sync::LazyLock;

    static ROUTES: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("ROUTES"));

    struct Logger;
    impl Injectable for Logger {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(Logger)
        }
    }

    struct RoutesExtension;
    impl Injectable for RoutesExtension {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(RoutesExtension)
        }
    }

    #[async_trait]
    impl Extension for RoutesExtension {
        async fn init(&self, _: &ExtensionsManager, _: bool) -> Result<Option<ExtensionData>> {
            Ok(None)
        }
    }

    struct AuthGuard;
    impl Injectable for AuthGuard {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(AuthGuard)
        }
    }

    #[async_trait]
    impl Guard for AuthGuard {
        async fn can_activate(&self, _: &GuardContext, _: &[serde_json::Value]) -> Result<GuardOutcome> {
            Ok(GuardOutcome::Allowed)
        }
    }

    struct LoggingModule;
    impl Module for LoggingModule {
        fn declare() -> ModuleDecl {
            ModuleDecl::feature()
                .providers_per_mod([Provider::of::<Logger>()])
                .export(Token::of::<Logger>())
        }
    }

    struct EmptyModule;
    impl Module for EmptyModule {
        fn declare() -> ModuleDecl {
            ModuleDecl::feature()
        }
    }

    fn normalize_decl(module: ModuleRef, decl: ModuleDecl) -> Result<NormalizedMeta> {
        ModuleNormalizer::new().normalize_decl(&module, decl)
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let module = ModuleRef::of::<LoggingModule>();
        let normalizer = ModuleNormalizer::new();
        let first = normalizer.normalize(&module).unwrap();
        let second = normalizer.normalize(&module).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.exported_providers[Scope::Mod].len(), 1);
    }

    struct SettingsModule;
    impl Module for SettingsModule {
        fn declare() -> ModuleDecl {
            ModuleDecl::feature()
                .providers_per_mod([Provider::value("timeout", 30u64)])
                .export("timeout")
        }
    }

    #[test]
    fn test_value_providers_differ_between_normalizations() {
        let module = ModuleRef::of::<SettingsModule>();
        let normalizer = ModuleNormalizer::new();
        let first = normalizer.normalize(&module).unwrap();
        let second = normalizer.normalize(&module).unwrap();
        assert_ne!(first, second);
        let tokens = |meta: &NormalizedMeta| {
            meta.exported_at(Scope::Mod)
                .map(|p| p.token.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(tokens(&first), tokens(&second));
    }

    #[test]
    fn test_missing_marker_is_rejected() {
        let err = normalize_decl(ModuleRef::of::<EmptyModule>(), ModuleDecl::default()).unwrap_err();
        assert!(err.to_string().contains("does not have the root or feature module marker"));
    }

    #[test]
    fn test_dead_weight_module_is_rejected() {
        let err = ModuleNormalizer::new()
            .normalize(&ModuleRef::of::<EmptyModule>())
            .unwrap_err();
        assert!(err.to_string().contains("should have providers per app"));
    }

    #[test]
    fn test_providers_per_app_only_is_accepted() {
        let decl = ModuleDecl::feature().providers_per_app([Provider::of::<Logger>()]);
        assert!(normalize_decl(ModuleRef::of::<EmptyModule>(), decl).is_ok());
    }

    #[test]
    fn test_export_of_undeclared_token_fails() {
        let decl = ModuleDecl::feature()
            .controller(ControllerDef::new("Users"))
            .export(Token::named("missing"));
        let err = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap_err();
        assert!(err.to_string().contains("Exported missing from EmptyModule"));
    }

    #[test]
    fn test_export_of_app_provider_fails() {
        let decl = ModuleDecl::feature()
            .providers_per_app([Provider::of::<Logger>()])
            .export(Token::of::<Logger>());
        let err = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap_err();
        assert!(err.to_string().contains("providers per app"));
    }

    #[test]
    fn test_reexport_requires_import() {
        let decl = ModuleDecl::feature().export_module::<LoggingModule>();
        let err = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap_err();
        assert!(err.to_string().contains(
            "Reexport from EmptyModule failed: LoggingModule includes in exports, but not includes in imports"
        ));
    }

    #[test]
    fn test_token_from_reexported_module_is_deferred() {
        let decl = ModuleDecl::feature()
            .import::<LoggingModule>()
            .export_module::<LoggingModule>()
            .export(Token::of::<Logger>());
        let meta = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap();
        assert_eq!(meta.reexported_tokens, vec![Token::of::<Logger>()]);
    }

    #[test]
    fn test_exported_group_marks_extension() {
        let decl = ModuleDecl::feature()
            .extension(ExtensionDecl::new::<RoutesExtension>(&*ROUTES))
            .export(&*ROUTES);
        let meta = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap();
        assert!(meta.extensions[0].exported);
        assert_eq!(meta.exported_extensions().count(), 1);
    }

    #[test]
    fn test_extension_without_capability_fails() {
        let decl = ModuleDecl::feature().extension(ExtensionDecl::from_class(
            &*ROUTES,
            ClassDef::of::<RoutesExtension>(),
        ));
        let err = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap_err();
        assert!(err.to_string().contains("does not implement init"));
    }

    #[test]
    fn test_extension_group_in_request_scope_fails() {
        let decl = ModuleDecl::feature()
            .providers_per_req([Provider::value(&*ROUTES, 1u8)])
            .extension(ExtensionDecl::new::<RoutesExtension>(&*ROUTES));
        let err = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap_err();
        assert!(err.to_string().contains("cannot be included in providers per request"));
    }

    #[test]
    fn test_params_contribute_providers_and_guards() {
        let params = LoggingModule::with_params()
            .prefix("logs")
            .guard(GuardItem::new::<AuthGuard>())
            .providers(Scope::Req, [Provider::value("request-id", 7u64)])
            .export("request-id");
        let module = ModuleRef::from(params);
        let meta = ModuleNormalizer::new().normalize(&module).unwrap();

        assert_eq!(meta.prefix.as_deref(), Some("logs"));
        assert_eq!(meta.guards.len(), 1);
        assert_eq!(meta.providers[Scope::Req].len(), 1);
        assert_eq!(meta.exported_providers[Scope::Req].len(), 1);
    }

    #[test]
    fn test_guard_without_capability_fails() {
        let params = LoggingModule::with_params().guard(GuardItem::from_class(ClassDef::of::<AuthGuard>()));
        let err = ModuleNormalizer::new().normalize(&params.into()).unwrap_err();
        assert!(err.to_string().contains("does not implement can_activate"));
    }

    #[test]
    fn test_multi_exports_are_split() {
        let decl = ModuleDecl::feature()
            .providers_per_mod([
                Provider::value("plugins", 1u8).multi(),
                Provider::value("plugins", 2u8).multi(),
            ])
            .export("plugins");
        let meta = normalize_decl(ModuleRef::of::<EmptyModule>(), decl).unwrap();
        assert_eq!(meta.exported_multi[Scope::Mod].len(), 2);
        assert!(meta.exported_providers[Scope::Mod].is_empty());
    }
}
