//! Provider scope resolver.
//!
//! Works on a scanned [`ModuleManager`] and produces, per module, the
//! merged provider lists of every scope together with the module each
//! imported provider came from. Merging goes defaults → global (root
//! exports) → imported → own, so a module always shadows what it imports.
//! Two imported definitions of one token that are not identical abort
//! resolution with a [`crate::Error::ProviderCollision`].

use crate::collisions::{Collision, collision_error, find_collisions, last_providers, push_unique, select_winners};
use crate::extensions::ExtensionDecl;
use crate::guard::GuardItem;
use crate::metadata::NormalizedMeta;
use crate::module::{ModuleKey, ModuleRef};
use crate::module_manager::ModuleManager;
use crate::provider::{PerScope, Provider, Scope};
use crate::request::{ModuleInfo, default_request_tokens};
use crate::token::Token;
use crate::{Error, Result};
use indexmap::IndexMap;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Module a provider was exported from
#[derive(Debug, Clone, PartialEq)]
pub struct SourceModule {
    pub key: ModuleKey,
    pub name: Arc<str>,
}

impl SourceModule {
    fn of(meta: &NormalizedMeta) -> Self {
        Self {
            key: meta.key(),
            name: Arc::from(meta.name.as_str()),
        }
    }
}

/// A provider as it lands in a scope; imported ones remember their source
/// so the injector can fall back to it for unexported dependencies
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEntry {
    pub provider: Provider,
    pub source: Option<SourceModule>,
}

impl ProviderEntry {
    pub fn local(provider: Provider) -> Self {
        Self { provider, source: None }
    }

    pub(crate) fn source_key(&self) -> Option<ModuleKey> {
        self.source.as_ref().map(|s| s.key)
    }
}

/// Everything the runtime needs to know about one module after resolution
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub meta: NormalizedMeta,
    /// Route prefix accumulated along parameterised imports
    pub prefix: String,
    /// Guards accumulated along parameterised imports, outermost first
    pub guards: Vec<GuardItem>,
    /// Merged providers per scope; the app slot stays empty because the
    /// application scope is shared by every module
    pub providers: PerScope<Vec<ProviderEntry>>,
    /// Imported extensions followed by the module's own
    pub extensions: Vec<ExtensionDecl>,
}

impl ResolvedModule {
    pub fn key(&self) -> ModuleKey {
        self.meta.key()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Tokens each source module contributed at `scope`
    pub fn siblings(&self, scope: Scope) -> IndexMap<ModuleKey, Vec<Token>> {
        let mut siblings: IndexMap<ModuleKey, Vec<Token>> = IndexMap::new();
        for entry in &self.providers[scope] {
            if let Some(source) = &entry.source {
                siblings
                    .entry(source.key)
                    .or_default()
                    .push(entry.provider.token.clone());
            }
        }
        siblings
    }

    pub fn providers_at(&self, scope: Scope) -> impl Iterator<Item = &Provider> {
        self.providers[scope].iter().map(|e| &e.provider)
    }
}

/// Result of resolving the whole graph
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Modules in bootstrap order: imports before importers, root last
    pub modules: Vec<ResolvedModule>,
    /// How many modules run each extension class
    pub extension_counters: HashMap<TypeId, usize>,
}

/// Collect `providers_per_app` from every non-root module, check them for
/// collisions and append the root's own declarations.
pub fn collect_providers_per_app(manager: &ModuleManager, defaults: Vec<Provider>) -> Result<Vec<Provider>> {
    let root = root_of(manager)?;

    let mut collected: Vec<ProviderEntry> = Vec::new();
    let mut visited = HashSet::from([root.key()]);
    collect_app_providers(manager, root, &mut visited, &mut collected)?;

    let root_tokens: HashSet<&Token> = root.providers[Scope::App].iter().map(|p| &p.token).collect();
    let resolved: Vec<_> = root
        .resolved_collisions
        .iter()
        .filter(|rc| rc.scope == Scope::App)
        .collect();

    let collisions = find_collisions(&collected, |token| {
        root_tokens.contains(token) || resolved.iter().any(|rc| &rc.token == token)
    });
    if !collisions.is_empty() {
        let collisions = collisions
            .into_iter()
            .map(|c| Collision {
                sources: modules_declaring_per_app(manager, &c.token),
                token: c.token,
            })
            .collect();
        return Err(collision_error(&root.name, collisions));
    }

    let mut chosen = Vec::new();
    for rc in &resolved {
        let prefix = format!(
            "Resolving collisions for providers per app in {} failed: {} mapped with {}, but ",
            root.name, rc.token, rc.module
        );
        let meta = manager
            .get_metadata(&rc.module)
            .ok_or_else(|| Error::Configuration(format!("{}{} is not imported into the application", prefix, rc.module)))?;
        let provider = last_providers(meta.providers[Scope::App].clone())
            .into_iter()
            .find(|p| p.token == rc.token)
            .ok_or_else(|| {
                Error::Configuration(format!("{}providers per app of that module do not include {}", prefix, rc.token))
            })?;
        if provider.multi {
            return Err(Error::Configuration(format!(
                "{}{} is a multi token and cannot be listed in resolved collisions",
                prefix, rc.token
            )));
        }
        chosen.push(provider);
    }

    let mut providers = defaults;
    providers.extend(last_providers(
        collected
            .into_iter()
            .filter(|e| !resolved.iter().any(|rc| rc.token == e.provider.token))
            .map(|e| e.provider)
            .collect(),
    ));
    providers.extend(chosen);
    providers.extend(root.providers[Scope::App].iter().cloned());
    debug!(root = %root.name, providers = providers.len(), "Collected providers per app");
    Ok(providers)
}

fn root_of(manager: &ModuleManager) -> Result<&NormalizedMeta> {
    manager
        .root_metadata()
        .ok_or_else(|| Error::Configuration("The root module has not been scanned".to_string()))
}

fn collect_app_providers(
    manager: &ModuleManager,
    meta: &NormalizedMeta,
    visited: &mut HashSet<ModuleKey>,
    out: &mut Vec<ProviderEntry>,
) -> Result<()> {
    let children: Vec<ModuleRef> = meta.imports().chain(meta.reexports()).collect();
    for child in children {
        if visited.insert(child.key()) {
            collect_app_providers(manager, manager.get(child.key())?, visited, out)?;
        }
    }
    if !meta.is_root() {
        let source = SourceModule::of(meta);
        for provider in &meta.providers[Scope::App] {
            out.push(ProviderEntry {
                provider: provider.clone(),
                source: Some(source.clone()),
            });
        }
    }
    Ok(())
}

fn modules_declaring_per_app(manager: &ModuleManager, token: &Token) -> Vec<String> {
    manager
        .modules()
        .filter(|meta| meta.declares(Scope::App, token))
        .map(|meta| meta.name.clone())
        .collect()
}

/// Resolves every module against the application scope and the root's
/// global exports
pub struct ModuleFactory<'a> {
    manager: &'a ModuleManager,
    app_tokens: HashSet<Token>,
    global: PerScope<Vec<ProviderEntry>>,
}

impl<'a> ModuleFactory<'a> {
    /// Prepare resolution; fails if the root's exports collide among themselves
    pub fn new(manager: &'a ModuleManager, providers_per_app: &[Provider]) -> Result<Self> {
        let root = root_of(manager)?;
        let mut seen = HashSet::from([root.key()]);
        let (exported, _) = collect_exports(manager, root, &mut seen)?;

        let mut global = PerScope::default();
        for scope in Scope::EXPORTABLE {
            // The root's own exports override what it re-exports
            let own = |token: &Token| root.declares(scope, token);
            let entries: Vec<ProviderEntry> = exported[scope]
                .iter()
                .filter(|e| e.provider.multi || !own(&e.provider.token) || e.source_key() == Some(root.key()))
                .cloned()
                .collect();
            let collisions = find_collisions(&entries, own);
            if !collisions.is_empty() {
                return Err(collision_error(&root.name, collisions));
            }
            global[scope] = select_winners(&entries, &HashMap::new(), |_| false);
        }
        debug!(
            root = %root.name,
            per_mod = global[Scope::Mod].len(),
            per_rou = global[Scope::Rou].len(),
            per_req = global[Scope::Req].len(),
            "Collected global providers"
        );

        Ok(Self {
            manager,
            app_tokens: providers_per_app.iter().map(|p| p.token.clone()).collect(),
            global,
        })
    }

    pub fn global_providers(&self, scope: Scope) -> &[ProviderEntry] {
        &self.global[scope]
    }

    /// Resolve every module reachable from the root
    pub fn resolve_all(&self, root_prefix: &str) -> Result<Resolution> {
        let root = root_of(self.manager)?;
        let mut visited = HashSet::new();
        let mut modules = Vec::new();
        self.visit(root, root_prefix.to_string(), Vec::new(), &mut visited, &mut modules)?;

        let mut extension_counters: HashMap<TypeId, usize> = HashMap::new();
        for module in &modules {
            let unique: HashSet<TypeId> = module.extensions.iter().map(|e| e.id()).collect();
            for id in unique {
                *extension_counters.entry(id).or_default() += 1;
            }
        }

        Ok(Resolution {
            modules,
            extension_counters,
        })
    }

    fn visit(
        &self,
        meta: &NormalizedMeta,
        prefix: String,
        guards: Vec<GuardItem>,
        visited: &mut HashSet<ModuleKey>,
        out: &mut Vec<ResolvedModule>,
    ) -> Result<()> {
        if !visited.insert(meta.key()) {
            return Ok(());
        }

        for imported in &meta.import_modules {
            let sub = self.manager.get(imported.key())?;
            self.visit(sub, prefix.clone(), guards.clone(), visited, out)?;
        }
        for params in &meta.import_with_params {
            let sub = self.manager.get(ModuleRef::WithParams(params.clone()).key())?;
            let child_prefix = join_prefix(&prefix, sub.prefix.as_deref().unwrap_or_default());
            let mut child_guards = guards.clone();
            child_guards.extend(sub.guards.iter().cloned());
            self.visit(sub, child_prefix, child_guards, visited, out)?;
        }

        out.push(self.resolve_module(meta, prefix, guards)?);
        Ok(())
    }

    /// Merge the providers of one module
    pub fn resolve_module(&self, meta: &NormalizedMeta, prefix: String, guards: Vec<GuardItem>) -> Result<ResolvedModule> {
        let mut imported: PerScope<Vec<ProviderEntry>> = PerScope::default();
        let mut extensions: Vec<ExtensionDecl> = Vec::new();

        for module in meta.imports() {
            let sub = self.manager.get(module.key())?;
            let mut seen = HashSet::from([meta.key(), sub.key()]);
            let (exported, exported_extensions) = collect_exports(self.manager, sub, &mut seen)?;
            for scope in Scope::EXPORTABLE {
                for entry in exported[scope].iter().cloned() {
                    push_unique(&mut imported[scope], entry);
                }
            }
            for ext in exported_extensions {
                if !extensions.iter().any(|e| e.id() == ext.id() && e.group == ext.group) {
                    extensions.push(ext);
                }
            }
        }
        for ext in &meta.extensions {
            if !extensions.iter().any(|e| e.id() == ext.id() && e.group == ext.group) {
                extensions.push(ext.clone());
            }
        }

        let mut collisions = Vec::new();
        let mut winners: PerScope<Vec<ProviderEntry>> = PerScope::default();
        for scope in Scope::EXPORTABLE {
            let resolved = self.resolved_collisions(meta, scope, &imported[scope])?;
            collisions.extend(find_collisions(&imported[scope], |token| {
                meta.declares(scope, token) || resolved.contains_key(token)
            }));
            winners[scope] = select_winners(&imported[scope], &resolved, |token| meta.declares(scope, token));
        }
        collisions.extend(self.narrowing_collisions(meta, &imported));
        if !collisions.is_empty() {
            return Err(collision_error(&meta.name, collisions));
        }

        let info = ModuleInfo {
            name: meta.name.clone(),
            id: meta.id.clone(),
            prefix: prefix.clone(),
            is_root: meta.is_root(),
        };

        let mut providers: PerScope<Vec<ProviderEntry>> = PerScope::default();
        providers[Scope::Mod].push(ProviderEntry::local(Provider::value(Token::of::<ModuleInfo>(), info)));
        for scope in Scope::EXPORTABLE {
            if !meta.is_root() {
                // Multi globals always come first and are only skipped when
                // the same registration also arrives through an import
                let keep = |global: &ProviderEntry| {
                    let token = &global.provider.token;
                    if global.provider.multi {
                        return !imported[scope].iter().any(|e| {
                            e.source_key() == global.source_key() && e.provider == global.provider
                        });
                    }
                    !meta.declares(scope, token) && !imported[scope].iter().any(|e| &e.provider.token == token)
                };
                providers[scope].extend(self.global[scope].iter().filter(|e| keep(e)).cloned());
            }
            providers[scope].extend(std::mem::take(&mut winners[scope]));
            providers[scope].extend(meta.providers[scope].iter().cloned().map(ProviderEntry::local));
        }

        debug!(
            module = %meta.name,
            prefix = %prefix,
            per_mod = providers[Scope::Mod].len(),
            per_rou = providers[Scope::Rou].len(),
            per_req = providers[Scope::Req].len(),
            extensions = extensions.len(),
            "Resolved module providers"
        );

        Ok(ResolvedModule {
            meta: meta.clone(),
            prefix,
            guards,
            providers,
            extensions,
        })
    }

    /// Validate explicit collision choices for `scope`
    fn resolved_collisions(
        &self,
        meta: &NormalizedMeta,
        scope: Scope,
        imported: &[ProviderEntry],
    ) -> Result<HashMap<Token, ModuleKey>> {
        let mut resolved = HashMap::new();
        for rc in meta.resolved_collisions.iter().filter(|rc| rc.scope == scope) {
            let prefix = format!(
                "Resolving collisions for providers per {} in {} failed: {} mapped with {}, but ",
                scope, meta.name, rc.token, rc.module
            );
            let source = self.manager.get_metadata(&rc.module).ok_or_else(|| {
                Error::Configuration(format!("{}{} is not imported into the application", prefix, rc.module))
            })?;
            let Some(provider) = source.providers[scope].iter().rev().find(|p| p.token == rc.token) else {
                return Err(Error::Configuration(format!(
                    "{}providers per {} of {} do not include {}",
                    prefix, scope, rc.module, rc.token
                )));
            };
            if provider.multi {
                return Err(Error::Configuration(format!(
                    "{}{} is a multi token and cannot be listed in resolved collisions",
                    prefix, rc.token
                )));
            }
            let key = source.key();
            if !imported
                .iter()
                .any(|e| e.source_key() == Some(key) && e.provider.token == rc.token)
            {
                return Err(Error::Configuration(format!(
                    "{}{} does not export it into {}",
                    prefix, rc.module, meta.name
                )));
            }
            resolved.insert(rc.token.clone(), key);
        }
        Ok(resolved)
    }

    /// Imported tokens that are also reachable from a wider scope without a
    /// local declaration at the narrower one
    fn narrowing_collisions(&self, meta: &NormalizedMeta, imported: &PerScope<Vec<ProviderEntry>>) -> Vec<Collision> {
        let default_req = default_request_tokens();
        let module_info = Token::of::<ModuleInfo>();
        let mut collisions: Vec<Collision> = Vec::new();

        for scope in Scope::EXPORTABLE {
            for entry in &imported[scope] {
                let token = &entry.provider.token;
                if meta.declares(scope, token) || collisions.iter().any(|c| &c.token == token) {
                    continue;
                }
                let wider = scope.wider().iter().any(|outer| match *outer {
                    Scope::App => self.app_tokens.contains(token),
                    outer => {
                        meta.declares(outer, token)
                            || imported[outer].iter().any(|e| &e.provider.token == token)
                            || (outer == Scope::Mod && token == &module_info)
                    }
                });
                let shadows_default = scope == Scope::Req && default_req.contains(token);
                if wider || shadows_default {
                    let sources = entry.source.iter().map(|s| s.name.to_string()).collect();
                    collisions.push(Collision {
                        token: token.clone(),
                        sources,
                    });
                }
            }
        }
        collisions
    }
}

/// Providers and extensions `meta` hands to an importer, following re-exports
fn collect_exports(
    manager: &ModuleManager,
    meta: &NormalizedMeta,
    seen: &mut HashSet<ModuleKey>,
) -> Result<(PerScope<Vec<ProviderEntry>>, Vec<ExtensionDecl>)> {
    let mut out: PerScope<Vec<ProviderEntry>> = PerScope::default();
    let mut extensions = Vec::new();

    let reexports: Vec<ModuleRef> = meta.reexports().collect();
    for module in reexports {
        if !seen.insert(module.key()) {
            continue;
        }
        let sub = manager.get(module.key())?;
        let (exported, exported_extensions) = collect_exports(manager, sub, seen)?;
        for scope in Scope::EXPORTABLE {
            for entry in exported[scope].iter().cloned() {
                push_unique(&mut out[scope], entry);
            }
        }
        extensions.extend(exported_extensions);
    }

    let source = SourceModule::of(meta);
    for scope in Scope::EXPORTABLE {
        for provider in meta.exported_at(scope) {
            push_unique(
                &mut out[scope],
                ProviderEntry {
                    provider: provider.clone(),
                    source: Some(source.clone()),
                },
            );
        }
    }
    extensions.extend(meta.exported_extensions().cloned());
    Ok((out, extensions))
}

fn join_prefix(parent: &str, child: &str) -> String {
    [parent, child]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}
