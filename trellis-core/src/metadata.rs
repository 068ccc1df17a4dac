//! Normalized module metadata

use crate::extensions::ExtensionDecl;
use crate::guard::GuardItem;
use crate::module::{ControllerDef, ModuleKey, ModuleKind, ModuleRef, ModuleWithParams, ResolvedCollision};
use crate::provider::{PerScope, Provider, Scope};
use crate::token::Token;

/// Canonical form of one module declaration, produced once per module
/// identity and compared structurally.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMeta {
    pub module: ModuleRef,
    pub name: String,
    pub id: Option<String>,
    pub kind: ModuleKind,
    /// Plain imports, including resolved forward references
    pub import_modules: Vec<ModuleRef>,
    pub import_with_params: Vec<ModuleWithParams>,
    /// Imports that were declared through a forward reference
    pub forward_imports: Vec<ModuleKey>,
    pub export_modules: Vec<ModuleRef>,
    pub export_with_params: Vec<ModuleWithParams>,
    /// Providers declared by the module itself, parameters included
    pub providers: PerScope<Vec<Provider>>,
    pub exported_providers: PerScope<Vec<Provider>>,
    pub exported_multi: PerScope<Vec<Provider>>,
    /// Exported tokens that must come from re-exported modules
    pub reexported_tokens: Vec<Token>,
    pub controllers: Vec<ControllerDef>,
    pub extensions: Vec<ExtensionDecl>,
    pub resolved_collisions: Vec<ResolvedCollision>,
    pub prefix: Option<String>,
    pub guards: Vec<GuardItem>,
}

impl NormalizedMeta {
    pub fn key(&self) -> ModuleKey {
        self.module.key()
    }

    pub fn is_root(&self) -> bool {
        self.kind == ModuleKind::Root
    }

    /// Plain imports followed by parameterised ones
    pub fn imports(&self) -> impl Iterator<Item = ModuleRef> + '_ {
        self.import_modules
            .iter()
            .cloned()
            .chain(self.import_with_params.iter().cloned().map(ModuleRef::WithParams))
    }

    pub fn reexports(&self) -> impl Iterator<Item = ModuleRef> + '_ {
        self.export_modules
            .iter()
            .cloned()
            .chain(self.export_with_params.iter().cloned().map(ModuleRef::WithParams))
    }

    pub fn imports_key(&self, key: ModuleKey) -> bool {
        self.imports().any(|m| m.key() == key)
    }

    pub fn is_forward_import(&self, key: ModuleKey) -> bool {
        self.forward_imports.contains(&key)
    }

    /// Ordinary then multi providers this module exports at `scope`
    pub fn exported_at(&self, scope: Scope) -> impl Iterator<Item = &Provider> {
        self.exported_providers[scope]
            .iter()
            .chain(self.exported_multi[scope].iter())
    }

    pub fn exported_extensions(&self) -> impl Iterator<Item = &ExtensionDecl> {
        self.extensions.iter().filter(|e| e.exported)
    }

    pub fn declares(&self, scope: Scope, token: &Token) -> bool {
        self.providers[scope].iter().any(|p| &p.token == token)
    }

    pub(crate) fn remove_import(&mut self, key: ModuleKey) -> bool {
        let before = self.import_modules.len() + self.import_with_params.len();
        self.import_modules.retain(|m| m.key() != key);
        self.import_with_params
            .retain(|p| ModuleRef::WithParams(p.clone()).key() != key);
        self.export_modules.retain(|m| m.key() != key);
        self.export_with_params
            .retain(|p| ModuleRef::WithParams(p.clone()).key() != key);
        self.forward_imports.retain(|k| *k != key);
        before != self.import_modules.len() + self.import_with_params.len()
    }

    pub(crate) fn add_import(&mut self, module: ModuleRef) {
        match module {
            ModuleRef::WithParams(params) => self.import_with_params.push(params),
            plain => self.import_modules.push(plain),
        }
    }
}
