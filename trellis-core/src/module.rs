//! Module declarations.
//!
//! A module is a type implementing [`Module`]; its [`ModuleDecl`] describes
//! what it imports, which providers it declares in each scope and what it
//! hands on to importers.
//!
//! ```
//! use trellis_core::{Module, ModuleDecl, Provider};
//! # use trellis_core::{Deps, Injectable, Result};
//! # struct Cache;
//! # impl Injectable for Cache {
//! #     fn construct(_: &mut Deps) -> Result<Self> { Ok(Cache) }
//! # }
//!
//! struct CacheModule;
//!
//! impl Module for CacheModule {
//!     fn declare() -> ModuleDecl {
//!         ModuleDecl::feature()
//!             .providers_per_mod([Provider::of::<Cache>()])
//!             .export(trellis_core::Token::of::<Cache>())
//!     }
//! }
//!
//! struct AppModule;
//!
//! impl Module for AppModule {
//!     fn declare() -> ModuleDecl {
//!         ModuleDecl::root().import::<CacheModule>()
//!     }
//! }
//! ```
//!
//! The same module can be imported with parameters, which gives the import
//! its own identity:
//!
//! ```ignore
//! ModuleDecl::root().import_with_params(UsersModule::with_params().prefix("users"))
//! ```

use crate::extensions::ExtensionDecl;
use crate::guard::GuardItem;
use crate::provider::{PerScope, Provider, Scope};
use crate::token::{Token, short_type_name};
use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAMS_ID: AtomicU64 = AtomicU64::new(1);

/// Implemented by every module type
pub trait Module: 'static {
    fn declare() -> ModuleDecl;

    /// A parameterised import of this module
    fn with_params() -> ModuleWithParams
    where
        Self: Sized,
    {
        ModuleWithParams::new::<Self>()
    }
}

/// Type-erased handle to a [`Module`] implementation
#[derive(Clone, Copy)]
pub struct ModuleType {
    id: TypeId,
    name: &'static str,
    declare: fn() -> ModuleDecl,
}

impl ModuleType {
    pub fn of<M: Module>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: short_type_name(type_name::<M>()),
            declare: M::declare,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn declare(&self) -> ModuleDecl {
        (self.declare)()
    }
}

impl PartialEq for ModuleType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ModuleType {}

impl Hash for ModuleType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A module import carrying caller-supplied options.
///
/// Every call to [`ModuleWithParams::new`] creates a new identity; clones
/// share it.
#[derive(Clone)]
pub struct ModuleWithParams {
    serial: u64,
    module: ModuleType,
    pub(crate) id: Option<String>,
    pub(crate) prefix: Option<String>,
    pub(crate) guards: Vec<GuardItem>,
    pub(crate) providers: PerScope<Vec<Provider>>,
    pub(crate) exports: Vec<Token>,
}

impl ModuleWithParams {
    pub fn new<M: Module>() -> Self {
        Self {
            serial: NEXT_PARAMS_ID.fetch_add(1, Ordering::Relaxed),
            module: ModuleType::of::<M>(),
            id: None,
            prefix: None,
            guards: Vec::new(),
            providers: PerScope::default(),
            exports: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn guard(mut self, guard: GuardItem) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn providers(mut self, scope: Scope, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.providers[scope].extend(providers);
        self
    }

    pub fn export(mut self, token: impl Into<Token>) -> Self {
        self.exports.push(token.into());
        self
    }

    pub fn module_type(&self) -> ModuleType {
        self.module
    }

    pub fn name(&self) -> &'static str {
        self.module.name()
    }

    pub fn prefix_value(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn guards(&self) -> &[GuardItem] {
        &self.guards
    }
}

impl PartialEq for ModuleWithParams {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for ModuleWithParams {}

impl fmt::Debug for ModuleWithParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleWithParams")
            .field("module", &self.module.name())
            .field("serial", &self.serial)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Identity of a module in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKey {
    Type(TypeId),
    Params(u64),
}

/// Reference to a plain or parameterised module
#[derive(Clone)]
pub enum ModuleRef {
    Type(ModuleType),
    WithParams(ModuleWithParams),
}

impl ModuleRef {
    pub fn of<M: Module>() -> Self {
        ModuleRef::Type(ModuleType::of::<M>())
    }

    pub fn key(&self) -> ModuleKey {
        match self {
            ModuleRef::Type(t) => ModuleKey::Type(t.type_id()),
            ModuleRef::WithParams(p) => ModuleKey::Params(p.serial),
        }
    }

    pub fn module_type(&self) -> ModuleType {
        match self {
            ModuleRef::Type(t) => *t,
            ModuleRef::WithParams(p) => p.module,
        }
    }

    pub fn name(&self) -> &'static str {
        self.module_type().name()
    }

    pub fn params(&self) -> Option<&ModuleWithParams> {
        match self {
            ModuleRef::WithParams(p) => Some(p),
            ModuleRef::Type(_) => None,
        }
    }
}

impl PartialEq for ModuleRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ModuleRef {}

impl Hash for ModuleRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleRef::Type(t) => write!(f, "ModuleRef({})", t.name()),
            ModuleRef::WithParams(p) => write!(f, "ModuleRef({:?})", p),
        }
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<ModuleType> for ModuleRef {
    fn from(module: ModuleType) -> Self {
        ModuleRef::Type(module)
    }
}

impl From<ModuleWithParams> for ModuleRef {
    fn from(module: ModuleWithParams) -> Self {
        ModuleRef::WithParams(module)
    }
}

/// Lazily resolved module reference, used to break declaration cycles
#[derive(Clone)]
pub struct ForwardRef(Arc<dyn Fn() -> ModuleRef + Send + Sync>);

impl ForwardRef {
    pub fn new(resolve: impl Fn() -> ModuleRef + Send + Sync + 'static) -> Self {
        Self(Arc::new(resolve))
    }

    pub fn resolve(&self) -> ModuleRef {
        (self.0)()
    }
}

impl fmt::Debug for ForwardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ForwardRef(..)")
    }
}

#[derive(Clone, Debug)]
pub enum ImportItem {
    Module(ModuleRef),
    Forward(ForwardRef),
}

#[derive(Clone, Debug)]
pub enum ExportItem {
    Module(ModuleRef),
    Token(Token),
}

/// Lookup key for modules in the manager
#[derive(Clone, Debug)]
pub enum ModuleId {
    Root,
    Id(String),
    Ref(ModuleRef),
}

impl ModuleId {
    pub fn of<M: Module>() -> Self {
        ModuleId::Ref(ModuleRef::of::<M>())
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        ModuleId::Id(id.to_string())
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        ModuleId::Id(id)
    }
}

impl From<ModuleRef> for ModuleId {
    fn from(module: ModuleRef) -> Self {
        ModuleId::Ref(module)
    }
}

impl From<&ModuleRef> for ModuleId {
    fn from(module: &ModuleRef) -> Self {
        ModuleId::Ref(module.clone())
    }
}

impl From<ModuleWithParams> for ModuleId {
    fn from(module: ModuleWithParams) -> Self {
        ModuleId::Ref(ModuleRef::WithParams(module))
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleId::Root => f.write_str("root"),
            ModuleId::Id(id) => write!(f, "{}", id),
            ModuleId::Ref(module) => write!(f, "{}", module),
        }
    }
}

/// Opaque request-handling unit, consumed by the routing layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerDef {
    pub name: String,
}

impl ControllerDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Root,
    Feature,
}

/// Explicit choice of which imported module wins a token collision
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedCollision {
    pub scope: Scope,
    pub token: Token,
    pub module: ModuleRef,
}

/// Raw module declaration.
///
/// `ModuleDecl::default()` carries no marker and is rejected by the
/// normalizer; start from [`ModuleDecl::root`] or [`ModuleDecl::feature`].
#[derive(Clone, Debug, Default)]
pub struct ModuleDecl {
    pub kind: Option<ModuleKind>,
    pub id: Option<String>,
    pub imports: Vec<ImportItem>,
    pub exports: Vec<ExportItem>,
    pub providers: PerScope<Vec<Provider>>,
    pub controllers: Vec<ControllerDef>,
    pub extensions: Vec<ExtensionDecl>,
    pub resolved_collisions: Vec<ResolvedCollision>,
}

impl ModuleDecl {
    pub fn root() -> Self {
        Self {
            kind: Some(ModuleKind::Root),
            ..Self::default()
        }
    }

    pub fn feature() -> Self {
        Self {
            kind: Some(ModuleKind::Feature),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn import<M: Module>(self) -> Self {
        self.import_ref(ModuleRef::of::<M>())
    }

    pub fn import_ref(mut self, module: impl Into<ModuleRef>) -> Self {
        self.imports.push(ImportItem::Module(module.into()));
        self
    }

    pub fn import_with_params(self, module: ModuleWithParams) -> Self {
        self.import_ref(module)
    }

    pub fn import_forward(mut self, resolve: impl Fn() -> ModuleRef + Send + Sync + 'static) -> Self {
        self.imports.push(ImportItem::Forward(ForwardRef::new(resolve)));
        self
    }

    pub fn export_module<M: Module>(mut self) -> Self {
        self.exports.push(ExportItem::Module(ModuleRef::of::<M>()));
        self
    }

    pub fn export_with_params(mut self, module: ModuleWithParams) -> Self {
        self.exports.push(ExportItem::Module(ModuleRef::WithParams(module)));
        self
    }

    pub fn export(mut self, token: impl Into<Token>) -> Self {
        self.exports.push(ExportItem::Token(token.into()));
        self
    }

    pub fn providers(mut self, scope: Scope, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.providers[scope].extend(providers);
        self
    }

    pub fn providers_per_app(self, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.providers(Scope::App, providers)
    }

    pub fn providers_per_mod(self, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.providers(Scope::Mod, providers)
    }

    pub fn providers_per_rou(self, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.providers(Scope::Rou, providers)
    }

    pub fn providers_per_req(self, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.providers(Scope::Req, providers)
    }

    pub fn controller(mut self, controller: ControllerDef) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn extension(mut self, extension: ExtensionDecl) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn resolved_collision(
        mut self,
        scope: Scope,
        token: impl Into<Token>,
        module: impl Into<ModuleRef>,
    ) -> Self {
        self.resolved_collisions.push(ResolvedCollision {
            scope,
            token: token.into(),
            module: module.into(),
        });
        self
    }
}
