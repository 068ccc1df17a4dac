//! Provider model.
//!
//! A [`Provider`] binds a [`Token`] to one of four strategies: construct a
//! class, hand out a shared value, alias another token, or call a factory.
//! Classes take the place of constructor reflection through the
//! [`Injectable`] trait:
//!
//! ```
//! use std::sync::Arc;
//! use trellis_core::{Deps, Injectable, Provider, Result};
//!
//! struct Config;
//! impl Injectable for Config {
//!     fn construct(_: &mut Deps) -> Result<Self> {
//!         Ok(Config)
//!     }
//! }
//!
//! struct Repo {
//!     config: Arc<Config>,
//! }
//!
//! impl Injectable for Repo {
//!     fn dependencies() -> Vec<trellis_core::Token> {
//!         vec![trellis_core::Token::of::<Config>()]
//!     }
//!
//!     fn construct(deps: &mut Deps) -> Result<Self> {
//!         Ok(Repo { config: deps.next()? })
//!     }
//! }
//!
//! let providers = vec![Provider::of::<Config>(), Provider::of::<Repo>()];
//! assert_eq!(providers.len(), 2);
//! ```

use crate::extensions::Extension;
use crate::guard::Guard;
use crate::token::{Token, TypeToken, short_type_name};
use crate::{Error, Result};
use std::any::{Any, TypeId, type_name};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// A resolved, type-erased provider instance
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Lifetime and visibility layer of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    App,
    Mod,
    Rou,
    Req,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::App, Scope::Mod, Scope::Rou, Scope::Req];

    /// Scopes a module can export into
    pub const EXPORTABLE: [Scope; 3] = [Scope::Mod, Scope::Rou, Scope::Req];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::App => "app",
            Scope::Mod => "mod",
            Scope::Rou => "rou",
            Scope::Req => "req",
        }
    }

    /// Scopes that outlive this one, outermost first
    pub fn wider(&self) -> &'static [Scope] {
        match self {
            Scope::App => &[],
            Scope::Mod => &[Scope::App],
            Scope::Rou => &[Scope::App, Scope::Mod],
            Scope::Req => &[Scope::App, Scope::Mod, Scope::Rou],
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per scope, indexed by [`Scope`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PerScope<T> {
    items: [T; 4],
}

impl<T> PerScope<T> {
    pub fn from_fn(mut f: impl FnMut(Scope) -> T) -> Self {
        Self {
            items: Scope::ALL.map(&mut f),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Scope, &T)> {
        Scope::ALL.into_iter().zip(self.items.iter())
    }
}

impl<T> Index<Scope> for PerScope<T> {
    type Output = T;

    fn index(&self, scope: Scope) -> &T {
        &self.items[scope.index()]
    }
}

impl<T> IndexMut<Scope> for PerScope<T> {
    fn index_mut(&mut self, scope: Scope) -> &mut T {
        &mut self.items[scope.index()]
    }
}

/// Dependencies handed to a constructor, in the order they were declared
pub struct Deps {
    consumer: &'static str,
    values: VecDeque<(Token, Instance)>,
}

impl Deps {
    pub(crate) fn new(consumer: &'static str, values: Vec<(Token, Instance)>) -> Self {
        Self {
            consumer,
            values: values.into(),
        }
    }

    pub fn consumer(&self) -> &'static str {
        self.consumer
    }

    /// Take the next dependency as a type-erased instance
    pub fn next_instance(&mut self) -> Result<Instance> {
        self.pop().map(|(_, value)| value)
    }

    /// Take the next dependency and downcast it
    pub fn next<T: Any + Send + Sync>(&mut self) -> Result<Arc<T>> {
        let (token, value) = self.pop()?;
        downcast(value, &token, self.consumer)
    }

    /// Take the next dependency, which must be a multi token
    pub fn next_multi(&mut self) -> Result<Vec<Instance>> {
        let (token, value) = self.pop()?;
        let list = downcast::<Vec<Instance>>(value, &token, self.consumer)?;
        Ok(list.as_ref().clone())
    }

    /// Take the next multi dependency and downcast every element
    pub fn next_multi_as<T: Any + Send + Sync>(&mut self) -> Result<Vec<Arc<T>>> {
        let (token, value) = self.pop()?;
        let list = downcast::<Vec<Instance>>(value, &token, self.consumer)?;
        list.iter()
            .map(|item| downcast(item.clone(), &token, self.consumer))
            .collect()
    }

    fn pop(&mut self) -> Result<(Token, Instance)> {
        self.values.pop_front().ok_or_else(|| {
            Error::Configuration(format!(
                "{} requested more dependencies than it declares",
                self.consumer
            ))
        })
    }
}

pub(crate) fn downcast<T: Any + Send + Sync>(
    value: Instance,
    token: &Token,
    consumer: &str,
) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| {
        Error::ProviderNotFound(format!(
            "Provider for {} is not a {}; required by {}",
            token,
            short_type_name(type_name::<T>()),
            consumer
        ))
    })
}

/// Reflection-free constructor metadata
pub trait Injectable: Sized + Send + Sync + 'static {
    /// Tokens resolved and passed to [`Injectable::construct`], in order
    fn dependencies() -> Vec<Token> {
        Vec::new()
    }

    fn construct(deps: &mut Deps) -> Result<Self>;
}

type GuardCast = fn(&Instance) -> Option<Arc<dyn Guard>>;
type ExtensionCast = fn(&Instance) -> Option<Arc<dyn Extension>>;

fn construct_erased<T: Injectable>(deps: &mut Deps) -> Result<Instance> {
    Ok(Arc::new(T::construct(deps)?))
}

fn cast_guard<T: Guard + Any>(instance: &Instance) -> Option<Arc<dyn Guard>> {
    Arc::clone(instance)
        .downcast::<T>()
        .ok()
        .map(|guard| guard as Arc<dyn Guard>)
}

fn cast_extension<T: Extension + Any>(instance: &Instance) -> Option<Arc<dyn Extension>> {
    Arc::clone(instance)
        .downcast::<T>()
        .ok()
        .map(|ext| ext as Arc<dyn Extension>)
}

/// A constructible class; identity is the implementing type
#[derive(Clone)]
pub struct ClassDef {
    ty: TypeToken,
    deps: Vec<Token>,
    construct: fn(&mut Deps) -> Result<Instance>,
    as_guard: Option<GuardCast>,
    as_extension: Option<ExtensionCast>,
}

impl ClassDef {
    pub fn of<T: Injectable>() -> Self {
        Self {
            ty: TypeToken::of::<T>(),
            deps: T::dependencies(),
            construct: construct_erased::<T>,
            as_guard: None,
            as_extension: None,
        }
    }

    /// A class that can gate routes
    pub fn guard<T: Injectable + Guard>() -> Self {
        Self {
            as_guard: Some(cast_guard::<T>),
            ..Self::of::<T>()
        }
    }

    /// A class that can contribute to extension groups
    pub fn extension<T: Injectable + Extension>() -> Self {
        Self {
            as_extension: Some(cast_extension::<T>),
            ..Self::of::<T>()
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.ty.type_id()
    }

    pub fn name(&self) -> &'static str {
        self.ty.name()
    }

    pub fn token(&self) -> Token {
        Token::Type(self.ty)
    }

    pub fn dependencies(&self) -> &[Token] {
        &self.deps
    }

    pub fn is_guard(&self) -> bool {
        self.as_guard.is_some()
    }

    pub fn is_extension(&self) -> bool {
        self.as_extension.is_some()
    }

    pub(crate) fn construct(&self, deps: &mut Deps) -> Result<Instance> {
        (self.construct)(deps)
    }

    pub(crate) fn to_guard(&self, instance: &Instance) -> Option<Arc<dyn Guard>> {
        self.as_guard.and_then(|cast| cast(instance))
    }

    pub(crate) fn to_extension(&self, instance: &Instance) -> Option<Arc<dyn Extension>> {
        self.as_extension.and_then(|cast| cast(instance))
    }
}

impl PartialEq for ClassDef {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.ty.name())
            .field("deps", &self.deps)
            .finish()
    }
}

type FactoryFn = dyn Fn(&mut Deps) -> Result<Instance> + Send + Sync;

/// A factory function; identity is the function's own type, so two
/// providers built from the same `fn` item are identical.
#[derive(Clone)]
pub struct FactoryDef {
    id: TypeId,
    name: &'static str,
    deps: Vec<Token>,
    call: Arc<FactoryFn>,
}

impl FactoryDef {
    pub fn new<F, T>(deps: impl IntoIterator<Item = Token>, factory: F) -> Self
    where
        F: Fn(&mut Deps) -> Result<T> + Send + Sync + 'static,
        T: Any + Send + Sync,
    {
        Self {
            id: TypeId::of::<F>(),
            name: short_type_name(type_name::<F>()),
            deps: deps.into_iter().collect(),
            call: Arc::new(move |deps: &mut Deps| Ok(Arc::new(factory(deps)?) as Instance)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dependencies(&self) -> &[Token] {
        &self.deps
    }

    pub(crate) fn call(&self, deps: &mut Deps) -> Result<Instance> {
        (self.call)(deps)
    }
}

impl fmt::Debug for FactoryDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryDef")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .finish()
    }
}

#[derive(Clone)]
pub enum Strategy {
    UseClass(ClassDef),
    UseValue(Instance),
    UseExisting(Token),
    UseFactory(FactoryDef),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::UseClass(class) => write!(f, "UseClass({})", class.name()),
            Strategy::UseValue(_) => f.write_str("UseValue(..)"),
            Strategy::UseExisting(token) => write!(f, "UseExisting({})", token),
            Strategy::UseFactory(factory) => write!(f, "UseFactory({})", factory.name()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Provider {
    pub token: Token,
    pub strategy: Strategy,
    pub multi: bool,
}

impl Provider {
    /// `T` bound to its own type token
    pub fn of<T: Injectable>() -> Self {
        Self::class(Token::of::<T>(), ClassDef::of::<T>())
    }

    pub fn class(token: impl Into<Token>, class: ClassDef) -> Self {
        Self {
            token: token.into(),
            strategy: Strategy::UseClass(class),
            multi: false,
        }
    }

    /// A freshly allocated value; every call creates a distinct definition
    pub fn value<V: Any + Send + Sync>(token: impl Into<Token>, value: V) -> Self {
        Self::instance(token, Arc::new(value))
    }

    /// An already shared value; clones of the same `Arc` are identical definitions
    pub fn instance(token: impl Into<Token>, value: Instance) -> Self {
        Self {
            token: token.into(),
            strategy: Strategy::UseValue(value),
            multi: false,
        }
    }

    pub fn existing(token: impl Into<Token>, target: impl Into<Token>) -> Self {
        Self {
            token: token.into(),
            strategy: Strategy::UseExisting(target.into()),
            multi: false,
        }
    }

    pub fn factory(token: impl Into<Token>, factory: FactoryDef) -> Self {
        Self {
            token: token.into(),
            strategy: Strategy::UseFactory(factory),
            multi: false,
        }
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    /// Same token and same strategy target.
    ///
    /// Classes match on implementation type, values on allocation, aliases
    /// on target token and factories on the wrapped function.
    pub fn is_identical(&self, other: &Provider) -> bool {
        if self.token != other.token {
            return false;
        }
        match (&self.strategy, &other.strategy) {
            (Strategy::UseClass(a), Strategy::UseClass(b)) => a == b,
            (Strategy::UseValue(a), Strategy::UseValue(b)) => Arc::ptr_eq(a, b),
            (Strategy::UseExisting(a), Strategy::UseExisting(b)) => a == b,
            (Strategy::UseFactory(a), Strategy::UseFactory(b)) => a.id == b.id,
            _ => false,
        }
    }

    pub(crate) fn class_def(&self) -> Option<&ClassDef> {
        match &self.strategy {
            Strategy::UseClass(class) => Some(class),
            _ => None,
        }
    }
}

impl PartialEq for Provider {
    fn eq(&self, other: &Self) -> bool {
        self.multi == other.multi && self.is_identical(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Logger: Send + Sync {}

    struct ConsoleLogger;
    impl Injectable for ConsoleLogger {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(ConsoleLogger)
        }
    }

    struct FileLogger;
    impl Injectable for FileLogger {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(FileLogger)
        }
    }

    fn make_port(_: &mut Deps) -> Result<u16> {
        Ok(8080)
    }

    #[test]
    fn test_class_identity() {
        let token = Token::of::<dyn Logger>();
        let a = Provider::class(&token, ClassDef::of::<ConsoleLogger>());
        let b = Provider::class(&token, ClassDef::of::<ConsoleLogger>());
        let c = Provider::class(&token, ClassDef::of::<FileLogger>());

        assert!(a.is_identical(&b));
        assert!(!a.is_identical(&c));
    }

    #[test]
    fn test_value_identity_is_by_allocation() {
        let shared: Instance = Arc::new(42u32);
        let a = Provider::instance("answer", shared.clone());
        let b = Provider::instance("answer", shared);
        let c = Provider::value("answer", 42u32);

        assert!(a.is_identical(&b));
        assert!(!a.is_identical(&c));
    }

    #[test]
    fn test_factory_identity_is_by_function() {
        let a = Provider::factory("port", FactoryDef::new([], make_port));
        let b = Provider::factory("port", FactoryDef::new([], make_port));
        let c = Provider::factory("port", FactoryDef::new([], |_: &mut Deps| Ok(8080u16)));

        assert!(a.is_identical(&b));
        assert!(!a.is_identical(&c));
    }

    #[test]
    fn test_alias_identity_and_token_mismatch() {
        let a = Provider::existing("logger", Token::of::<ConsoleLogger>());
        let b = Provider::existing("logger", Token::of::<ConsoleLogger>());
        let c = Provider::existing("other", Token::of::<ConsoleLogger>());

        assert!(a.is_identical(&b));
        assert!(!a.is_identical(&c));
    }

    #[test]
    fn test_equality_includes_multi_flag() {
        let a = Provider::of::<ConsoleLogger>();
        assert_eq!(a, Provider::of::<ConsoleLogger>());
        assert_ne!(a, Provider::of::<ConsoleLogger>().multi());
    }

    #[test]
    fn test_deps_downcast_errors_name_consumer() {
        let mut deps = Deps::new("Repo", vec![(Token::named("port"), Arc::new(1u8) as Instance)]);
        let err = deps.next::<String>().unwrap_err();
        assert!(err.to_string().contains("required by Repo"));
        assert!(deps.next_instance().is_err());
    }

    #[test]
    fn test_per_scope_indexing() {
        let mut per_scope: PerScope<Vec<u8>> = PerScope::default();
        per_scope[Scope::Req].push(1);
        assert_eq!(per_scope[Scope::Req], vec![1]);
        assert!(per_scope[Scope::App].is_empty());
        assert_eq!(Scope::Req.wider(), &[Scope::App, Scope::Mod, Scope::Rou]);
    }
}
