//! Hierarchical injector runtime.
//!
//! Injectors form a chain `app ⊃ mod ⊃ rou ⊃ req`. A lookup walks outward
//! from the injector it starts on; the provider is instantiated in the
//! injector that declares it and cached there, so module and route
//! instances live as long as their injector while request instances are
//! rebuilt for every request.
//!
//! Imported providers remember the module they came from. When one of
//! their dependencies is missing from the importer's chain, resolution
//! falls through to a *sibling* injector: the source module's injector at
//! the same scope.

use crate::module::ModuleKey;
use crate::module_factory::ProviderEntry;
use crate::provider::{ClassDef, Deps, Instance, Provider, Scope, Strategy, downcast};
use crate::request::{RequestContext, default_request_tokens};
use crate::token::Token;
use crate::{Error, Result};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

enum Record {
    Single(ProviderEntry),
    Multi(Vec<ProviderEntry>),
}

fn build_records(entries: Vec<ProviderEntry>) -> IndexMap<Token, Record> {
    let mut records: IndexMap<Token, Record> = IndexMap::new();
    for entry in entries {
        let token = entry.provider.token.clone();
        if entry.provider.multi {
            match records.get_mut(&token) {
                Some(Record::Multi(list)) => list.push(entry),
                _ => {
                    records.insert(token, Record::Multi(vec![entry]));
                }
            }
        } else {
            records.insert(token, Record::Single(entry));
        }
    }
    records
}

struct Inner {
    scope: Scope,
    name: String,
    records: IndexMap<Token, Record>,
    parent: Option<Injector>,
    registry: Weak<InjectorRegistry>,
    cache: Mutex<HashMap<Token, Instance>>,
    /// Request-scope siblings built on demand for this injector
    siblings: Mutex<HashMap<ModuleKey, Injector>>,
}

/// One lookup scope of the chain; cheap to clone
#[derive(Clone)]
pub struct Injector {
    inner: Arc<Inner>,
}

impl Injector {
    fn build(
        scope: Scope,
        name: impl Into<String>,
        entries: Vec<ProviderEntry>,
        parent: Option<Injector>,
        registry: Weak<InjectorRegistry>,
    ) -> Self {
        let inner = Inner {
            scope,
            name: name.into(),
            records: build_records(entries),
            parent,
            registry,
            cache: Mutex::new(HashMap::new()),
            siblings: Mutex::new(HashMap::new()),
        };
        trace!(scope = %inner.scope, injector = %inner.name, providers = inner.records.len(), "Created injector");
        Self { inner: Arc::new(inner) }
    }

    /// Application-scope injector bound to `registry` for sibling lookups
    pub fn root(providers: Vec<Provider>, registry: &Arc<InjectorRegistry>) -> Self {
        let entries = providers.into_iter().map(ProviderEntry::local).collect();
        Self::build(Scope::App, "application", entries, None, Arc::downgrade(registry))
    }

    /// A standalone injector without parent or siblings
    pub fn detached(scope: Scope, name: impl Into<String>, providers: Vec<Provider>) -> Self {
        let entries = providers.into_iter().map(ProviderEntry::local).collect();
        Self::build(scope, name, entries, None, Weak::new())
    }

    /// A nested scope whose lookups fall back to `self`
    pub fn child(&self, scope: Scope, name: impl Into<String>, entries: Vec<ProviderEntry>) -> Self {
        Self::build(scope, name, entries, Some(self.clone()), self.inner.registry.clone())
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<&Injector> {
        self.inner.parent.as_ref()
    }

    /// Whether `token` is declared anywhere in this chain
    pub fn has(&self, token: impl Into<Token>) -> bool {
        let token = token.into();
        self.owner_of(&token).is_some()
    }

    /// Resolve `token`, instantiating it on first use
    pub fn get(&self, token: impl Into<Token>) -> Result<Instance> {
        let token = token.into();
        self.lookup(&token, &mut Vec::new())?
            .ok_or_else(|| Error::ProviderNotFound(format!("No provider for {}", token)))
    }

    /// Resolve `token` and downcast the instance to `T`
    pub fn get_as<T: Any + Send + Sync>(&self, token: impl Into<Token>) -> Result<Arc<T>> {
        let token = token.into();
        let instance = self.get(&token)?;
        downcast(instance, &token, &self.inner.name)
    }

    /// Resolve a multi token into its list of instances
    pub fn get_multi(&self, token: impl Into<Token>) -> Result<Vec<Instance>> {
        let token = token.into();
        let list = self.get_as::<Vec<Instance>>(&token)?;
        Ok(list.as_ref().clone())
    }

    /// Build a fresh, uncached instance of `class` with dependencies from
    /// this chain
    pub fn instantiate(&self, class: &ClassDef) -> Result<Instance> {
        let mut path = Vec::new();
        let mut deps = self.resolve_deps(class.name(), class.dependencies(), None, &mut path)?;
        class.construct(&mut deps)
    }

    fn owner_of(&self, token: &Token) -> Option<(&Injector, &Record)> {
        let mut current = Some(self);
        while let Some(injector) = current {
            if let Some(record) = injector.inner.records.get(token) {
                return Some((injector, record));
            }
            current = injector.inner.parent.as_ref();
        }
        None
    }

    /// `Ok(None)` when no injector of the chain declares `token`
    fn lookup(&self, token: &Token, path: &mut Vec<Token>) -> Result<Option<Instance>> {
        let Some((owner, record)) = self.owner_of(token) else {
            return Ok(None);
        };
        if let Some(instance) = owner.inner.cache.lock().get(token) {
            return Ok(Some(instance.clone()));
        }

        if let Some(pos) = path.iter().position(|t| t == token) {
            let chain: Vec<String> = path[pos..]
                .iter()
                .chain([token])
                .map(|t| t.to_string())
                .collect();
            let mut msg = format!("Detected circular dependencies: {}.", chain.join(" -> "));
            if pos > 0 {
                let prefix: Vec<String> = path[..pos].iter().map(|t| t.to_string()).collect();
                msg.push_str(&format!(" It is started from {}.", prefix.join(" -> ")));
            }
            return Err(Error::CircularDependency(msg));
        }

        path.push(token.clone());
        let created = match record {
            Record::Single(entry) => owner.create(entry, path),
            Record::Multi(entries) => entries
                .iter()
                .map(|entry| owner.create(entry, path))
                .collect::<Result<Vec<Instance>>>()
                .map(|list| Arc::new(list) as Instance),
        };
        path.pop();
        let instance = created?;

        // The first instance stored wins if another caller got here first
        let mut cache = owner.inner.cache.lock();
        Ok(Some(cache.entry(token.clone()).or_insert(instance).clone()))
    }

    fn create(&self, entry: &ProviderEntry, path: &mut Vec<Token>) -> Result<Instance> {
        match &entry.provider.strategy {
            Strategy::UseValue(value) => Ok(value.clone()),
            Strategy::UseExisting(target) => self.lookup(target, path)?.ok_or_else(|| {
                Error::ProviderNotFound(format!(
                    "No provider for {}; required by {}",
                    target, entry.provider.token
                ))
            }),
            Strategy::UseClass(class) => {
                let mut deps = self.resolve_deps(class.name(), class.dependencies(), Some(entry), path)?;
                class.construct(&mut deps)
            }
            Strategy::UseFactory(factory) => {
                let mut deps = self.resolve_deps(factory.name(), factory.dependencies(), Some(entry), path)?;
                factory.call(&mut deps)
            }
        }
    }

    fn resolve_deps(
        &self,
        consumer: &'static str,
        tokens: &[Token],
        entry: Option<&ProviderEntry>,
        path: &mut Vec<Token>,
    ) -> Result<Deps> {
        let mut values = Vec::with_capacity(tokens.len());
        for token in tokens {
            let mut found = self.lookup(token, path)?;
            if found.is_none()
                && let Some(source) = entry.and_then(ProviderEntry::source_key)
                && let Some(sibling) = self.sibling(source)?
            {
                trace!(token = %token, consumer, sibling = %sibling.name(), "Resolving through sibling injector");
                found = sibling.lookup(token, path)?;
            }
            let instance = found.ok_or_else(|| {
                Error::ProviderNotFound(format!("No provider for {}; required by {}", token, consumer))
            })?;
            values.push((token.clone(), instance));
        }
        Ok(Deps::new(consumer, values))
    }

    /// The source module's injector at this injector's scope
    fn sibling(&self, source: ModuleKey) -> Result<Option<Injector>> {
        let Some(registry) = self.inner.registry.upgrade() else {
            return Ok(None);
        };
        let Some(module) = registry.get(source) else {
            return Ok(None);
        };
        let sibling = match self.inner.scope {
            Scope::App => None,
            Scope::Mod => Some(module.module.clone()),
            Scope::Rou => Some(module.route.clone()),
            Scope::Req => {
                let mut siblings = self.inner.siblings.lock();
                let injector = siblings
                    .entry(source)
                    .or_insert_with(|| module.request_injector(self.request_seeds()))
                    .clone();
                Some(injector)
            }
        };
        Ok(sibling)
    }

    /// Request seeds declared on this request injector, reused by siblings
    fn request_seeds(&self) -> Vec<ProviderEntry> {
        let seeds = default_request_tokens();
        self.inner
            .records
            .values()
            .filter_map(|record| match record {
                Record::Single(entry) if entry.source.is_none() => Some(entry.clone()),
                _ => None,
            })
            .filter(|entry| seeds.contains(&entry.provider.token))
            .collect()
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("scope", &self.inner.scope)
            .field("name", &self.inner.name)
            .field("tokens", &self.inner.records.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Injectors of one module, built at bootstrap
#[derive(Clone, Debug)]
pub struct ModuleInjectors {
    pub name: String,
    pub module: Injector,
    pub route: Injector,
    pub req_providers: Arc<Vec<ProviderEntry>>,
}

impl ModuleInjectors {
    fn request_injector(&self, seeds: Vec<ProviderEntry>) -> Injector {
        let mut entries = seeds;
        entries.extend(self.req_providers.iter().cloned());
        self.route.child(Scope::Req, self.name.clone(), entries)
    }

    pub fn route_injector(&self) -> RouteInjector {
        RouteInjector {
            name: self.name.clone(),
            injector: self.route.clone(),
            req_providers: self.req_providers.clone(),
        }
    }
}

/// Every module's injectors, keyed by module identity
#[derive(Default)]
pub struct InjectorRegistry {
    modules: RwLock<HashMap<ModuleKey, ModuleInjectors>>,
}

impl InjectorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, key: ModuleKey, injectors: ModuleInjectors) {
        debug!(module = %injectors.name, "Registered module injectors");
        self.modules.write().insert(key, injectors);
    }

    pub fn get(&self, key: ModuleKey) -> Option<ModuleInjectors> {
        self.modules.read().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}

/// Builds the request scope of one module's routes
#[derive(Clone, Debug)]
pub struct RouteInjector {
    name: String,
    injector: Injector,
    req_providers: Arc<Vec<ProviderEntry>>,
}

impl RouteInjector {
    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    /// A fresh request injector seeded from `context`
    pub fn request(&self, context: RequestContext) -> Injector {
        let mut entries: Vec<ProviderEntry> = context
            .into_providers()
            .into_iter()
            .map(ProviderEntry::local)
            .collect();
        entries.extend(self.req_providers.iter().cloned());
        self.injector.child(Scope::Req, self.name.clone(), entries)
    }
}
