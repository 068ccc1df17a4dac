//! Extension orchestration for one module.
//!
//! A fresh [`ExtensionsManager`] is created per module at bootstrap. It
//! initializes each group at most once per merge mode, runs every
//! extension instance at most once per group, and keeps a stack of the
//! groups and extensions currently initializing so that a dependency loop
//! is reported instead of awaited forever. State shared between modules
//! (remaining-call counters and collected partial results) lives in an
//! [`ExtensionsContext`].

use crate::extensions::{Extension, ExtensionData, ExtensionDecl, GroupData, GroupKey, InitOptions};
use crate::injector::Injector;
use crate::provider::Instance;
use crate::token::Token;
use crate::{Error, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Cross-module state of one bootstrap
#[derive(Debug, Default)]
pub struct ExtensionsContext {
    counters: Mutex<HashMap<TypeId, usize>>,
    collected: Mutex<HashMap<(TypeId, GroupKey), Vec<Instance>>>,
}

impl ExtensionsContext {
    /// `counters` holds, per extension class, how many modules run it
    pub fn new(counters: HashMap<TypeId, usize>) -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(counters),
            collected: Mutex::new(HashMap::new()),
        })
    }

    /// Count one more module as started for each extension class it runs
    pub fn decrease_counters(&self, extensions: &[ExtensionDecl]) {
        let unique: HashSet<TypeId> = extensions.iter().map(ExtensionDecl::id).collect();
        let mut counters = self.counters.lock();
        for id in unique {
            if let Some(count) = counters.get_mut(&id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Modules that still have to run `extension` after the current one
    pub fn remaining(&self, extension: TypeId) -> usize {
        self.counters.lock().get(&extension).copied().unwrap_or(0)
    }

    fn collect(&self, collector: TypeId, group: &GroupKey, values: Vec<Instance>) -> Option<Vec<Instance>> {
        let mut collected = self.collected.lock();
        let key = (collector, group.clone());
        collected.entry(key.clone()).or_default().extend(values);
        if self.remaining(collector) == 0 {
            collected.remove(&key)
        } else {
            None
        }
    }
}

#[derive(Clone, PartialEq)]
enum StackItem {
    Group(GroupKey),
    Extension(TypeId, &'static str),
}

impl StackItem {
    fn label(&self) -> String {
        match self {
            StackItem::Group(key) => key.to_string(),
            StackItem::Extension(_, name) => (*name).to_string(),
        }
    }
}

type CacheKey = (GroupKey, bool, Option<TypeId>);

#[derive(Default)]
struct State {
    unfinished: Vec<StackItem>,
    cache: HashMap<CacheKey, GroupData>,
    instances: HashMap<TypeId, Arc<dyn Extension>>,
    /// Result of each extension per group it is registered in
    results: HashMap<(TypeId, Token), Option<ExtensionData>>,
    inited: usize,
}

impl State {
    fn circular(&self, item: &StackItem) -> Error {
        let pos = self.unfinished.iter().position(|i| i == item).unwrap_or(0);
        let chain: Vec<String> = self.unfinished[pos..]
            .iter()
            .chain([item])
            .map(StackItem::label)
            .collect();
        let mut msg = format!("Detected circular dependencies: {}.", chain.join(" -> "));
        if pos > 0 {
            let prefix: Vec<String> = self.unfinished[..pos].iter().map(StackItem::label).collect();
            msg.push_str(&format!(" It is started from {}.", prefix.join(" -> ")));
        }
        Error::CircularDependency(msg)
    }

    fn path(&self) -> String {
        self.unfinished
            .iter()
            .map(StackItem::label)
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn pop(&mut self, item: &StackItem) {
        if let Some(pos) = self.unfinished.iter().rposition(|i| i == item) {
            self.unfinished.remove(pos);
        }
    }
}

pub struct ExtensionsManager {
    module: String,
    injector: Injector,
    groups: IndexMap<GroupKey, Vec<ExtensionDecl>>,
    state: Mutex<State>,
    context: Arc<ExtensionsContext>,
}

impl ExtensionsManager {
    /// `injector` is the module-scope injector extensions are built in
    pub fn new(
        module: impl Into<String>,
        injector: Injector,
        extensions: &[ExtensionDecl],
        context: Arc<ExtensionsContext>,
    ) -> Self {
        let mut groups: IndexMap<GroupKey, Vec<ExtensionDecl>> = IndexMap::new();
        for decl in extensions {
            groups
                .entry(GroupKey::Group(decl.group.clone()))
                .or_default()
                .push(decl.clone());
            if let Some(before) = &decl.before_group {
                groups
                    .entry(GroupKey::Before(before.clone()))
                    .or_default()
                    .push(decl.clone());
            }
        }
        Self {
            module: module.into(),
            injector,
            groups,
            state: Mutex::new(State::default()),
            context,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    pub fn context(&self) -> &Arc<ExtensionsContext> {
        &self.context
    }

    /// Groups registered in this module, `BEFORE` groups included
    pub fn groups(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    /// Number of extension runs performed so far
    pub fn inited_count(&self) -> usize {
        self.state.lock().inited
    }

    /// Initialize `group` and return its merged values
    pub async fn init(&self, group: impl Into<Token>) -> Result<Vec<Instance>> {
        let data = self.init_with(group, InitOptions::default()).await?;
        Ok(data.into_ready().unwrap_or_default())
    }

    /// Initialize `group`, running its `BEFORE` group first.
    ///
    /// With a collector the group's values are gathered across modules and
    /// [`GroupData::Pending`] is returned until the collector's last call.
    pub async fn init_with(&self, group: impl Into<Token>, options: InitOptions) -> Result<GroupData> {
        let group = group.into();
        let before = GroupKey::Before(group.clone());
        if self.groups.contains_key(&before) {
            self.run_group(before, InitOptions::default()).await?;
        }
        self.run_group(GroupKey::Group(group), options).await
    }

    async fn run_group(&self, key: GroupKey, options: InitOptions) -> Result<GroupData> {
        let cache_key: CacheKey = (key.clone(), options.auto_merge, options.collector);
        let item = StackItem::Group(key.clone());
        {
            let mut state = self.state.lock();
            if let Some(cached) = state.cache.get(&cache_key) {
                return Ok(cached.clone());
            }
            if state.unfinished.contains(&item) {
                return Err(state.circular(&item));
            }
            state.unfinished.push(item.clone());
            debug!(module = %self.module, group = %key, path = %state.path(), "Start init group");
        }

        let values = self.run_extensions(&key, options).await;
        self.state.lock().pop(&item);
        let values = values?;

        let data = match options.collector {
            Some(collector) => match self.context.collect(collector, &key, values) {
                Some(all) => GroupData::Ready(all),
                None => {
                    debug!(module = %self.module, group = %key, "Group data is pending until the last module");
                    return Ok(GroupData::Pending);
                }
            },
            None => GroupData::Ready(values),
        };

        self.state.lock().cache.insert(cache_key, data.clone());
        debug!(module = %self.module, group = %key, "Finish init group");
        Ok(data)
    }

    async fn run_extensions(&self, key: &GroupKey, options: InitOptions) -> Result<Vec<Instance>> {
        let Some(decls) = self.groups.get(key) else {
            debug!(module = %self.module, group = %key, "No extensions found");
            return Ok(Vec::new());
        };

        let mut values = Vec::new();
        for decl in decls {
            match self.run_extension(decl).await? {
                None => {}
                Some(ExtensionData::Single(value)) => values.push(value),
                Some(ExtensionData::List(list)) if options.auto_merge => values.extend(list),
                Some(ExtensionData::List(list)) => values.push(Arc::new(list) as Instance),
            }
        }
        Ok(values)
    }

    async fn run_extension(&self, decl: &ExtensionDecl) -> Result<Option<ExtensionData>> {
        let id = decl.id();
        let memo_key = (id, decl.group.clone());
        let item = StackItem::Extension(id, decl.extension.name());
        let extension = {
            let mut state = self.state.lock();
            if let Some(result) = state.results.get(&memo_key) {
                return Ok(result.clone());
            }
            if state.unfinished.contains(&item) {
                return Err(state.circular(&item));
            }
            let extension = match state.instances.get(&id) {
                Some(extension) => extension.clone(),
                None => {
                    let extension = self.instantiate(decl)?;
                    state.instances.insert(id, extension.clone());
                    extension
                }
            };
            state.unfinished.push(item.clone());
            trace!(module = %self.module, extension = decl.extension.name(), path = %state.path(), "Start init extension");
            extension
        };

        let is_last_call = self.context.remaining(id) == 0;
        let result = extension.init(self, is_last_call).await;

        let mut state = self.state.lock();
        state.pop(&item);
        let result = result?;
        state.inited += 1;
        state.results.insert(memo_key, result.clone());
        trace!(module = %self.module, extension = decl.extension.name(), is_last_call, "Finish init extension");
        Ok(result)
    }

    fn instantiate(&self, decl: &ExtensionDecl) -> Result<Arc<dyn Extension>> {
        let instance = self.injector.instantiate(&decl.extension)?;
        decl.extension.to_extension(&instance).ok_or_else(|| {
            Error::Configuration(format!(
                "{} is registered as an extension but does not implement init",
                decl.extension.name()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Deps, Injectable, Scope};
    use crate::token::InjectionToken;
    use async_trait::async_trait;
    use std::sync::LazyLock;

    static ROUTES: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("ROUTES"));
    static LOOP: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("LOOP"));
    static PRE: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("PRE"));

    struct RoutesExtension;
    impl Injectable for RoutesExtension {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(RoutesExtension)
        }
    }

    #[async_trait]
    impl Extension for RoutesExtension {
        async fn init(&self, _: &ExtensionsManager, _: bool) -> Result<Option<ExtensionData>> {
            Ok(Some(ExtensionData::list([
                Arc::new("/users") as Instance,
                Arc::new("/posts") as Instance,
            ])))
        }
    }

    /// Calls back into its own group
    struct LoopExtension;
    impl Injectable for LoopExtension {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(LoopExtension)
        }
    }

    #[async_trait]
    impl Extension for LoopExtension {
        async fn init(&self, cx: &ExtensionsManager, _: bool) -> Result<Option<ExtensionData>> {
            cx.init(&*LOOP).await?;
            Ok(None)
        }
    }

    static ORDER: LazyLock<Mutex<Vec<&'static str>>> = LazyLock::new(|| Mutex::new(Vec::new()));

    struct PreExtension;
    impl Injectable for PreExtension {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(PreExtension)
        }
    }

    #[async_trait]
    impl Extension for PreExtension {
        async fn init(&self, _: &ExtensionsManager, _: bool) -> Result<Option<ExtensionData>> {
            ORDER.lock().push("pre");
            Ok(Some(ExtensionData::single(1u8)))
        }
    }

    struct MainExtension;
    impl Injectable for MainExtension {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(MainExtension)
        }
    }

    #[async_trait]
    impl Extension for MainExtension {
        async fn init(&self, _: &ExtensionsManager, _: bool) -> Result<Option<ExtensionData>> {
            ORDER.lock().push("main");
            Ok(Some(ExtensionData::single(2u8)))
        }
    }

    fn manager(extensions: &[ExtensionDecl], context: Arc<ExtensionsContext>) -> ExtensionsManager {
        let injector = Injector::detached(Scope::Mod, "TestModule", Vec::new());
        ExtensionsManager::new("TestModule", injector, extensions, context)
    }

    #[tokio::test]
    async fn test_group_runs_once_and_merges_lists() {
        let decls = [ExtensionDecl::new::<RoutesExtension>(&*ROUTES)];
        let manager = manager(&decls, ExtensionsContext::new(HashMap::new()));

        let first = manager.init(&*ROUTES).await.unwrap();
        let second = manager.init(&*ROUTES).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(manager.inited_count(), 1);
    }

    #[tokio::test]
    async fn test_without_auto_merge_lists_stay_nested() {
        let decls = [ExtensionDecl::new::<RoutesExtension>(&*ROUTES)];
        let manager = manager(&decls, ExtensionsContext::new(HashMap::new()));

        let data = manager
            .init_with(&*ROUTES, InitOptions::default().auto_merge(false))
            .await
            .unwrap();
        let values = data.into_ready().unwrap();
        assert_eq!(values.len(), 1);
        assert!(values[0].downcast_ref::<Vec<Instance>>().is_some());
    }

    #[tokio::test]
    async fn test_unknown_group_is_empty() {
        let manager = manager(&[], ExtensionsContext::new(HashMap::new()));
        assert!(manager.init("MISSING").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_dependency_is_a_cycle() {
        let decls = [ExtensionDecl::new::<LoopExtension>(&*LOOP)];
        let manager = manager(&decls, ExtensionsContext::new(HashMap::new()));

        let err = manager.init(&*LOOP).await.unwrap_err();
        assert!(matches!(err, Error::CircularDependency(_)));
        assert_eq!(
            err.to_string(),
            "Detected circular dependencies: LOOP -> LoopExtension -> LOOP."
        );
    }

    #[tokio::test]
    async fn test_before_group_runs_first() {
        static MAIN: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("MAIN"));
        let decls = [
            ExtensionDecl::new::<MainExtension>(&*MAIN),
            ExtensionDecl::new::<PreExtension>(&*PRE).before(&*MAIN),
        ];
        let manager = manager(&decls, ExtensionsContext::new(HashMap::new()));

        manager.init(&*MAIN).await.unwrap();
        let pre = manager.init(&*PRE).await.unwrap();
        assert_eq!(*ORDER.lock(), vec!["pre", "main"]);
        // The extension ran once; its result is reused for its own group
        assert_eq!(pre.len(), 1);
        assert_eq!(manager.inited_count(), 2);
    }

    #[test]
    fn test_context_counters() {
        let decls = [ExtensionDecl::new::<RoutesExtension>(&*ROUTES)];
        let id = TypeId::of::<RoutesExtension>();
        let context = ExtensionsContext::new(HashMap::from([(id, 2)]));

        context.decrease_counters(&decls);
        assert_eq!(context.remaining(id), 1);
        context.decrease_counters(&decls);
        context.decrease_counters(&decls);
        assert_eq!(context.remaining(id), 0);
    }
}
