//! Application bootstrap and reinitialization

use crate::extensions_manager::{ExtensionsContext, ExtensionsManager};
use crate::guard::{GuardContext, GuardOutcome, check_guards};
use crate::injector::{Injector, InjectorRegistry, ModuleInjectors, RouteInjector};
use crate::module::{ModuleId, ModuleKey, ModuleRef};
use crate::module_factory::{ModuleFactory, Resolution, ResolvedModule, collect_providers_per_app};
use crate::module_manager::ModuleManager;
use crate::normalizer::ModuleNormalizer;
use crate::provider::{Instance, Provider, Scope};
use crate::request::RouteMetadata;
use crate::token::Token;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, error, info};
use trellis_config::AppConfig;

/// Values one module's extensions produced for one group
#[derive(Debug, Clone)]
pub struct ExtensionResult {
    pub module: ModuleKey,
    pub module_name: String,
    pub group: Token,
    pub values: Vec<Instance>,
}

/// Everything derived from the module graph; rebuilt on every reinit
struct AppState {
    registry: Arc<InjectorRegistry>,
    app_injector: Injector,
    modules: Vec<ResolvedModule>,
    routes: Vec<RouteMetadata>,
    extension_results: Vec<ExtensionResult>,
}

pub struct ApplicationBuilder {
    root: ModuleRef,
    config: AppConfig,
    providers: Vec<Provider>,
}

impl ApplicationBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Application-scope providers declared outside the module tree; module
    /// declarations of the same token take precedence
    pub fn providers_per_app(mut self, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.providers.extend(providers);
        self
    }

    pub async fn bootstrap(self) -> Result<Application> {
        info!(root = %self.root, "Bootstrapping application");
        let normalizer = ModuleNormalizer::new().warn_unregistered_extensions(self.config.warn_unregistered_extensions);
        let mut manager = ModuleManager::with_normalizer(normalizer);
        manager.scan_root_module(self.root)?;

        let mut defaults = vec![Provider::value(Token::of::<AppConfig>(), self.config.clone())];
        defaults.extend(self.providers);

        let state = build_state(&manager, &self.config, &defaults).await?;
        info!(
            modules = state.modules.len(),
            routes = state.routes.len(),
            "Application bootstrap complete"
        );
        Ok(Application {
            manager,
            config: self.config,
            defaults,
            state,
        })
    }
}

/// A bootstrapped application
pub struct Application {
    manager: ModuleManager,
    config: AppConfig,
    defaults: Vec<Provider>,
    state: AppState,
}

impl Application {
    pub fn builder(root: impl Into<ModuleRef>) -> ApplicationBuilder {
        ApplicationBuilder {
            root: root.into(),
            config: AppConfig::default(),
            providers: Vec::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn app_injector(&self) -> &Injector {
        &self.state.app_injector
    }

    /// Resolved modules, imports before importers and the root last
    pub fn modules(&self) -> &[ResolvedModule] {
        &self.state.modules
    }

    /// Modules that declare controllers, in bootstrap order
    pub fn routes(&self) -> &[RouteMetadata] {
        &self.state.routes
    }

    fn injectors(&self, module: impl Into<ModuleId>) -> Option<ModuleInjectors> {
        let key = self.manager.key_of(&module.into())?;
        self.state.registry.get(key)
    }

    /// Module-scope injector of `module`
    pub fn injector_for(&self, module: impl Into<ModuleId>) -> Option<Injector> {
        self.injectors(module).map(|injectors| injectors.module)
    }

    pub fn route_injector(&self, module: impl Into<ModuleId>) -> Option<RouteInjector> {
        self.injectors(module).map(|injectors| injectors.route_injector())
    }

    /// Run the guards of `route` against a request injector
    pub async fn authorize(&self, route: &RouteMetadata, request: &Injector) -> Result<GuardOutcome> {
        let context = GuardContext::new(route.module_name.clone(), request.clone());
        check_guards(&route.guards, &context).await
    }

    /// Values every module produced for `group`, in bootstrap order
    pub fn extension_results(&self, group: impl Into<Token>) -> Vec<Instance> {
        let group = group.into();
        self.state
            .extension_results
            .iter()
            .filter(|r| r.group == group)
            .flat_map(|r| r.values.iter().cloned())
            .collect()
    }

    pub fn extension_results_by_module(&self) -> &[ExtensionResult] {
        &self.state.extension_results
    }

    pub fn module_manager(&self) -> &ModuleManager {
        &self.manager
    }

    /// Stage programmatic import changes, then call [`Application::reinit`]
    pub fn module_manager_mut(&mut self) -> &mut ModuleManager {
        &mut self.manager
    }

    /// Rebuild resolution, injectors and extensions from the module
    /// manager's current state.
    ///
    /// On failure the manager is rolled back, the previous configuration is
    /// rebuilt and the original error is returned.
    pub async fn reinit(&mut self) -> Result<()> {
        info!(pending = self.manager.has_pending_changes(), "Reinitializing application");
        match build_state(&self.manager, &self.config, &self.defaults).await {
            Ok(state) => {
                self.state = state;
                if self.config.autocommit {
                    self.manager.commit();
                }
                info!(modules = self.state.modules.len(), "Reinitialization complete");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Reinitialization failed, rolling back module changes");
                self.manager.rollback();
                match build_state(&self.manager, &self.config, &self.defaults).await {
                    Ok(state) => {
                        self.state = state;
                        info!("Restored previous application state");
                    }
                    Err(restore) => error!(error = %restore, "Failed to restore previous application state"),
                }
                Err(err)
            }
        }
    }
}

async fn build_state(manager: &ModuleManager, config: &AppConfig, defaults: &[Provider]) -> Result<AppState> {
    let providers_per_app = collect_providers_per_app(manager, defaults.to_vec())?;
    let registry = InjectorRegistry::new();
    let app_injector = Injector::root(providers_per_app.clone(), &registry);

    let resolution = ModuleFactory::new(manager, &providers_per_app)?.resolve_all(&config.path_prefix)?;

    let mut routes = Vec::new();
    for module in &resolution.modules {
        let name = module.name().to_string();
        let module_injector = app_injector.child(Scope::Mod, name.clone(), module.providers[Scope::Mod].clone());
        let route_injector = module_injector.child(Scope::Rou, name.clone(), module.providers[Scope::Rou].clone());
        registry.register(
            module.key(),
            ModuleInjectors {
                name: name.clone(),
                module: module_injector,
                route: route_injector,
                req_providers: Arc::new(module.providers[Scope::Req].clone()),
            },
        );

        if !module.meta.controllers.is_empty() {
            routes.push(RouteMetadata {
                module: module.key(),
                module_name: name,
                prefix: module.prefix.clone(),
                guards: module.guards.clone(),
                controllers: module.meta.controllers.clone(),
                providers_per_rou: module.providers_at(Scope::Rou).cloned().collect(),
                providers_per_req: module.providers_at(Scope::Req).cloned().collect(),
            });
        }
    }

    let extension_results = init_extensions(&resolution, &registry).await?;

    Ok(AppState {
        registry,
        app_injector,
        modules: resolution.modules,
        routes,
        extension_results,
    })
}

/// Run every module's extension groups; counters of a module's extensions
/// drop before its groups run so the last module sees zero
async fn init_extensions(resolution: &Resolution, registry: &InjectorRegistry) -> Result<Vec<ExtensionResult>> {
    let context = ExtensionsContext::new(resolution.extension_counters.clone());
    let mut results = Vec::new();

    for module in resolution.modules.iter().filter(|m| !m.extensions.is_empty()) {
        context.decrease_counters(&module.extensions);
        let Some(injectors) = registry.get(module.key()) else {
            continue;
        };
        let manager = ExtensionsManager::new(module.name(), injectors.module, &module.extensions, context.clone());

        let mut groups: Vec<&Token> = Vec::new();
        for decl in &module.extensions {
            if !groups.contains(&&decl.group) {
                groups.push(&decl.group);
            }
        }
        for group in groups {
            let values = manager.init(group).await?;
            debug!(module = %module.name(), group = %group, values = values.len(), "Initialized extension group");
            results.push(ExtensionResult {
                module: module.key(),
                module_name: module.name().to_string(),
                group: group.clone(),
                values,
            });
        }
        info!(module = %module.name(), extensions = manager.inited_count(), "Finished extensions initialization");
    }
    Ok(results)
}
