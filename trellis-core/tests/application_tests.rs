// Tests for guards and reinitialization of a running application

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use trellis_core::*;

/// Allows the request when its `role` path parameter is one of the params
struct RoleGuard {
    path_params: Arc<HashMap<String, String>>,
}

impl Injectable for RoleGuard {
    fn dependencies() -> Vec<Token> {
        vec![Token::from(&*PATH_PARAMS)]
    }

    fn construct(deps: &mut Deps) -> Result<Self> {
        Ok(RoleGuard { path_params: deps.next()? })
    }
}

#[async_trait]
impl Guard for RoleGuard {
    async fn can_activate(&self, _: &GuardContext, params: &[Value]) -> Result<GuardOutcome> {
        let Some(role) = self.path_params.get("role") else {
            return Ok(GuardOutcome::Unauthorized);
        };
        let allowed = params.iter().any(|p| p.as_str() == Some(role.as_str()));
        Ok(if allowed {
            GuardOutcome::Allowed
        } else {
            GuardOutcome::Forbidden
        })
    }
}

struct AdminModule;
impl Module for AdminModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::feature().controller(ControllerDef::new("AdminController"))
    }
}

struct PanelModule;
impl Module for PanelModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::root().import_with_params(
            AdminModule::with_params()
                .id("admin")
                .prefix("admin")
                .guard(GuardItem::new::<RoleGuard>().with_params([json!("owner")])),
        )
    }
}

#[tokio::test]
async fn test_guards_of_parameterised_import() {
    let app = Application::builder(ModuleRef::of::<PanelModule>())
        .bootstrap()
        .await
        .unwrap();

    let route = app.routes().iter().find(|r| r.module_name == "AdminModule").unwrap();
    assert_eq!(route.prefix, "admin");
    assert_eq!(route.guards.len(), 1);

    let injector = app.route_injector("admin").unwrap();

    let owner = injector.request(RequestContext::new().path_param("role", "owner"));
    assert_eq!(app.authorize(route, &owner).await.unwrap(), GuardOutcome::Allowed);

    let guest = injector.request(RequestContext::new().path_param("role", "guest"));
    assert_eq!(app.authorize(route, &guest).await.unwrap(), GuardOutcome::Forbidden);

    let anonymous = injector.request(RequestContext::new());
    assert_eq!(app.authorize(route, &anonymous).await.unwrap(), GuardOutcome::Unauthorized);
}

struct Cache;
impl Injectable for Cache {
    fn construct(_: &mut Deps) -> Result<Self> {
        Ok(Cache)
    }
}

struct OtherCache;
impl Injectable for OtherCache {
    fn construct(_: &mut Deps) -> Result<Self> {
        Ok(OtherCache)
    }
}

struct CacheModule;
impl Module for CacheModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::feature()
            .providers_per_mod([Provider::class("cache", ClassDef::of::<Cache>())])
            .export("cache")
    }
}

struct OtherCacheModule;
impl Module for OtherCacheModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::feature()
            .providers_per_mod([Provider::class("cache", ClassDef::of::<OtherCache>())])
            .export("cache")
    }
}

struct MetricsModule;
impl Module for MetricsModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::feature()
            .providers_per_mod([Provider::value("metrics", 0u64)])
            .export("metrics")
    }
}

struct ServerModule;
impl Module for ServerModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::root().import::<CacheModule>()
    }
}

fn module_names(app: &Application) -> Vec<String> {
    app.modules().iter().map(|m| m.name().to_string()).collect()
}

#[tokio::test]
async fn test_reinit_applies_added_import() {
    let mut app = Application::builder(ModuleRef::of::<ServerModule>())
        .bootstrap()
        .await
        .unwrap();
    assert!(!app.injector_for(ModuleId::Root).unwrap().has("metrics"));

    let added = app
        .module_manager_mut()
        .add_import(ModuleRef::of::<MetricsModule>(), ModuleId::Root)
        .unwrap();
    assert!(added);
    app.reinit().await.unwrap();

    assert!(!app.module_manager().has_pending_changes());
    assert!(app.injector_for(ModuleId::Root).unwrap().has("metrics"));
    assert_eq!(module_names(&app), vec!["CacheModule", "MetricsModule", "ServerModule"]);
}

#[tokio::test]
async fn test_failed_reinit_restores_previous_graph() {
    let mut app = Application::builder(ModuleRef::of::<ServerModule>())
        .bootstrap()
        .await
        .unwrap();
    let before = module_names(&app);

    app.module_manager_mut()
        .add_import(ModuleRef::of::<OtherCacheModule>(), ModuleId::Root)
        .unwrap();
    let err = app.reinit().await.unwrap_err();
    assert!(matches!(err, Error::ProviderCollision { .. }));

    assert!(!app.module_manager().has_pending_changes());
    assert!(app.module_manager().get_metadata(ModuleId::of::<OtherCacheModule>()).is_none());
    assert_eq!(module_names(&app), before);

    let cache = app.injector_for(ModuleId::Root).unwrap();
    assert!(cache.get_as::<Cache>("cache").is_ok());
}

#[tokio::test]
async fn test_removed_import_is_dropped_on_reinit() {
    let mut app = Application::builder(ModuleRef::of::<ServerModule>())
        .bootstrap()
        .await
        .unwrap();

    let removed = app
        .module_manager_mut()
        .remove_import(ModuleId::of::<CacheModule>(), ModuleId::Root)
        .unwrap();
    assert!(removed);
    app.reinit().await.unwrap();

    assert_eq!(module_names(&app), vec!["ServerModule"]);
    assert!(app.injector_for(ModuleId::of::<CacheModule>()).is_none());
}

#[test]
fn test_rollback_restores_scanned_modules() {
    let mut manager = ModuleManager::new();
    manager.scan_root_module(ModuleRef::of::<ServerModule>()).unwrap();
    let before: Vec<String> = manager.modules().map(|m| m.name.clone()).collect();

    manager
        .add_import(ModuleRef::of::<MetricsModule>(), ModuleId::Root)
        .unwrap();
    manager
        .remove_import(ModuleId::of::<CacheModule>(), ModuleId::Root)
        .unwrap();
    assert!(manager.has_pending_changes());

    manager.rollback();
    let after: Vec<String> = manager.modules().map(|m| m.name.clone()).collect();
    assert_eq!(after, before);
    assert!(manager.root_metadata().unwrap().imports_key(ModuleRef::of::<CacheModule>().key()));
    assert!(!manager.root_metadata().unwrap().imports_key(ModuleRef::of::<MetricsModule>().key()));
}

struct StorageModule;
impl Module for StorageModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::feature().controller(ControllerDef::new("StorageController"))
    }
}

struct UploadsModule;
impl Module for UploadsModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::feature()
            .import::<StorageModule>()
            .controller(ControllerDef::new("UploadsController"))
    }
}

struct FilesApp;
impl Module for FilesApp {
    fn declare() -> ModuleDecl {
        ModuleDecl::root().import::<StorageModule>().import::<UploadsModule>()
    }
}

#[tokio::test]
async fn test_import_closing_a_cycle_is_rejected() {
    let mut app = Application::builder(ModuleRef::of::<FilesApp>())
        .bootstrap()
        .await
        .unwrap();
    let before = module_names(&app);

    let err = app
        .module_manager_mut()
        .add_import(ModuleRef::of::<UploadsModule>(), ModuleId::of::<StorageModule>())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cycle);
    assert!(
        err.to_string()
            .contains("StorageModule -> UploadsModule -> StorageModule")
    );

    let storage = app.module_manager().get_metadata(ModuleId::of::<StorageModule>()).unwrap();
    assert!(!storage.imports_key(ModuleRef::of::<UploadsModule>().key()));
    assert!(!app.module_manager().has_pending_changes());

    app.reinit().await.unwrap();
    assert_eq!(module_names(&app), before);
}

#[test]
fn test_rollback_keeps_committed_import() {
    let mut manager = ModuleManager::new();
    manager.scan_root_module(ModuleRef::of::<ServerModule>()).unwrap();

    manager
        .add_import(ModuleRef::of::<MetricsModule>(), ModuleId::Root)
        .unwrap();
    manager.commit();
    let committed: Vec<NormalizedMeta> = manager.modules().cloned().collect();

    manager
        .add_import(ModuleRef::of::<StorageModule>(), ModuleId::Root)
        .unwrap();
    manager.rollback();

    assert_eq!(manager.modules().cloned().collect::<Vec<_>>(), committed);
    let root = manager.root_metadata().unwrap();
    assert!(root.imports_key(ModuleRef::of::<MetricsModule>().key()));
    assert!(!root.imports_key(ModuleRef::of::<StorageModule>().key()));
    assert!(manager.get_metadata(ModuleId::of::<StorageModule>()).is_none());
}
