//! Trellis - a module system with scoped dependency injection
//!
//! Applications are composed of modules that import and export providers.
//! Bootstrap resolves the module graph into per-module injectors and runs
//! every module's extensions in dependency order.

// Re-export core functionality
pub use trellis_core::*;

// Re-export the configuration loader
#[cfg(feature = "config")]
pub use trellis_config;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        AppConfig,
        Application,
        ClassDef,
        ControllerDef,
        Deps,
        Error,
        Extension,
        ExtensionData,
        ExtensionDecl,
        Guard,
        GuardContext,
        GuardItem,
        GuardOutcome,
        Injectable,
        InjectionToken,
        Injector,
        Module,
        ModuleDecl,
        ModuleId,
        ModuleRef,
        Provider,
        RequestContext,
        Result,
        Scope,
        Token,
        async_trait,
    };
}
