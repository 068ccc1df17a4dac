//! Core library for the Trellis module runtime
//!
//! Module graph, scoped dependency injection and extension orchestration

pub mod application;
pub mod collisions;
pub mod error;
pub mod extensions;
pub mod extensions_manager;
pub mod guard;
pub mod injector;
pub mod logging;
pub mod metadata;
pub mod module;
pub mod module_factory;
pub mod module_manager;
pub mod normalizer;
pub mod provider;
pub mod request;
pub mod token;

// Re-export commonly used types
pub use application::{Application, ApplicationBuilder, ExtensionResult};
pub use collisions::Collision;
pub use error::*;
pub use extensions::*;
pub use extensions_manager::{ExtensionsContext, ExtensionsManager};
pub use guard::*;
pub use injector::{Injector, InjectorRegistry, ModuleInjectors, RouteInjector};
pub use metadata::NormalizedMeta;
pub use module::*;
pub use module_factory::{ModuleFactory, ProviderEntry, Resolution, ResolvedModule, SourceModule};
pub use module_manager::ModuleManager;
pub use normalizer::ModuleNormalizer;
pub use provider::*;
pub use request::*;
pub use token::*;

pub use async_trait::async_trait;
pub use trellis_config::AppConfig;
