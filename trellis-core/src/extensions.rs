//! Extensions: deferred, dependency-ordered build steps.
//!
//! An extension is a class registered under a group token. At bootstrap
//! every module's groups are initialized once through an
//! [`ExtensionsManager`]; an extension may ask the manager for the results
//! of other groups, which is how cross-module artifacts get built in order.
//!
//! ```ignore
//! struct RoutesExtension;
//!
//! #[async_trait]
//! impl Extension for RoutesExtension {
//!     async fn init(&self, cx: &ExtensionsManager, _is_last_call: bool) -> Result<Option<ExtensionData>> {
//!         let metadata = cx.init(&ROUTE_METADATA).await?;
//!         Ok(Some(ExtensionData::list(metadata)))
//!     }
//! }
//! ```

use crate::extensions_manager::ExtensionsManager;
use crate::provider::{ClassDef, Injectable, Instance};
use crate::token::Token;
use crate::Result;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait Extension: Send + Sync {
    /// Run the extension.
    ///
    /// `is_last_call` is true when no other module will run this extension
    /// class after the current one.
    async fn init(&self, cx: &ExtensionsManager, is_last_call: bool) -> Result<Option<ExtensionData>>;
}

/// What an extension contributes to its group
#[derive(Clone)]
pub enum ExtensionData {
    Single(Instance),
    /// Flattened into the group result when the caller auto-merges
    List(Vec<Instance>),
}

impl ExtensionData {
    pub fn single<T: Any + Send + Sync>(value: T) -> Self {
        ExtensionData::Single(Arc::new(value))
    }

    pub fn list(values: impl IntoIterator<Item = Instance>) -> Self {
        ExtensionData::List(values.into_iter().collect())
    }
}

impl fmt::Debug for ExtensionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionData::Single(_) => f.write_str("Single(..)"),
            ExtensionData::List(items) => write!(f, "List(len = {})", items.len()),
        }
    }
}

/// An extension contributed to a group by a module
#[derive(Clone, Debug, PartialEq)]
pub struct ExtensionDecl {
    pub group: Token,
    pub extension: ClassDef,
    /// The group this extension has to finish before
    pub before_group: Option<Token>,
    /// Offered to importers of the declaring module
    pub exported: bool,
}

impl ExtensionDecl {
    pub fn new<E: Injectable + Extension>(group: impl Into<Token>) -> Self {
        Self::from_class(group, ClassDef::extension::<E>())
    }

    /// Register an arbitrary class; normalization rejects it unless it was
    /// built with [`ClassDef::extension`]
    pub fn from_class(group: impl Into<Token>, extension: ClassDef) -> Self {
        Self {
            group: group.into(),
            extension,
            before_group: None,
            exported: false,
        }
    }

    pub fn before(mut self, group: impl Into<Token>) -> Self {
        self.before_group = Some(group.into());
        self
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn id(&self) -> TypeId {
        self.extension.type_id()
    }
}

/// A group of extensions, or the set that has to run before a group
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Group(Token),
    Before(Token),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Group(token) => write!(f, "{}", token),
            GroupKey::Before(token) => write!(f, "BEFORE {}", token),
        }
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// How a group's results are gathered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InitOptions {
    pub auto_merge: bool,
    /// Gather this group across all modules on behalf of the given
    /// extension class; results stay pending until its last call.
    pub collector: Option<TypeId>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            auto_merge: true,
            collector: None,
        }
    }
}

impl InitOptions {
    pub fn collect_for<E: Extension + 'static>() -> Self {
        Self {
            auto_merge: true,
            collector: Some(TypeId::of::<E>()),
        }
    }

    pub fn auto_merge(mut self, enabled: bool) -> Self {
        self.auto_merge = enabled;
        self
    }
}

#[derive(Clone, Debug)]
pub enum GroupData {
    Ready(Vec<Instance>),
    /// Not every module has contributed yet
    Pending,
}

impl GroupData {
    pub fn is_ready(&self) -> bool {
        matches!(self, GroupData::Ready(_))
    }

    pub fn into_ready(self) -> Option<Vec<Instance>> {
        match self {
            GroupData::Ready(values) => Some(values),
            GroupData::Pending => None,
        }
    }
}
