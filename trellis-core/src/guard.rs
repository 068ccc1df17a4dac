//! Guards for route protection

use crate::injector::Injector;
use crate::provider::{ClassDef, Injectable};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Result of a guard check. A rejection is a normal outcome for the
/// routing layer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Allowed,
    /// The caller is not authenticated (401)
    Unauthorized,
    /// The caller is authenticated but not permitted (403)
    Forbidden,
}

impl GuardOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardOutcome::Allowed)
    }
}

impl From<bool> for GuardOutcome {
    fn from(allowed: bool) -> Self {
        if allowed {
            GuardOutcome::Allowed
        } else {
            GuardOutcome::Unauthorized
        }
    }
}

/// Execution context for guards
pub struct GuardContext {
    /// Name of the module that owns the route
    pub module: String,
    /// Request-scope injector of the current request
    pub injector: Injector,
}

impl GuardContext {
    pub fn new(module: impl Into<String>, injector: Injector) -> Self {
        Self {
            module: module.into(),
            injector,
        }
    }
}

/// Guard trait for protecting routes
#[async_trait]
pub trait Guard: Send + Sync {
    /// Decide whether the request may proceed; `params` come from the
    /// [`GuardItem`] that attached this guard
    async fn can_activate(&self, context: &GuardContext, params: &[Value]) -> Result<GuardOutcome>;
}

/// A guard class plus the parameters it is attached with
#[derive(Clone, Debug, PartialEq)]
pub struct GuardItem {
    pub class: ClassDef,
    pub params: Vec<Value>,
}

impl GuardItem {
    pub fn new<G: Injectable + Guard>() -> Self {
        Self::from_class(ClassDef::guard::<G>())
    }

    /// Attach an arbitrary class; normalization rejects it unless it was
    /// built with [`ClassDef::guard`]
    pub fn from_class(class: ClassDef) -> Self {
        Self {
            class,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: impl IntoIterator<Item = Value>) -> Self {
        self.params.extend(params);
        self
    }
}

/// A guard instantiated in a request scope
pub struct NormalizedGuard {
    pub name: &'static str,
    pub guard: Arc<dyn Guard>,
    pub params: Vec<Value>,
}

impl NormalizedGuard {
    pub fn instantiate(item: &GuardItem, injector: &Injector) -> Result<Self> {
        let instance = injector.instantiate(&item.class)?;
        let guard = item.class.to_guard(&instance).ok_or_else(|| {
            Error::Configuration(format!("{} does not implement can_activate", item.class.name()))
        })?;
        Ok(Self {
            name: item.class.name(),
            guard,
            params: item.params.clone(),
        })
    }
}

impl fmt::Debug for NormalizedGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedGuard")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Run `guards` in order and return the first outcome that is not
/// [`GuardOutcome::Allowed`]
pub async fn check_guards(guards: &[GuardItem], context: &GuardContext) -> Result<GuardOutcome> {
    for item in guards {
        let guard = NormalizedGuard::instantiate(item, &context.injector)?;
        let outcome = guard.guard.can_activate(context, &guard.params).await?;
        if !outcome.is_allowed() {
            debug!(module = %context.module, guard = guard.name, ?outcome, "Guard rejected request");
            return Ok(outcome);
        }
    }
    Ok(GuardOutcome::Allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Deps, Provider, Scope};
    use crate::token::Token;

    struct AllowAll;
    impl Injectable for AllowAll {
        fn construct(_: &mut Deps) -> Result<Self> {
            Ok(AllowAll)
        }
    }

    #[async_trait]
    impl Guard for AllowAll {
        async fn can_activate(&self, _: &GuardContext, _: &[Value]) -> Result<GuardOutcome> {
            Ok(GuardOutcome::Allowed)
        }
    }

    /// Allows the request when the configured role is listed in params
    struct RoleGuard {
        role: Arc<String>,
    }

    impl Injectable for RoleGuard {
        fn dependencies() -> Vec<Token> {
            vec![Token::named("role")]
        }

        fn construct(deps: &mut Deps) -> Result<Self> {
            Ok(RoleGuard { role: deps.next()? })
        }
    }

    #[async_trait]
    impl Guard for RoleGuard {
        async fn can_activate(&self, _: &GuardContext, params: &[Value]) -> Result<GuardOutcome> {
            let granted = params.iter().any(|p| p.as_str() == Some(self.role.as_str()));
            Ok(if granted {
                GuardOutcome::Allowed
            } else {
                GuardOutcome::Forbidden
            })
        }
    }

    fn context(role: &str) -> GuardContext {
        let injector = Injector::detached(
            Scope::Req,
            "TestModule",
            vec![Provider::value("role", role.to_string())],
        );
        GuardContext::new("TestModule", injector)
    }

    #[test]
    fn test_outcome_from_bool() {
        assert_eq!(GuardOutcome::from(true), GuardOutcome::Allowed);
        assert_eq!(GuardOutcome::from(false), GuardOutcome::Unauthorized);
    }

    #[tokio::test]
    async fn test_all_guards_allow() {
        let guards = vec![
            GuardItem::new::<AllowAll>(),
            GuardItem::new::<RoleGuard>().with_params([Value::from("admin")]),
        ];
        let outcome = check_guards(&guards, &context("admin")).await.unwrap();
        assert_eq!(outcome, GuardOutcome::Allowed);
    }

    #[tokio::test]
    async fn test_first_rejection_wins() {
        let guards = vec![
            GuardItem::new::<RoleGuard>().with_params([Value::from("admin")]),
            GuardItem::new::<AllowAll>(),
        ];
        let outcome = check_guards(&guards, &context("editor")).await.unwrap();
        assert_eq!(outcome, GuardOutcome::Forbidden);
    }

    #[tokio::test]
    async fn test_class_without_capability_is_rejected() {
        let guards = vec![GuardItem::from_class(ClassDef::of::<AllowAll>())];
        let err = check_guards(&guards, &context("admin")).await.unwrap_err();
        assert!(err.to_string().contains("does not implement can_activate"));
    }
}
