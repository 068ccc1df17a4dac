//! Injection tokens.
//!
//! A [`Token`] is the key every provider is registered and looked up under.
//! Tokens compare by identity: two [`InjectionToken`]s with the same
//! description are still different tokens.

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// `a::b::Foo<c::Bar>` becomes `Foo<c::Bar>`
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    let start = base.rfind("::").map(|i| i + 2).unwrap_or(0);
    &full[start..]
}

/// Token derived from a Rust type
#[derive(Clone, Copy)]
pub struct TypeToken {
    id: TypeId,
    name: &'static str,
}

impl TypeToken {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name(type_name::<T>()),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeToken {}

impl Hash for TypeToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Opaque marker token with a process-unique identity
#[derive(Clone)]
pub struct InjectionToken {
    id: u64,
    description: Arc<str>,
}

impl InjectionToken {
    pub fn new(description: impl Into<Arc<str>>) -> Self {
        Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            description: description.into(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl PartialEq for InjectionToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InjectionToken {}

impl Hash for InjectionToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for InjectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InjectionToken({}#{})", self.description, self.id)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Token {
    Type(TypeToken),
    Named(Arc<str>),
    Marker(InjectionToken),
}

impl Token {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Token::Type(TypeToken::of::<T>())
    }

    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Token::Named(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Token::Type(t) => t.name(),
            Token::Named(name) => name,
            Token::Marker(marker) => marker.description(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Type(t) => write!(f, "Token::Type({})", t.name()),
            Token::Named(name) => write!(f, "Token::Named({:?})", name),
            Token::Marker(marker) => write!(f, "Token::Marker({:?})", marker),
        }
    }
}

impl From<InjectionToken> for Token {
    fn from(token: InjectionToken) -> Self {
        Token::Marker(token)
    }
}

impl From<&InjectionToken> for Token {
    fn from(token: &InjectionToken) -> Self {
        Token::Marker(token.clone())
    }
}

impl From<&Token> for Token {
    fn from(token: &Token) -> Self {
        token.clone()
    }
}

impl From<&str> for Token {
    fn from(name: &str) -> Self {
        Token::named(name)
    }
}
