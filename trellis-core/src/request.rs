//! Request-scope seeds and the data handed to the routing layer

use crate::guard::GuardItem;
use crate::module::{ControllerDef, ModuleKey};
use crate::provider::Provider;
use crate::token::{InjectionToken, Token};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

/// `HashMap<String, String>` of matched path parameters
pub static PATH_PARAMS: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("PATH_PARAMS"));

/// Raw query string as a `String`
pub static QUERY_STRING: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("QUERY_STRING"));

/// Parsed body as `Option<serde_json::Value>`
pub static REQUEST_PAYLOAD: LazyLock<InjectionToken> = LazyLock::new(|| InjectionToken::new("REQUEST_PAYLOAD"));

/// Tokens every request scope provides without a declaration
pub fn default_request_tokens() -> Vec<Token> {
    vec![
        Token::from(&*PATH_PARAMS),
        Token::from(&*QUERY_STRING),
        Token::from(&*REQUEST_PAYLOAD),
    ]
}

/// What the transport layer knows about one inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path_params: HashMap<String, String>,
    pub query_string: String,
    pub payload: Option<Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query_string = query.into();
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub(crate) fn into_providers(self) -> Vec<Provider> {
        vec![
            Provider::value(&*PATH_PARAMS, self.path_params),
            Provider::value(&*QUERY_STRING, self.query_string),
            Provider::value(&*REQUEST_PAYLOAD, self.payload),
        ]
    }
}

/// Provided per module under `Token::of::<ModuleInfo>()`
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInfo {
    pub name: String,
    pub id: Option<String>,
    pub prefix: String,
    pub is_root: bool,
}

/// One module's contribution to the route table
#[derive(Debug, Clone)]
pub struct RouteMetadata {
    pub module: ModuleKey,
    pub module_name: String,
    pub prefix: String,
    pub guards: Vec<GuardItem>,
    pub controllers: Vec<ControllerDef>,
    /// Merged route-scope providers
    pub providers_per_rou: Vec<Provider>,
    /// Merged request-scope providers, without the request seeds
    pub providers_per_req: Vec<Provider>,
}
