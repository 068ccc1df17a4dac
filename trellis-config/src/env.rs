//! Environment variable loading

use std::collections::HashMap;
use std::env;

/// Default prefix for Trellis environment variables
pub const ENV_PREFIX: &str = "TRELLIS";

/// Collects `PREFIX_*` variables into lowercase configuration keys
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load from the process environment
    pub fn load(&self) -> HashMap<String, String> {
        self.load_from(env::vars())
    }

    /// Load from an explicit set of variables (used by tests and embedders)
    pub fn load_from<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let marker = format!("{}_", self.prefix);
        vars.into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&marker)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_lowercase(), value))
            })
            .collect()
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(ENV_PREFIX)
    }
}
