//! Configuration validation

use crate::{ConfigError, Result};

/// Implemented by typed configuration structs
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reusable validation rules
pub struct ConfigValidator;

impl ConfigValidator {
    /// Case-insensitive membership check
    pub fn one_of(value: &str, allowed: &[&str], field: &str) -> Result<()> {
        if allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
            return Ok(());
        }
        Err(ConfigError::ValidationError(format!(
            "{} must be one of [{}], got \"{}\"",
            field,
            allowed.join(", "),
            value
        )))
    }

    /// Route prefixes are joined with `/`, so they must not carry their own slashes at the edges
    pub fn path_segment(value: &str, field: &str) -> Result<()> {
        if value.starts_with('/') || value.ends_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "{} must not start or end with '/', got \"{}\"",
                field, value
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_of() {
        let allowed = ["trace", "debug", "info"];
        assert!(ConfigValidator::one_of("DEBUG", &allowed, "log_level").is_ok());
        let err = ConfigValidator::one_of("loud", &allowed, "log_level").unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn test_path_segment() {
        assert!(ConfigValidator::path_segment("api/v1", "path_prefix").is_ok());
        assert!(ConfigValidator::path_segment("", "path_prefix").is_ok());
        assert!(ConfigValidator::path_segment("/api", "path_prefix").is_err());
        assert!(ConfigValidator::path_segment("api/", "path_prefix").is_err());
    }
}
