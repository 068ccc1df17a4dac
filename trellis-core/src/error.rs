//! Error types for the Trellis resolution core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid module shape, unresolved export, invalid guard or extension,
    /// or a failed programmatic change to the module graph.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{}", render_collision(.module, .tokens, .sources))]
    ProviderCollision {
        module: String,
        tokens: Vec<String>,
        sources: Vec<String>,
    },

    #[error("{0}")]
    CircularDependency(String),

    #[error("{0}")]
    ProviderNotFound(String),

    #[error("Extension error: {0}")]
    Extension(String),

    #[error("Config error: {0}")]
    Config(#[from] trellis_config::ConfigError),
}

/// Coarse classification used by the application entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Cycle,
    Resolution,
    Extension,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::ProviderCollision { .. } => ErrorKind::Configuration,
            Error::CircularDependency(_) => ErrorKind::Cycle,
            Error::ProviderNotFound(_) => ErrorKind::Resolution,
            Error::Extension(_) => ErrorKind::Extension,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the error aborts a bootstrap or reinit attempt.
    ///
    /// Resolution failures surface at first use and stay local to the caller
    /// that asked for the token.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Resolution)
    }

    /// Prefix a configuration message with where it happened
    pub(crate) fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            Error::Configuration(msg) => Error::Configuration(format!("{}: {}", context, msg)),
            other => other,
        }
    }
}

fn render_collision(module: &str, tokens: &[String], sources: &[String]) -> String {
    let tokens = tokens.join(", ");
    let mut msg = if sources.is_empty() {
        format!("Importing providers to {} failed: exports cause collision with {}.", module, tokens)
    } else {
        format!(
            "Importing providers to {} failed: exports from {} cause collision with {}.",
            module,
            sources.join(", "),
            tokens
        )
    };
    msg.push_str(&format!(
        " Declare {} in {} or list them in its resolved collisions.",
        tokens, module
    ));
    msg
}

pub type Result<T> = std::result::Result<T, Error>;
