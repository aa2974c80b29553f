use std::path::PathBuf;

/// Errors that can occur across the Vigil engine.
///
/// Variants line up with how callers react to them: transient remote errors
/// are retried, unavailable dependencies degrade the context strategy,
/// malformed input is rejected at admission, and everything else propagates.
///
/// # Examples
///
/// ```
/// use vigil_core::VigilError;
///
/// let err = VigilError::RateLimited { retry_after_secs: Some(3) };
/// assert!(err.is_retryable());
///
/// let err = VigilError::AgentRejected { status: 401, message: "bad key".into() };
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VigilError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A request was rejected before any work was created.
    #[error("invalid request: {0}")]
    #[diagnostic(help("agent name and subject reference must be non-empty and the agent must have a handler"))]
    InvalidRequest(String),

    /// Source-control host (GitHub) failure.
    #[error("source control error: {0}")]
    SourceControl(String),

    /// The reasoning agent asked us to slow down.
    #[error("reasoning agent rate limited the request")]
    RateLimited {
        /// Server-provided `Retry-After`, when present.
        retry_after_secs: Option<u64>,
    },

    /// The reasoning agent is temporarily overloaded.
    #[error("reasoning agent is overloaded: {0}")]
    Overloaded(String),

    /// The reasoning agent refused the request (auth, validation).
    #[error("reasoning agent rejected the request ({status}): {message}")]
    AgentRejected {
        /// HTTP status returned by the agent.
        status: u16,
        /// Response body or summary.
        message: String,
    },

    /// Any other reasoning-agent failure (transport, malformed response).
    #[error("agent error: {0}")]
    Agent(String),

    /// The circuit guarding a remote dependency is open.
    #[error("circuit open for {service}; calls suspended")]
    CircuitOpen {
        /// Name of the guarded dependency.
        service: String,
    },

    /// The auxiliary search service failed.
    #[error("search service error: {0}")]
    Search(String),

    /// A dispatched review handler failed.
    #[error("review handler failed: {0}")]
    Handler(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl VigilError {
    /// Whether the failure is transient and worth retrying with backoff.
    ///
    /// Only rate-limit and overload signals qualify; generic errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VigilError::RateLimited { .. } | VigilError::Overloaded(_)
        )
    }

    /// Whether the failure means a dependency is unreachable rather than broken.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, VigilError::CircuitOpen { .. } | VigilError::Search(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: VigilError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_displays_message() {
        let err = VigilError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn only_rate_limit_and_overload_are_retryable() {
        assert!(VigilError::RateLimited {
            retry_after_secs: None
        }
        .is_retryable());
        assert!(VigilError::Overloaded("529".into()).is_retryable());
        assert!(!VigilError::Agent("timeout".into()).is_retryable());
        assert!(!VigilError::AgentRejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!VigilError::CircuitOpen {
            service: "search".into()
        }
        .is_retryable());
    }

    #[test]
    fn circuit_open_names_service() {
        let err = VigilError::CircuitOpen {
            service: "semantic-search".into(),
        };
        assert!(err.to_string().contains("semantic-search"));
        assert!(err.is_unavailable());
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = VigilError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert!(err.to_string().contains("/tmp/missing.toml"));
    }
}
