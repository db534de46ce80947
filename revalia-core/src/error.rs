//! Error types for Revalia operations

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error value produced by a fetcher or an async mutation updater.
///
/// Stored on [`StateRecord::error`](crate::StateRecord) and shared with every
/// subscriber of the key, so it is cheap to clone. Two `FetchError`s are the
/// "same" error only if they share the same allocation.
#[derive(Clone)]
pub struct FetchError {
    message: Arc<str>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl FetchError {
    /// Create an error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
            source: None,
        }
    }

    /// Wrap an arbitrary error, keeping it reachable through `source()`.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: Arc::from(err.to_string()),
            source: Some(Arc::new(err)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Pointer identity. Used by the store to decide whether an error write
    /// is a change.
    pub fn same_as(&self, other: &FetchError) -> bool {
        Arc::ptr_eq(&self.message, &other.message)
    }

    /// Downcast the wrapped source error, if any.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchError")
            .field("message", &&*self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

/// Key evaluation errors.
///
/// The engine never surfaces these: a key that fails to evaluate is treated
/// as inactive for that evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key function failed: {reason}")]
    Evaluation { reason: String },
}

/// Mutation errors returned to the direct `mutate` caller.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    #[error("Mutation of {key} rejected: {source}")]
    Rejected {
        key: String,
        #[source]
        source: FetchError,
    },
}

impl MutationError {
    pub fn key(&self) -> &str {
        match self {
            Self::Rejected { key, .. } => key,
        }
    }

    pub fn fetch_error(&self) -> &FetchError {
        match self {
            Self::Rejected { source, .. } => source,
        }
    }
}

/// Errors raised by blocking reads.
#[derive(Debug, Clone, Error)]
pub enum SuspenseError {
    #[error("Blocking read on an inactive key")]
    Inactive,

    #[error("Fetch rejected: {0}")]
    Rejected(#[source] FetchError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Master error type for all Revalia errors.
#[derive(Debug, Error)]
pub enum RevaliaError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Suspense error: {0}")]
    Suspense(#[from] SuspenseError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Revalia operations.
pub type RevaliaResult<T> = Result<T, RevaliaError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream returned {status}")]
    struct Upstream {
        status: u16,
    }

    #[test]
    fn test_fetch_error_identity() {
        let a = FetchError::msg("boom");
        let b = a.clone();
        let c = FetchError::msg("boom");
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }

    #[test]
    fn test_fetch_error_downcast() {
        let err = FetchError::from_error(Upstream { status: 503 });
        assert_eq!(err.message(), "upstream returned 503");
        assert_eq!(err.downcast_ref::<Upstream>().map(|u| u.status), Some(503));
        assert!(std::error::Error::source(&err).is_some());
        assert!(FetchError::msg("plain").downcast_ref::<Upstream>().is_none());
    }

    #[test]
    fn test_mutation_error_display() {
        let err = MutationError::Rejected {
            key: "/api/user".to_string(),
            source: FetchError::msg("conflict"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/api/user"));
        assert!(msg.contains("conflict"));
        assert_eq!(err.key(), "/api/user");
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "error_retry_interval_ms".to_string(),
            value: "0".to_string(),
            reason: "must be > 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("error_retry_interval_ms"));
        assert!(msg.contains("must be > 0"));
    }

    #[test]
    fn test_revalia_error_from_variants() {
        let fetch = RevaliaError::from(FetchError::msg("x"));
        assert!(matches!(fetch, RevaliaError::Fetch(_)));

        let key = RevaliaError::from(KeyError::Evaluation {
            reason: "missing user".to_string(),
        });
        assert!(matches!(key, RevaliaError::Key(_)));

        let suspense = RevaliaError::from(SuspenseError::Inactive);
        assert!(matches!(suspense, RevaliaError::Suspense(_)));
    }
}
