//! Error types for the stripecache library.
//!
//! ## Key Components
//!
//! - [`LoadError`]: Returned when a cache load cannot produce a value —
//!   the loader declined, failed, panicked, or re-entered itself.
//! - [`ConfigError`]: Returned when cache configuration parameters are
//!   invalid (e.g. a weigher without a weight cap, refresh without a
//!   loader).
//!
//! ## Example Usage
//!
//! ```
//! use stripecache::builder::CacheBuilder;
//! use stripecache::error::ConfigError;
//!
//! // A weigher only makes sense together with a weight cap.
//! let cache: Result<_, ConfigError> = CacheBuilder::new()
//!     .weigher(|_k: &u64, v: &String| v.len() as u64)
//!     .build();
//! assert!(cache.is_err());
//! ```

use std::fmt;
use std::sync::Arc;

/// Boxed error type produced by user-supplied loaders.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// LoadError
// ---------------------------------------------------------------------------

/// Error returned when a load could not produce a value.
///
/// A single loader invocation may have many concurrent waiters; the error is
/// cheaply cloneable so every waiter observes the same outcome.
#[derive(Debug, Clone)]
pub enum LoadError {
    /// The loader completed without producing a value for the requested key.
    Invalid(String),

    /// The loader returned an error. All waiters share the same cause.
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    /// The loader panicked while computing the value.
    ///
    /// Only concurrent waiters observe this variant; the thread that ran the
    /// loader resumes the panic instead.
    Panicked,

    /// A thread re-entered a load that it is currently performing.
    Recursive(String),
}

impl LoadError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn failed(source: DynError) -> Self {
        Self::Failed(Arc::from(source))
    }

    pub(crate) fn recursive(msg: impl Into<String>) -> Self {
        Self::Recursive(msg.into())
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "loader returned no value: {msg}"),
            Self::Failed(source) => write!(f, "loader failed: {source}"),
            Self::Panicked => f.write_str("loader panicked"),
            Self::Recursive(msg) => write!(f, "recursive load: {msg}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`CacheBuilder::build`](crate::builder::CacheBuilder::build)
/// and [`CacheBuilder::build_with_loader`](crate::builder::CacheBuilder::build_with_loader).
/// Carries a human-readable description of which parameter failed
/// validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- LoadError --------------------------------------------------------

    #[test]
    fn invalid_display_shows_message() {
        let err = LoadError::invalid("no value for key 7");
        assert_eq!(err.to_string(), "loader returned no value: no value for key 7");
    }

    #[test]
    fn failed_carries_source() {
        let err = LoadError::failed("backend unavailable".into());
        assert!(err.to_string().contains("backend unavailable"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn panicked_has_no_source() {
        let err = LoadError::Panicked;
        assert!(std::error::Error::source(&err).is_none());
        assert_eq!(err.to_string(), "loader panicked");
    }

    #[test]
    fn clones_share_the_same_cause() {
        let err = LoadError::failed("once".into());
        let clone = err.clone();
        match (&err, &clone) {
            (LoadError::Failed(a), LoadError::Failed(b)) => {
                assert!(Arc::ptr_eq(a, b));
            },
            _ => panic!("expected Failed variants"),
        }
    }

    // -- ConfigError ------------------------------------------------------

    #[test]
    fn config_display_shows_message() {
        let err = ConfigError::new("concurrency level must be > 0");
        assert_eq!(err.to_string(), "concurrency level must be > 0");
    }

    #[test]
    fn config_message_accessor() {
        let err = ConfigError::new("test");
        assert_eq!(err.message(), "test");
    }

    #[test]
    fn config_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<ConfigError>();
        assert_error::<LoadError>();
    }
}
