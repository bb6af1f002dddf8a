//! Common types and error definitions for rslock
//!
//! This module contains the shared data types, configuration and error
//! handling used throughout the lock coordination core.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Effectively infinite timeout used by the untimed acquisition loops.
pub const FOREVER: Duration = Duration::MAX;

/// Identity of a running thread plus a human-readable name, so that wait
/// cycles can be described in diagnostics long after the thread moved on.
#[derive(Clone)]
pub struct ThreadRef {
    pub id: ThreadId,
    pub name: Arc<str>,
}

impl ThreadRef {
    /// Capture the identity of the calling thread.
    pub fn current() -> Self {
        let thread = thread::current();
        let name = match thread.name() {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("{:?}", thread.id()).as_str()),
        };
        Self {
            id: thread.id(),
            name,
        }
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadRef {}

/// Error types for rslock operations
#[derive(Error, Debug)]
pub enum RsLockError {
    /// A timed acquisition was cancelled before or while blocking.
    #[error("lock acquisition interrupted")]
    Interrupted,

    /// A wait cycle was found in which no participant's contested
    /// resources can be suspended.
    #[error("deadlock cannot be resolved: {message}")]
    UnresolvableDeadlock { message: String },

    /// The wait-for graph disagreed with an operation it was asked to
    /// record.
    #[error("wait graph inconsistency: {message}")]
    GraphInconsistency { message: String },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl RsLockError {
    /// Check if this error disables the deadlock detector when it
    /// surfaces from a graph operation.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            RsLockError::UnresolvableDeadlock { .. } | RsLockError::GraphInconsistency { .. }
        )
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            RsLockError::Interrupted => "interrupted",
            RsLockError::UnresolvableDeadlock { .. } => "unresolvable_deadlock",
            RsLockError::GraphInconsistency { .. } => "graph_inconsistency",
            RsLockError::InvalidConfig { .. } => "configuration",
        }
    }
}

/// Result type alias for rslock operations
pub type Result<T> = std::result::Result<T, RsLockError>;

/// Configuration for a lock manager instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Whether the wait-for graph is maintained at all. When false the
    /// manager never detects deadlock and all graph bookkeeping is a
    /// no-op.
    pub deadlock_detection: bool,
    /// Thread-name prefix identifying the host's worker pool. Threads
    /// whose name starts with this prefix are always reported as lock
    /// owners by `is_lock_owner`. An empty prefix disables the
    /// heuristic.
    pub worker_thread_prefix: String,
    /// Dump the final wait-graph state when the detector is disabled by
    /// an internal error.
    pub log_wait_graph_on_error: bool,
}

impl Config {
    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.worker_thread_prefix.len() > 128 {
            return Err(RsLockError::InvalidConfig {
                message: "Worker thread prefix cannot exceed 128 bytes".to_string(),
            });
        }

        if self.worker_thread_prefix.chars().any(char::is_whitespace) {
            return Err(RsLockError::InvalidConfig {
                message: "Worker thread prefix cannot contain whitespace".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deadlock_detection: true,
            worker_thread_prefix: "worker".to_string(),
            log_wait_graph_on_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let config = Config {
            worker_thread_prefix: "w".repeat(129),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RsLockError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_whitespace_prefix_rejected() {
        let config = Config {
            worker_thread_prefix: "pool 1".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thread_ref_compares_by_id() {
        let a = ThreadRef::current();
        let b = ThreadRef {
            id: a.id,
            name: Arc::from("elsewhere"),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(RsLockError::Interrupted.category(), "interrupted");
        assert!(!RsLockError::Interrupted.is_internal());
        let err = RsLockError::GraphInconsistency {
            message: "x".to_string(),
        };
        assert!(err.is_internal());
    }
}
