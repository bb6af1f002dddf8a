//! # rslock: Deadlock-Avoiding Lock Coordination
//!
//! `rslock` provides a reentrant, FIFO-fair lock primitive coordinated
//! through a shared wait-for graph. When a wait would close a cycle, the
//! coordinator picks a victim thread, forcibly releases its contested
//! locks so the rest of the cycle can progress, and restores the
//! victim's reentrance depths once it resumes.
//!
//! ## Core Features
//!
//! - **Ordered Locks**: reentrant, arrival-order fair, with timed
//!   acquisition and cancellation
//! - **Deadlock Detection**: a wait-for graph over locks and
//!   user-defined scheduling rules, checked on every wait
//! - **Suspension & Resume**: victims transparently reacquire their
//!   locks at the recorded depths
//! - **Scheduler Hooks**: an embedding scheduler can service pending
//!   work right before a thread blocks
//!
//! ## Example
//!
//! ```rust,ignore
//! use rslock::LockManager;
//!
//! let manager = LockManager::new();
//! let lock = manager.new_lock();
//!
//! lock.acquire();
//! // ... critical section ...
//! lock.release();
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod common;
pub mod core;
pub mod manager;
pub mod metrics;


// Re-export commonly used types
pub use crate::common::{Config, FOREVER, Result, RsLockError, ThreadRef};
pub use crate::core::hook::LockHook;
pub use crate::core::ordered_lock::OrderedLock;
pub use crate::core::rule::{Resource, SchedulingRule, same_rule};
pub use crate::manager::LockManager;
pub use crate::metrics::{
    MetricsCollector, MetricsSnapshot, SharedMetricsCollector, new_shared_metrics_collector,
};
