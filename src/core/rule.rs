//! Scheduling rules and graph resource identity
//!
//! A scheduling rule is a user-defined resource that participates in the
//! wait-for graph the same way a lock does: it can be held, waited on and
//! conflict with structurally related rules. Locks are the other resource
//! kind; they conflict only with themselves.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::core::ordered_lock::OrderedLock;

/// Resource identity exposed to external users.
///
/// Both predicates must be reflexive and `conflicts_with` must be
/// symmetric; the detector relies on those properties when deriving wait
/// edges. Implementations typically downcast `other` through `as_any`
/// to recognize related rule types, and fall back to [`same_rule`] for
/// everything else.
pub trait SchedulingRule: Send + Sync + fmt::Debug {
    /// Whether this rule logically covers `other`, so that a nested
    /// acquisition of `other` is already satisfied by holding `self`.
    fn contains(&self, other: &dyn SchedulingRule) -> bool;

    /// Whether holding this rule excludes holding `other` concurrently.
    fn conflicts_with(&self, other: &dyn SchedulingRule) -> bool;

    /// Concrete-type access for the predicates of other rules.
    fn as_any(&self) -> &dyn Any;
}

/// Identity comparison for rule trait objects.
pub fn same_rule(a: &dyn SchedulingRule, b: &dyn SchedulingRule) -> bool {
    std::ptr::addr_eq(a as *const dyn SchedulingRule, b as *const dyn SchedulingRule)
}

/// A resource tracked by the wait-for graph: an ordered lock or a
/// user-defined scheduling rule.
#[derive(Clone)]
pub enum Resource {
    Lock(Arc<OrderedLock>),
    Rule(Arc<dyn SchedulingRule>),
}

/// Value key identifying a resource in the graph tables. Locks are keyed
/// by their manager-assigned id, rules by their allocation address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum ResourceKey {
    Lock(u64),
    Rule(usize),
}

impl Resource {
    pub(crate) fn key(&self) -> ResourceKey {
        match self {
            Resource::Lock(lock) => ResourceKey::Lock(lock.id()),
            Resource::Rule(rule) => ResourceKey::Rule(Arc::as_ptr(rule) as *const () as usize),
        }
    }

    /// Whether holding `self` blocks a thread waiting for `other`.
    pub(crate) fn conflicts_with(&self, other: &Resource) -> bool {
        match (self, other) {
            (Resource::Lock(a), Resource::Lock(b)) => a.id() == b.id(),
            (Resource::Rule(a), Resource::Rule(b)) => a.conflicts_with(b.as_ref()),
            // Locks conflict only with themselves, never with a rule.
            _ => false,
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Lock(lock) => write!(f, "lock #{}", lock.id()),
            Resource::Rule(rule) => write!(f, "rule {:?}", rule),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PathRule {
        path: String,
    }

    impl SchedulingRule for PathRule {
        fn contains(&self, other: &dyn SchedulingRule) -> bool {
            match other.as_any().downcast_ref::<PathRule>() {
                Some(other) => other.path.starts_with(&self.path),
                None => same_rule(self, other),
            }
        }

        fn conflicts_with(&self, other: &dyn SchedulingRule) -> bool {
            match other.as_any().downcast_ref::<PathRule>() {
                Some(other) => {
                    other.path.starts_with(&self.path) || self.path.starts_with(&other.path)
                }
                None => same_rule(self, other),
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn rule(path: &str) -> PathRule {
        PathRule {
            path: path.to_string(),
        }
    }

    #[test]
    fn test_rule_predicates_are_reflexive() {
        let a = rule("/a");
        assert!(same_rule(&a, &a));
        assert!(a.contains(&a));
        assert!(a.conflicts_with(&a));
    }

    #[test]
    fn test_nested_paths_conflict() {
        let parent = rule("/a");
        let child = rule("/a/b");
        let sibling = rule("/c");
        assert!(parent.contains(&child));
        assert!(!child.contains(&parent));
        assert!(parent.conflicts_with(&child));
        assert!(child.conflicts_with(&parent));
        assert!(!parent.conflicts_with(&sibling));
    }

    #[test]
    fn test_rule_resource_keys_follow_allocation() {
        let shared: Arc<dyn SchedulingRule> = Arc::new(rule("/a"));
        let first = Resource::Rule(shared.clone());
        let second = Resource::Rule(shared);
        assert_eq!(first.key(), second.key());

        let other = Resource::Rule(Arc::new(rule("/a")));
        assert_ne!(first.key(), other.key());
    }

    #[test]
    fn test_rule_and_lock_never_conflict() {
        let manager = crate::manager::LockManager::new();
        let lock = manager.new_lock();
        let lock_resource = Resource::Lock(lock);
        let rule_resource = Resource::Rule(Arc::new(rule("/a")));
        assert!(!lock_resource.conflicts_with(&rule_resource));
        assert!(!rule_resource.conflicts_with(&lock_resource));
        assert!(lock_resource.conflicts_with(&lock_resource.clone()));
    }
}
