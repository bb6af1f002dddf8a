//! Wait-for graph and cycle resolution
//!
//! The detector keeps reentrance-counted hold edges and one pending wait
//! edge per thread, both keyed by value (thread id, resource key) rather
//! than by owning references, since the graph is intrinsically cyclic.
//! Deadlock search and victim selection are set-based so that the outcome
//! is a deterministic function of the graph state.
//!
//! Every mutator runs under the lock manager's graph mutex.

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use ahash::{AHashMap, AHashSet};

use crate::common::{Result, RsLockError, ThreadRef};
use crate::core::ordered_lock::OrderedLock;
use crate::core::rule::{Resource, ResourceKey};

pub(crate) struct DeadlockDetector {
    /// Live resource handles, for conflict predicates and diagnostics.
    resources: AHashMap<ResourceKey, Resource>,
    /// Which threads hold which resources, with reentrance counts.
    holds: AHashMap<ThreadId, AHashMap<ResourceKey, usize>>,
    /// The resource each thread is currently blocked on, if any.
    waits: AHashMap<ThreadId, ResourceKey>,
    /// Names of threads with live edges, for cycle reports.
    names: AHashMap<ThreadId, Arc<str>>,
}

/// Outcome of a positive deadlock search: the thread whose locks will be
/// suspended, the locks themselves, and the cycle members for logging.
pub(crate) struct Deadlock {
    pub victim: ThreadRef,
    pub locks: Vec<Arc<OrderedLock>>,
    pub cycle: Vec<Arc<str>>,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self {
            resources: AHashMap::new(),
            holds: AHashMap::new(),
            waits: AHashMap::new(),
            names: AHashMap::new(),
        }
    }

    /// Record that `thread` now holds `resource`, clearing a matching
    /// wait edge and bumping the reentrance count.
    pub fn acquired(&mut self, thread: &ThreadRef, resource: &Resource) {
        let key = resource.key();
        self.names.insert(thread.id, thread.name.clone());
        self.resources.entry(key).or_insert_with(|| resource.clone());
        if self.waits.get(&thread.id) == Some(&key) {
            self.waits.remove(&thread.id);
        }
        *self
            .holds
            .entry(thread.id)
            .or_default()
            .entry(key)
            .or_insert(0) += 1;
    }

    /// Record that `thread` is about to block on `resource` and search
    /// for a cycle reachable from it.
    pub fn wait_start(&mut self, thread: &ThreadRef, resource: &Resource) -> Result<Option<Deadlock>> {
        let key = resource.key();
        self.names.insert(thread.id, thread.name.clone());
        self.resources.entry(key).or_insert_with(|| resource.clone());
        self.waits.insert(thread.id, key);

        let cycle = self.cycle_through(thread.id);
        if cycle.is_empty() {
            return Ok(None);
        }
        self.choose_victim(&cycle).map(Some)
    }

    /// Remove the wait edge `(thread, resource)` if it is present.
    pub fn wait_stop(&mut self, thread: ThreadId, resource: &Resource) {
        let key = resource.key();
        if self.waits.get(&thread) == Some(&key) {
            self.waits.remove(&thread);
        }
        self.prune_resource(key);
        self.prune_thread(thread);
    }

    /// Decrement the reentrance count for `(thread, resource)`, removing
    /// the hold edge when it reaches zero.
    pub fn released(&mut self, thread: ThreadId, resource: &Resource) -> Result<()> {
        let key = resource.key();
        let Some(held) = self.holds.get_mut(&thread) else {
            return Err(RsLockError::GraphInconsistency {
                message: format!("thread released {:?} but holds nothing", resource),
            });
        };
        let Some(count) = held.get_mut(&key) else {
            return Err(RsLockError::GraphInconsistency {
                message: format!("thread released {:?} without holding it", resource),
            });
        };
        *count -= 1;
        if *count == 0 {
            held.remove(&key);
        }
        if held.is_empty() {
            self.holds.remove(&thread);
        }
        self.prune_resource(key);
        self.prune_thread(thread);
        Ok(())
    }

    /// Remove the hold edge `(thread, resource)` regardless of depth.
    /// A forced release may race a second resolution pass over the same
    /// victim, so a missing edge is tolerated here.
    pub fn released_completely(&mut self, thread: ThreadId, resource: &Resource) {
        let key = resource.key();
        if let Some(held) = self.holds.get_mut(&thread) {
            held.remove(&key);
        }
        if self.holds.get(&thread).is_some_and(|held| held.is_empty()) {
            self.holds.remove(&thread);
        }
        self.prune_resource(key);
        self.prune_thread(thread);
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty() && self.waits.is_empty()
    }

    /// Whether `thread` holds or waits for any resource.
    pub fn involves(&self, thread: ThreadId) -> bool {
        self.holds.contains_key(&thread) || self.waits.contains_key(&thread)
    }

    /// Whether `thread` currently has a pending wait edge.
    pub fn is_waiting(&self, thread: ThreadId) -> bool {
        self.waits.contains_key(&thread)
    }

    /// Threads directly blocking `waiter`: holders of any resource that
    /// conflicts with the one `waiter` is blocked on.
    fn blockers(&self, waiter: ThreadId) -> Vec<ThreadId> {
        let Some(waited_key) = self.waits.get(&waiter) else {
            return Vec::new();
        };
        let Some(waited) = self.resources.get(waited_key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (&holder, held) in &self.holds {
            if holder == waiter {
                continue;
            }
            let blocks = held.keys().any(|key| {
                key == waited_key
                    || self
                        .resources
                        .get(key)
                        .is_some_and(|resource| resource.conflicts_with(waited))
            });
            if blocks {
                out.push(holder);
            }
        }
        out
    }

    /// Every thread `from` transitively blocks on.
    fn reachable(&self, from: ThreadId) -> AHashSet<ThreadId> {
        let mut seen = AHashSet::new();
        let mut stack = self.blockers(from);
        while let Some(thread) = stack.pop() {
            if seen.insert(thread) {
                stack.extend(self.blockers(thread));
            }
        }
        seen
    }

    /// All threads on wait cycles through `start`, or empty when `start`
    /// does not block on itself.
    fn cycle_through(&self, start: ThreadId) -> Vec<ThreadId> {
        let forward = self.reachable(start);
        if !forward.contains(&start) {
            return Vec::new();
        }
        forward
            .iter()
            .copied()
            .filter(|&thread| thread == start || self.reachable(thread).contains(&start))
            .collect()
    }

    /// Pick the cycle member whose suspension breaks the cycle at the
    /// smallest cost: fewest contested locks, then fewest held resources
    /// overall, then smallest contested lock id. A member whose contested
    /// resources include a rule cannot be suspended at all.
    fn choose_victim(&self, cycle: &[ThreadId]) -> Result<Deadlock> {
        let mut best: Option<(usize, usize, u64, ThreadId, Vec<Arc<OrderedLock>>)> = None;

        for &candidate in cycle {
            let Some(held) = self.holds.get(&candidate) else {
                continue;
            };
            let mut contested = Vec::new();
            for key in held.keys() {
                let Some(resource) = self.resources.get(key) else {
                    continue;
                };
                let blocks_cycle = cycle.iter().any(|&waiter| {
                    waiter != candidate
                        && self.waits.get(&waiter).is_some_and(|waited_key| {
                            waited_key == key
                                || self
                                    .resources
                                    .get(waited_key)
                                    .is_some_and(|waited| resource.conflicts_with(waited))
                        })
                });
                if blocks_cycle {
                    contested.push(resource);
                }
            }
            if contested.is_empty() {
                continue;
            }

            let mut locks = Vec::with_capacity(contested.len());
            let mut suspendable = true;
            for resource in contested {
                match resource {
                    Resource::Lock(lock) => locks.push(lock.clone()),
                    Resource::Rule(_) => {
                        suspendable = false;
                        break;
                    }
                }
            }
            if !suspendable {
                continue;
            }

            let min_lock_id = locks.iter().map(|lock| lock.id()).min().unwrap_or(u64::MAX);
            let rank = (locks.len(), held.len(), min_lock_id);
            let better = match &best {
                None => true,
                Some((count, total, id, _, _)) => rank < (*count, *total, *id),
            };
            if better {
                best = Some((rank.0, rank.1, rank.2, candidate, locks));
            }
        }

        let Some((_, _, _, victim, locks)) = best else {
            return Err(RsLockError::UnresolvableDeadlock {
                message: format!(
                    "every thread on the cycle holds a scheduling rule; cycle: {:?}",
                    self.cycle_names(cycle)
                ),
            });
        };

        Ok(Deadlock {
            victim: ThreadRef {
                id: victim,
                name: self
                    .names
                    .get(&victim)
                    .cloned()
                    .unwrap_or_else(|| Arc::from("unknown")),
            },
            locks,
            cycle: self.cycle_names(cycle),
        })
    }

    fn cycle_names(&self, cycle: &[ThreadId]) -> Vec<Arc<str>> {
        cycle
            .iter()
            .map(|thread| {
                self.names
                    .get(thread)
                    .cloned()
                    .unwrap_or_else(|| Arc::from("unknown"))
            })
            .collect()
    }

    fn prune_resource(&mut self, key: ResourceKey) {
        let held = self.holds.values().any(|held| held.contains_key(&key));
        let waited = self.waits.values().any(|waited| *waited == key);
        if !held && !waited {
            self.resources.remove(&key);
        }
    }

    fn prune_thread(&mut self, thread: ThreadId) {
        if !self.involves(thread) {
            self.names.remove(&thread);
        }
    }
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "wait-for graph:")?;
        for (thread, held) in &self.holds {
            let name = self.names.get(thread).map(|n| n.as_ref()).unwrap_or("unknown");
            let resources: Vec<_> = held
                .iter()
                .map(|(key, count)| format!("{:?} x{}", self.resources.get(key), count))
                .collect();
            writeln!(f, "  {} holds {}", name, resources.join(", "))?;
        }
        for (thread, key) in &self.waits {
            let name = self.names.get(thread).map(|n| n.as_ref()).unwrap_or("unknown");
            writeln!(f, "  {} waits for {:?}", name, self.resources.get(key))?;
        }
        Ok(())
    }
}
