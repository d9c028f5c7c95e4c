//! Rule-list cache keyed by subject type
//!
//! Holds the active rules of each subject type for a short TTL. The cache is
//! an immutable snapshot behind a lock: reloads build a new snapshot and swap
//! it in, so concurrent readers always see a complete list.
//!
//! By default every slot shares one freshness clock, the time of the most
//! recent reload of any subject type. [`TtlMode::PerSubject`] gives each slot
//! its own clock instead.

use super::rule::PermissionRule;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// How slot freshness is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlMode {
    /// One clock for all slots, reset by any reload
    #[default]
    Shared,
    /// Each slot expires independently
    PerSubject,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    rules: Arc<[PermissionRule]>,
    loaded_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    slots: HashMap<String, CacheSlot>,
    last_update: Option<Instant>,
    generation: u64,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// TTL cache of active rules per subject type
pub struct RuleCache {
    ttl: Duration,
    mode: TtlMode,
    current: RwLock<Arc<Snapshot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RuleCache {
    pub fn new(ttl: Duration, mode: TtlMode) -> Self {
        RuleCache {
            ttl,
            mode,
            current: RwLock::new(Arc::new(Snapshot::default())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mode(&self) -> TtlMode {
        self.mode
    }

    /// Get the cached rules for a subject type if still fresh
    pub fn get(&self, subject_type: &str) -> Option<Arc<[PermissionRule]>> {
        self.get_at(subject_type, Instant::now())
    }

    pub(crate) fn get_at(&self, subject_type: &str, now: Instant) -> Option<Arc<[PermissionRule]>> {
        let snapshot: Arc<Snapshot> = Arc::clone(&*self.current.read());

        let fresh = snapshot.slots.get(subject_type).and_then(|slot| {
            let since = match self.mode {
                TtlMode::Shared => snapshot.last_update?,
                TtlMode::PerSubject => slot.loaded_at,
            };
            (now.saturating_duration_since(since) < self.ttl).then(|| Arc::clone(&slot.rules))
        });

        match fresh {
            Some(rules) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(subject_type, rules = rules.len(), "rule cache hit");
                Some(rules)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(subject_type, "rule cache miss");
                None
            }
        }
    }

    /// Current invalidation generation
    ///
    /// Read it before loading from the store and hand it back to
    /// [`RuleCache::insert`]; a load that raced with [`RuleCache::clear`] is
    /// then dropped instead of resurrecting pre-mutation rules.
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Publish a freshly loaded rule list
    pub fn insert(
        &self,
        subject_type: &str,
        rules: Vec<PermissionRule>,
        generation: u64,
    ) -> Arc<[PermissionRule]> {
        self.insert_at(subject_type, rules, generation, Instant::now())
    }

    pub(crate) fn insert_at(
        &self,
        subject_type: &str,
        rules: Vec<PermissionRule>,
        generation: u64,
        now: Instant,
    ) -> Arc<[PermissionRule]> {
        let rules: Arc<[PermissionRule]> = rules.into();

        let mut current = self.current.write();
        if current.generation != generation {
            debug!(subject_type, "discarding rule list loaded before invalidation");
            return rules;
        }

        let mut next = Snapshot::clone(&current);
        next.slots.insert(
            subject_type.to_string(),
            CacheSlot {
                rules: Arc::clone(&rules),
                loaded_at: now,
            },
        );
        next.last_update = Some(now);
        *current = Arc::new(next);

        rules
    }

    /// Drop every slot
    pub fn clear(&self) {
        let mut current = self.current.write();
        let generation = current.generation.wrapping_add(1);
        *current = Arc::new(Snapshot {
            generation,
            ..Snapshot::default()
        });
    }

    /// Number of cached subject types, fresh or not
    pub fn len(&self) -> usize {
        self.current.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
