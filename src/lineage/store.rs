//! Lineage Store Implementation
//!
//! Eviction policy: a running byte total is maintained; when a `put` would
//! exceed the configured budget, entries are evicted in creation order
//! (oldest first) among those not currently protected by an in-flight
//! reconstruction pin or a direct reference, until under budget or nothing
//! more is evictable. Eviction is lazy (checked on insert only), permanent,
//! and never blocks callers.
//!
//! The whole store sits behind one `std::sync::Mutex`: the byte total and
//! the creation order must be observed atomically, which per-key locking
//! cannot provide.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::types::{LineageEntry, LineageLookup};
use crate::config::RecoveryConfig;
use crate::object::ObjectId;
use crate::task::TaskSpecification;

struct StoredEntry {
    entry: LineageEntry,
    /// In-flight reconstruction pins; an entry with pins is never evicted.
    pins: u32,
    /// True while the object itself holds a direct reference.
    referenced: bool,
}

impl StoredEntry {
    fn evictable(&self) -> bool {
        self.pins == 0 && !self.referenced
    }
}

/// Effect of one `put` on the store.
///
/// The caller owns the indirect-reference accounting for retained entries,
/// so it needs to know exactly what was kept, what was displaced, and what
/// was pushed out by the budget.
#[derive(Debug, Default)]
pub struct PutOutcome {
    /// False when retention is disabled or the identity was already
    /// evicted; no entry was kept and no references should be charged.
    pub stored: bool,
    /// Previous entry displaced by this put, if any.
    pub replaced: Option<LineageEntry>,
    /// Entries evicted to stay under budget.
    pub evicted: Vec<LineageEntry>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ObjectId, StoredEntry>,
    /// Creation order, oldest first. `touch` moves an id to the back.
    order: VecDeque<ObjectId>,
    total_bytes: u64,
    /// Identities whose entry was evicted. Membership here is permanent.
    evicted: HashSet<ObjectId>,
}

/// Bounded-byte store of regeneration recipes.
pub struct LineageStore {
    max_bytes: u64,
    pinning_enabled: bool,
    inner: Mutex<Inner>,
}

impl LineageStore {
    pub fn new(config: &RecoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            max_bytes: config.max_lineage_bytes,
            pinning_enabled: config.lineage_pinning_enabled,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("lineage store lock poisoned")
    }

    /// Retains the recipe for `object`.
    ///
    /// The outcome reports whether the entry was kept, the entry it
    /// displaced, and the entries evicted to stay under budget, so the
    /// caller can keep indirect-reference accounting exact. A no-op when
    /// lineage pinning is disabled, and when the identity was already
    /// evicted (there is no re-insertion).
    pub fn put(&self, object: ObjectId, spec: TaskSpecification) -> PutOutcome {
        if !self.pinning_enabled {
            return PutOutcome::default();
        }

        let serialized_bytes = serde_json::to_vec(&spec)
            .map(|encoded| encoded.len() as u64)
            .unwrap_or(0);

        let mut guard = self.lock();
        // Reborrow so `entries` and `total_bytes` are disjoint borrows.
        let inner = &mut *guard;

        if inner.evicted.contains(&object) {
            tracing::warn!("Refusing to re-insert evicted lineage for {}", object);
            return PutOutcome::default();
        }

        let entry = LineageEntry {
            object: object.clone(),
            spec,
            serialized_bytes,
        };

        let replaced = match inner.entries.get_mut(&object) {
            Some(existing) => {
                // Replacement keeps the original creation-order position.
                inner.total_bytes -= existing.entry.serialized_bytes;
                inner.total_bytes += serialized_bytes;
                Some(std::mem::replace(&mut existing.entry, entry))
            }
            None => {
                inner.total_bytes += serialized_bytes;
                inner.order.push_back(object.clone());
                inner.entries.insert(
                    object,
                    StoredEntry {
                        entry,
                        pins: 0,
                        referenced: false,
                    },
                );
                None
            }
        };

        PutOutcome {
            stored: true,
            replaced,
            evicted: self.evict_to_budget(inner),
        }
    }

    fn evict_to_budget(&self, inner: &mut Inner) -> Vec<LineageEntry> {
        let mut evicted = Vec::new();

        while inner.total_bytes > self.max_bytes {
            let victim_pos = inner.order.iter().position(|id| {
                inner
                    .entries
                    .get(id)
                    .map(|stored| stored.evictable())
                    .unwrap_or(false)
            });

            let Some(pos) = victim_pos else {
                // Everything left is pinned or referenced.
                break;
            };

            let id = match inner.order.remove(pos) {
                Some(id) => id,
                None => break,
            };
            if let Some(stored) = inner.entries.remove(&id) {
                inner.total_bytes -= stored.entry.serialized_bytes;
                inner.evicted.insert(id.clone());
                tracing::warn!(
                    "Evicted lineage for {} ({} bytes, total now {})",
                    id,
                    stored.entry.serialized_bytes,
                    inner.total_bytes
                );
                evicted.push(stored.entry);
            }
        }

        evicted
    }

    pub fn get(&self, id: &ObjectId) -> LineageLookup {
        let inner = self.lock();
        if let Some(stored) = inner.entries.get(id) {
            LineageLookup::Present(stored.entry.clone())
        } else if inner.evicted.contains(id) {
            LineageLookup::Evicted
        } else {
            LineageLookup::NeverStored
        }
    }

    /// Defers eviction by marking the entry most-recently-useful.
    pub fn touch(&self, id: &ObjectId) {
        let mut inner = self.lock();
        if let Some(pos) = inner.order.iter().position(|entry| entry == id) {
            if let Some(entry) = inner.order.remove(pos) {
                inner.order.push_back(entry);
            }
        }
    }

    /// Protects the entry while a reconstruction is in flight.
    pub fn pin(&self, id: &ObjectId) {
        if let Some(stored) = self.lock().entries.get_mut(id) {
            stored.pins += 1;
        }
    }

    pub fn unpin(&self, id: &ObjectId) {
        if let Some(stored) = self.lock().entries.get_mut(id) {
            stored.pins = stored.pins.saturating_sub(1);
        }
    }

    /// Tracks whether the object itself currently has a direct reference,
    /// which protects the entry from budget eviction.
    pub fn set_referenced(&self, id: &ObjectId, referenced: bool) {
        if let Some(stored) = self.lock().entries.get_mut(id) {
            stored.referenced = referenced;
        }
    }

    /// Destroys the entry because nothing depends on the object anymore.
    /// Unlike eviction this is not recorded as permanent absence.
    pub fn remove(&self, id: &ObjectId) -> Option<LineageEntry> {
        let mut inner = self.lock();
        let stored = inner.entries.remove(id)?;
        inner.total_bytes -= stored.entry.serialized_bytes;
        if let Some(pos) = inner.order.iter().position(|entry| entry == id) {
            inner.order.remove(pos);
        }
        Some(stored.entry)
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
