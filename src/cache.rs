//! Byte-budgeted LRU of decoded buffers with a reference-count table and a
//! weak salvage slot.
//!
//! Entries live in three places:
//!
//! * the LRU, which owns a strong handle and is charged against the budget;
//! * the pin table, one counter per key held by installed receivers;
//! * the salvage map, weak handles to pinned buffers that were pushed out
//!   of the LRU and can still be found again without a redecode.
//!
//! A buffer is evicted by [`BufferCache::insert`] only while unpinned. Pinned
//! entries leave the LRU only through [`BufferCache::trim_to`] or memory
//! pressure, and land in the salvage map. The underlying pixels are
//! destroyed once they are neither resident nor pinned.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, DecodedImage};
use crate::error::{CacheError, LoadError};
use crate::spec::{CacheKey, ScopeId};

/// Platform memory pressure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryPressure {
    /// Drop unpinned entries down to three quarters of the budget.
    Moderate,
    /// Shrink to half the budget, demoting pinned entries to salvage.
    High,
    /// Empty the LRU.
    Critical,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub salvage_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub demotions: u64,
    pub destroyed: u64,
    pub resident_entries: usize,
    pub resident_bytes: usize,
    pub budget: usize,
    pub pinned: usize,
}

struct Entry {
    buffer: Buffer,
    bytes: usize,
}

struct Pin {
    count: usize,
    buffer: Buffer,
}

struct CacheState {
    lru: LruCache<CacheKey, Entry>,
    resident_bytes: usize,
    budget: usize,
    pins: HashMap<CacheKey, Pin>,
    salvage: HashMap<CacheKey, Weak<DecodedImage>>,
    stats: CacheStats,
}

impl CacheState {
    fn push(&mut self, key: CacheKey, buffer: Buffer) {
        let bytes = buffer.byte_size();
        if let Some((_, old)) = self.lru.push(key, Entry { buffer, bytes }) {
            self.resident_bytes -= old.bytes;
        }
        self.resident_bytes += bytes;
    }

    /// Pop entries from the cold end until `limit` holds.
    fn evict_to(&mut self, limit: usize, demote_pinned: bool) {
        while self.resident_bytes > limit {
            let victim = self
                .lru
                .iter()
                .rev()
                .find(|(key, _)| demote_pinned || !self.pins.contains_key(*key))
                .map(|(key, _)| key.clone());
            let Some(key) = victim else { break };
            let Some(entry) = self.lru.pop(&key) else { break };
            self.resident_bytes -= entry.bytes;
            if self.pins.contains_key(&key) {
                trace!(%key, bytes = entry.bytes, "demoting pinned buffer to salvage");
                self.salvage.insert(key, entry.buffer.downgrade());
                self.stats.demotions += 1;
            } else {
                trace!(%key, bytes = entry.bytes, "evicting buffer");
                self.stats.evictions += 1;
                self.stats.destroyed += 1;
            }
        }
    }

    fn report_overflow(&self) {
        if self.resident_bytes > self.budget {
            let soft = LoadError::BudgetExceeded {
                resident: self.resident_bytes,
                budget: self.budget,
            };
            warn!(%soft, pinned = self.pins.len(), "every resident buffer is pinned");
        }
    }
}

/// Shared handle to the buffer cache.
#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<Mutex<CacheState>>,
}

impl BufferCache {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                lru: LruCache::unbounded(),
                resident_bytes: 0,
                budget,
                pins: HashMap::new(),
                salvage: HashMap::new(),
                stats: CacheStats::default(),
            })),
        }
    }

    /// Look a buffer up in the LRU, then in the salvage slot.
    ///
    /// A salvaged buffer is promoted back into the LRU. Lookup alone never
    /// touches the reference count.
    pub fn acquire(&self, key: &CacheKey) -> Option<Buffer> {
        let mut state = self.inner.lock();
        if let Some(entry) = state.lru.get(key) {
            let buffer = entry.buffer.clone();
            state.stats.hits += 1;
            return Some(buffer);
        }
        let salvaged = state.salvage.remove(key).and_then(|weak| Buffer::upgrade(&weak));
        match salvaged {
            Some(buffer) => {
                debug!(%key, "resurrected buffer from salvage");
                state.stats.salvage_hits += 1;
                state.push(key.clone(), buffer.clone());
                let budget = state.budget;
                state.evict_to(budget, false);
                state.report_overflow();
                Some(buffer)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or replace the resident entry for `key`, then evict unpinned
    /// entries until the budget holds.
    pub fn insert(&self, key: CacheKey, buffer: Buffer) {
        let mut state = self.inner.lock();
        state.salvage.remove(&key);
        trace!(%key, bytes = buffer.byte_size(), "inserting buffer");
        state.push(key, buffer);
        let budget = state.budget;
        state.evict_to(budget, false);
        state.report_overflow();
    }

    /// Pin `buffer` under `key`; returns the new count.
    ///
    /// A buffer pinned while not resident (it was evicted between decode and
    /// install) is recorded in the salvage map so later lookups still find it.
    pub fn add_ref(&self, key: &CacheKey, buffer: &Buffer) -> usize {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let pin = state.pins.entry(key.clone()).or_insert_with(|| Pin {
            count: 0,
            buffer: buffer.clone(),
        });
        if !pin.buffer.ptr_eq(buffer) {
            trace!(%key, "pin now holds a newer buffer");
            pin.buffer = buffer.clone();
        }
        pin.count += 1;
        let count = pin.count;
        if !state.lru.contains(key) {
            state.salvage.insert(key.clone(), buffer.downgrade());
        }
        trace!(%key, count, "reference added");
        count
    }

    /// Release one reference; returns the remaining count.
    ///
    /// Reaching zero destroys the buffer if it is no longer resident.
    pub fn remove_ref(&self, key: &CacheKey) -> Result<usize, CacheError> {
        let mut state = self.inner.lock();
        let Some(pin) = state.pins.get_mut(key) else {
            warn!(%key, "reference released without being held");
            return Err(CacheError::RefUnderflow(key.to_string()));
        };
        pin.count -= 1;
        let remaining = pin.count;
        if remaining == 0 {
            state.pins.remove(key);
            if state.lru.contains(key) {
                // Unpinning may be what lets an over-budget cache shrink again.
                let budget = state.budget;
                state.evict_to(budget, false);
            } else {
                state.salvage.remove(key);
                state.stats.destroyed += 1;
                debug!(%key, "last reference released on evicted buffer");
            }
        }
        Ok(remaining)
    }

    pub fn ref_count(&self, key: &CacheKey) -> usize {
        self.inner.lock().pins.get(key).map_or(0, |pin| pin.count)
    }

    /// Whether `key` sits in the LRU. Does not promote.
    pub fn is_resident(&self, key: &CacheKey) -> bool {
        self.inner.lock().lru.contains(key)
    }

    /// Whether `key` can be served by [`BufferCache::acquire`] without a decode.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let state = self.inner.lock();
        state.lru.contains(key)
            || state
                .salvage
                .get(key)
                .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Drop every resident and salvaged entry of `scope`; pins stay with
    /// their holders. Returns the number of entries dropped.
    pub fn purge_scope(&self, scope: ScopeId) -> usize {
        let mut state = self.inner.lock();
        let doomed: Vec<CacheKey> = state
            .lru
            .iter()
            .filter(|(key, _)| key.scope() == scope)
            .map(|(key, _)| key.clone())
            .collect();
        let mut purged = 0;
        for key in doomed {
            if let Some(entry) = state.lru.pop(&key) {
                state.resident_bytes -= entry.bytes;
                if !state.pins.contains_key(&key) {
                    state.stats.destroyed += 1;
                }
                purged += 1;
            }
        }
        let before = state.salvage.len();
        state.salvage.retain(|key, _| key.scope() != scope);
        purged += before - state.salvage.len();
        debug!(%scope, purged, "purged cache scope");
        purged
    }

    pub fn set_budget(&self, budget: usize) {
        let mut state = self.inner.lock();
        state.budget = budget;
        state.evict_to(budget, false);
        state.report_overflow();
    }

    pub fn budget(&self) -> usize {
        self.inner.lock().budget
    }

    /// Shrink the LRU to `bytes`, demoting pinned entries to salvage.
    pub fn trim_to(&self, bytes: usize) {
        self.inner.lock().evict_to(bytes, true);
    }

    pub fn on_memory_pressure(&self, level: MemoryPressure) {
        let mut state = self.inner.lock();
        let budget = state.budget;
        let before = state.resident_bytes;
        match level {
            MemoryPressure::Moderate => state.evict_to(budget / 4 * 3, false),
            MemoryPressure::High => state.evict_to(budget / 2, true),
            MemoryPressure::Critical => state.evict_to(0, true),
        }
        debug!(?level, before, after = state.resident_bytes, "memory pressure handled");
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        CacheStats {
            resident_entries: state.lru.len(),
            resident_bytes: state.resident_bytes,
            budget: state.budget,
            pinned: state.pins.len(),
            ..state.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelFormat;
    use crate::spec::ImageSpec;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn buffer(len: usize) -> Buffer {
        Buffer::new(DecodedImage {
            width: 1,
            height: 1,
            format: PixelFormat::Rgba8,
            pixels: vec![0; len],
            rotation: 0,
        })
    }

    fn key(id: i64) -> CacheKey {
        ImageSpec::remote(ScopeId(1), id)
            .with_size(64)
            .cache_key()
            .clone()
    }

    fn cost() -> usize {
        buffer(1000).byte_size()
    }

    #[test]
    fn insert_keeps_resident_bytes_within_budget() {
        let cache = BufferCache::new(cost() * 2);
        for id in 0..5 {
            cache.insert(key(id), buffer(1000));
            assert!(cache.stats().resident_bytes <= cache.budget());
        }
        assert!(cache.is_resident(&key(4)));
        assert!(cache.is_resident(&key(3)));
        assert!(!cache.is_resident(&key(0)));
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn lookup_refreshes_recency() {
        let cache = BufferCache::new(cost() * 2);
        cache.insert(key(1), buffer(1000));
        cache.insert(key(2), buffer(1000));
        assert!(cache.acquire(&key(1)).is_some());
        cache.insert(key(3), buffer(1000));
        assert!(cache.is_resident(&key(1)));
        assert!(!cache.is_resident(&key(2)));
    }

    #[test]
    fn pinned_entries_survive_insert_pressure() {
        let cache = BufferCache::new(cost());
        let pinned = buffer(1000);
        cache.insert(key(1), pinned.clone());
        cache.add_ref(&key(1), &pinned);
        cache.insert(key(2), buffer(1000));
        assert!(cache.is_resident(&key(1)));
        assert!(!cache.is_resident(&key(2)));
    }

    #[test]
    fn every_entry_pinned_allows_overflow() {
        let cache = BufferCache::new(cost());
        for id in 0..3 {
            let b = buffer(1000);
            cache.add_ref(&key(id), &b);
            cache.insert(key(id), b);
        }
        let stats = cache.stats();
        assert_eq!(stats.resident_entries, 3);
        assert!(stats.resident_bytes > stats.budget);
    }

    #[test]
    fn demoted_buffer_is_salvaged_without_copy() {
        let cache = BufferCache::new(cost() * 4);
        let original = buffer(1000);
        cache.insert(key(1), original.clone());
        cache.add_ref(&key(1), &original);

        cache.on_memory_pressure(MemoryPressure::Critical);
        assert!(!cache.is_resident(&key(1)));
        assert!(cache.contains(&key(1)));

        let again = cache.acquire(&key(1)).expect("salvaged");
        assert!(again.ptr_eq(&original));
        assert!(cache.is_resident(&key(1)));
        let stats = cache.stats();
        assert_eq!(stats.salvage_hits, 1);
        assert_eq!(stats.demotions, 1);
    }

    #[test]
    fn last_release_destroys_evicted_buffer() {
        let cache = BufferCache::new(cost() * 4);
        let b = buffer(1000);
        let weak = b.downgrade();
        cache.insert(key(1), b.clone());
        cache.add_ref(&key(1), &b);
        drop(b);

        cache.trim_to(0);
        assert!(weak.upgrade().is_some());
        assert_eq!(cache.remove_ref(&key(1)), Ok(0));
        assert!(weak.upgrade().is_none());
        assert!(!cache.contains(&key(1)));
        assert_eq!(cache.acquire(&key(1)).map(|_| ()), None);
    }

    #[test]
    fn last_release_keeps_resident_buffer() {
        let cache = BufferCache::new(cost() * 4);
        let b = buffer(1000);
        cache.insert(key(1), b.clone());
        cache.add_ref(&key(1), &b);
        assert_eq!(cache.remove_ref(&key(1)), Ok(0));
        assert!(cache.is_resident(&key(1)));
        assert_eq!(cache.stats().destroyed, 0);
    }

    #[test]
    fn pinning_an_evicted_buffer_keeps_it_findable() {
        let cache = BufferCache::new(cost());
        let first = buffer(1000);
        cache.insert(key(1), first.clone());
        cache.insert(key(2), buffer(1000));
        assert!(!cache.is_resident(&key(1)));

        // installed after eviction
        cache.add_ref(&key(1), &first);
        assert!(cache.contains(&key(1)));
        let found = cache.acquire(&key(1)).expect("pinned buffer");
        assert!(found.ptr_eq(&first));
        assert_eq!(cache.stats().salvage_hits, 1);
    }

    #[test]
    fn pin_follows_a_redecoded_buffer() {
        let cache = BufferCache::new(cost() * 4);
        let old = buffer(1000);
        cache.insert(key(1), old.clone());
        cache.add_ref(&key(1), &old);
        cache.purge_scope(ScopeId(1));
        let weak = old.downgrade();
        drop(old);

        let fresh = buffer(1000);
        cache.insert(key(1), fresh.clone());
        assert_eq!(cache.add_ref(&key(1), &fresh), 2);
        drop(fresh);
        assert!(weak.upgrade().is_none());
        cache.trim_to(0);
        assert!(cache.acquire(&key(1)).is_some());
    }

    #[test]
    fn release_without_reference_is_rejected() {
        let cache = BufferCache::new(cost());
        assert_eq!(
            cache.remove_ref(&key(9)),
            Err(CacheError::RefUnderflow(key(9).to_string()))
        );
        assert_eq!(cache.ref_count(&key(9)), 0);
    }

    #[test]
    fn moderate_pressure_spares_pinned() {
        let cache = BufferCache::new(cost() * 4);
        let pinned = buffer(1000);
        cache.insert(key(1), pinned.clone());
        cache.add_ref(&key(1), &pinned);
        for id in 2..5 {
            cache.insert(key(id), buffer(1000));
        }
        cache.on_memory_pressure(MemoryPressure::Moderate);
        assert!(cache.is_resident(&key(1)));
        assert!(cache.stats().resident_bytes <= cost() * 3);
        assert_eq!(cache.stats().demotions, 0);
    }

    #[test]
    fn purge_scope_leaves_other_scopes() {
        let cache = BufferCache::new(cost() * 8);
        let other = ImageSpec::remote(ScopeId(2), 1).with_size(64).cache_key().clone();
        cache.insert(key(1), buffer(1000));
        cache.insert(key(2), buffer(1000));
        cache.insert(other.clone(), buffer(1000));
        assert_eq!(cache.purge_scope(ScopeId(1)), 2);
        assert!(cache.is_resident(&other));
        assert!(!cache.is_resident(&key(1)));
        assert_eq!(cache.stats().resident_bytes, cost());
    }

    #[test]
    fn shrinking_budget_evicts() {
        let cache = BufferCache::new(cost() * 4);
        for id in 0..4 {
            cache.insert(key(id), buffer(1000));
        }
        cache.set_budget(cost());
        assert_eq!(cache.stats().resident_entries, 1);
        assert!(cache.is_resident(&key(3)));
    }

    #[test]
    fn random_reference_sequences_hold_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let cache = BufferCache::new(cost() * 2);
        let mut counts = [0usize; 4];
        let mut weaks: [Option<Weak<DecodedImage>>; 4] = Default::default();

        for _ in 0..2000 {
            let id = rng.random_range(0..4usize);
            let k = key(id as i64);
            match rng.random_range(0..5) {
                0 => {
                    let alive = weaks[id].as_ref().is_some_and(|w| w.strong_count() > 0);
                    if !alive {
                        let b = buffer(1000);
                        weaks[id] = Some(b.downgrade());
                        cache.insert(k.clone(), b);
                    }
                }
                1 => {
                    if let Some(b) = cache.acquire(&k) {
                        counts[id] = cache.add_ref(&k, &b);
                    }
                }
                2 | 3 => match cache.remove_ref(&k) {
                    Ok(left) => {
                        assert!(counts[id] > 0);
                        counts[id] = left;
                    }
                    Err(CacheError::RefUnderflow(_)) => assert_eq!(counts[id], 0),
                },
                _ => cache.on_memory_pressure(MemoryPressure::High),
            }

            let stats = cache.stats();
            let all_pinned = (0..4).all(|i| !cache.is_resident(&key(i as i64)) || counts[i] > 0);
            assert!(stats.resident_bytes <= stats.budget || all_pinned);
            for i in 0..4 {
                let ki = key(i as i64);
                assert_eq!(cache.ref_count(&ki), counts[i]);
                let alive = weaks[i].as_ref().is_some_and(|w| w.strong_count() > 0);
                let should_live = counts[i] > 0 || cache.is_resident(&ki);
                assert_eq!(alive, should_live, "key {i}");
            }
        }
    }
}
