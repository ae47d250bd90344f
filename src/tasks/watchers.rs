//! Consumers waiting on an in-flight load.
//!
//! The coordinator never holds a consumer alive. Each [`WatcherRef`] carries a
//! [`LivenessToken`] that the consumer revokes when it goes away, and every
//! notification checks the token first.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::events::LoadResult;
use crate::spec::CacheKey;

/// Callback surface of a consumer.
pub trait Watcher: Send + Sync {
    fn on_progress(&self, _key: &CacheKey, _progress: f32) {}

    fn on_result(&self, result: LoadResult);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

impl WatcherId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Owner-revocable flag telling the coordinator whether a consumer still exists.
#[derive(Debug, Clone)]
pub struct LivenessToken(Arc<AtomicBool>);

impl LivenessToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for LivenessToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning handle to a consumer, as stored by the coordinator.
#[derive(Clone)]
pub struct WatcherRef {
    id: WatcherId,
    token: LivenessToken,
    target: Arc<dyn Watcher>,
}

impl fmt::Debug for WatcherRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherRef")
            .field("id", &self.id)
            .field("alive", &self.token.is_alive())
            .finish()
    }
}

impl WatcherRef {
    pub fn new(id: WatcherId, token: LivenessToken, target: Arc<dyn Watcher>) -> Self {
        Self { id, token, target }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.token.is_alive()
    }

    pub fn notify_progress(&self, key: &CacheKey, progress: f32) {
        if self.is_alive() {
            self.target.on_progress(key, progress);
        }
    }

    /// Hand over a terminal result; `false` if the consumer is gone.
    pub fn deliver(&self, result: LoadResult) -> bool {
        if !self.is_alive() {
            trace!(watcher = %self.id, key = %result.key, "dropping result for dead watcher");
            return false;
        }
        self.target.on_result(result);
        true
    }
}

/// Ordered set of watchers of one actor.
#[derive(Debug, Default)]
pub struct WatcherRegistry {
    members: Vec<WatcherRef>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `watcher`; `false` if it had already joined.
    pub fn join(&mut self, watcher: WatcherRef) -> bool {
        if self.contains(watcher.id) {
            return false;
        }
        self.members.push(watcher);
        true
    }

    pub fn leave(&mut self, id: WatcherId) -> bool {
        let before = self.members.len();
        self.members.retain(|w| w.id != id);
        before != self.members.len()
    }

    pub fn contains(&self, id: WatcherId) -> bool {
        self.members.iter().any(|w| w.id == id)
    }

    /// Drop members whose owner is gone; returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let before = self.members.len();
        self.members.retain(WatcherRef::is_alive);
        before - self.members.len()
    }

    pub fn has_live(&self) -> bool {
        self.members.iter().any(WatcherRef::is_alive)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn broadcast_progress(&self, key: &CacheKey, progress: f32) {
        for watcher in &self.members {
            watcher.notify_progress(key, progress);
        }
    }

    /// Deliver the same result to every member in join order, emptying the
    /// registry. Returns the number of live deliveries.
    pub fn fan_out(&mut self, result: &LoadResult) -> usize {
        self.members
            .drain(..)
            .filter(|w| w.deliver(result.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::spec::{ImageSpec, ScopeId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        results: Mutex<Vec<bool>>,
        progress: Mutex<Vec<f32>>,
    }

    impl Watcher for Recorder {
        fn on_progress(&self, _key: &CacheKey, progress: f32) {
            self.progress.lock().push(progress);
        }

        fn on_result(&self, result: LoadResult) {
            self.results.lock().push(result.is_success());
        }
    }

    fn member(rec: &Arc<Recorder>) -> (WatcherRef, LivenessToken) {
        let token = LivenessToken::new();
        let target: Arc<dyn Watcher> = rec.clone();
        (WatcherRef::new(WatcherId::next(), token.clone(), target), token)
    }

    fn failure() -> LoadResult {
        LoadResult {
            key: ImageSpec::remote(ScopeId(0), 1).cache_key().clone(),
            outcome: Err(LoadError::Cancelled),
            from_cache: false,
        }
    }

    #[test]
    fn join_is_idempotent() {
        let rec = Arc::new(Recorder::default());
        let (w, _token) = member(&rec);
        let mut registry = WatcherRegistry::new();
        assert!(registry.join(w.clone()));
        assert!(!registry.join(w.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.leave(w.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn revoked_members_are_skipped_and_pruned() {
        let live = Arc::new(Recorder::default());
        let dead = Arc::new(Recorder::default());
        let (a, _keep) = member(&live);
        let (b, token) = member(&dead);
        let mut registry = WatcherRegistry::new();
        registry.join(a);
        registry.join(b);
        token.revoke();

        let key = failure().key;
        registry.broadcast_progress(&key, 0.5);
        assert_eq!(*live.progress.lock(), vec![0.5]);
        assert!(dead.progress.lock().is_empty());

        assert_eq!(registry.prune(), 1);
        assert!(registry.has_live());
        assert_eq!(registry.fan_out(&failure()), 1);
        assert!(registry.is_empty());
        assert_eq!(*live.results.lock(), vec![false]);
        assert!(dead.results.lock().is_empty());
    }
}
