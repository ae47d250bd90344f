//! One in-flight load per unique cache key.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::DecodeJob;
use crate::events::SourceData;
use crate::spec::{CacheKey, ImageSpec, SourceId};
use crate::tasks::watchers::{WatcherId, WatcherRef, WatcherRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStage {
    /// Waiting for the transport to deliver the source bytes.
    AwaitingFetch,
    /// Handed to a decode worker.
    Decoding,
}

#[derive(Debug)]
pub struct LoadActor {
    id: ActorId,
    spec: ImageSpec,
    key: CacheKey,
    source: Option<SourceId>,
    cancel: CancellationToken,
    watchers: WatcherRegistry,
    stage: ActorStage,
    progress: Option<f32>,
    started: Instant,
}

impl LoadActor {
    pub fn new(spec: ImageSpec) -> Self {
        let key = spec.cache_key().clone();
        let (source, stage) = if spec.needs_fetch() {
            (Some(spec.source_id()), ActorStage::AwaitingFetch)
        } else {
            (None, ActorStage::Decoding)
        };
        Self {
            id: ActorId::next(),
            spec,
            key,
            source,
            cancel: CancellationToken::new(),
            watchers: WatcherRegistry::new(),
            stage,
            progress: None,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Fetch dedup key, present only for sources that need the transport.
    pub fn source_id(&self) -> Option<&SourceId> {
        self.source.as_ref()
    }

    pub fn stage(&self) -> ActorStage {
        self.stage
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the worker to drop this job; a running decode is not preempted.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(actor = %self.id, key = %self.key, "cancelling actor");
            self.cancel.cancel();
        }
    }

    pub fn join(&mut self, watcher: WatcherRef) -> bool {
        let joined = self.watchers.join(watcher.clone());
        if joined {
            if let Some(progress) = self.progress {
                watcher.notify_progress(&self.key, progress);
            }
        }
        joined
    }

    pub fn leave(&mut self, watcher: WatcherId) -> bool {
        self.watchers.leave(watcher)
    }

    /// Drop dead watchers; `true` when nobody is left waiting.
    pub fn prune(&mut self) -> bool {
        self.watchers.prune();
        self.watchers.is_empty()
    }

    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    pub fn watchers_mut(&mut self) -> &mut WatcherRegistry {
        &mut self.watchers
    }

    pub fn progress(&self) -> Option<f32> {
        self.progress
    }

    pub fn record_progress(&mut self, progress: f32) {
        let progress = progress.clamp(0.0, 1.0);
        self.progress = Some(progress);
        self.watchers.broadcast_progress(&self.key, progress);
    }

    /// Build the worker job and move to [`ActorStage::Decoding`].
    ///
    /// Returns `None` once cancelled so no further work is dispatched.
    pub fn decode_job(&mut self, data: Option<SourceData>) -> Option<DecodeJob> {
        if self.is_cancelled() {
            return None;
        }
        self.stage = ActorStage::Decoding;
        Some(DecodeJob {
            actor: self.id,
            spec: self.spec.clone(),
            data,
            cancel: self.cancel.clone(),
        })
    }
}
