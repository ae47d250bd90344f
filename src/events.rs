use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::buffer::Buffer;
use crate::cache::CacheStats;
use crate::error::LoadError;
use crate::spec::{CacheKey, ImageSpec, ScopeId, SourceId};
use crate::tasks::actor::ActorId;
use crate::tasks::watchers::{WatcherId, WatcherRef};

/// Bytes produced by a fetch, either spooled to disk or kept in memory.
#[derive(Debug, Clone)]
pub enum SourceData {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// One item of a transport stream.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// Fraction in `[0, 1]`.
    Progress(f32),
    Ready(SourceData),
    Failed(String),
}

/// Work handed to a decode worker.
#[derive(Debug)]
pub struct DecodeJob {
    pub actor: ActorId,
    pub spec: ImageSpec,
    /// Fetched bytes; `None` for sources decoded straight from the spec.
    pub data: Option<SourceData>,
    pub cancel: CancellationToken,
}

/// What a worker posts back once a job is done.
#[derive(Debug)]
pub struct DecodeOutcome {
    pub actor: ActorId,
    pub key: CacheKey,
    pub result: Result<Buffer, LoadError>,
    pub elapsed: Duration,
}

/// Terminal notification handed to each watcher.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub key: CacheKey,
    pub outcome: Result<Buffer, LoadError>,
    /// The buffer was already resident when the request arrived.
    pub from_cache: bool,
}

impl LoadResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub actors: usize,
    pub fetches: usize,
    pub watchers: usize,
    pub decodes_dispatched: u64,
    pub fetches_started: u64,
    pub cache: CacheStats,
}

/// Messages accepted by the coordinator mailbox.
pub enum Command {
    Request {
        spec: ImageSpec,
        watcher: WatcherRef,
    },
    Leave {
        key: CacheKey,
        watcher: WatcherId,
    },
    Clear {
        scope: ScopeId,
    },
    FetchProgress {
        source: SourceId,
        generation: u64,
        progress: f32,
    },
    FetchComplete {
        source: SourceId,
        generation: u64,
        result: Result<SourceData, LoadError>,
    },
    DecodeComplete(DecodeOutcome),
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
    Shutdown,
}

pub type CommandSender = UnboundedSender<Command>;
