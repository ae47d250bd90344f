//! Single owner of the actor table, the watcher registries and the fetch
//! dedup table.
//!
//! Everything that mutates those tables arrives as a [`Command`] on one
//! mailbox and is handled by one task, so none of them needs a lock. Callers
//! on any thread talk to it through the cloneable [`Coordinator`] handle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::buffer::Buffer;
use crate::cache::BufferCache;
use crate::config::Configuration;
use crate::error::{Error, LoadError};
use crate::events::{
    Command, CommandSender, CoordinatorStats, FetchEvent, LoadResult, SourceData,
};
use crate::processing::decode::Decode;
use crate::spec::{CacheKey, ImageSpec, ScopeId, SourceId, SpecFlags};
use crate::tasks::actor::{ActorId, LoadActor};
use crate::tasks::transport::Transport;
use crate::tasks::watchers::{WatcherId, WatcherRef};
use crate::tasks::workers::DecodePool;

/// Cloneable entry point to the coordinator task.
#[derive(Clone)]
pub struct Coordinator {
    tx: CommandSender,
    cache: BufferCache,
}

impl Coordinator {
    /// Ask for `spec` on behalf of `watcher`. Returns once queued.
    pub fn request(&self, spec: ImageSpec, watcher: WatcherRef) -> Result<(), Error> {
        self.send(Command::Request { spec, watcher })
    }

    pub fn leave(&self, key: CacheKey, watcher: WatcherId) -> Result<(), Error> {
        self.send(Command::Leave { key, watcher })
    }

    /// Cancel every load of `scope` and purge its cached buffers.
    pub fn clear(&self, scope: ScopeId) -> Result<(), Error> {
        self.send(Command::Clear { scope })
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| Error::CoordinatorClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.tx.send(cmd).map_err(|_| Error::CoordinatorClosed)
    }
}

/// Start the decode workers and the coordinator task.
pub fn spawn(
    cfg: &Configuration,
    cache: BufferCache,
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn Decode>,
    cancel: CancellationToken,
) -> Result<(Coordinator, JoinHandle<Result<()>>), Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = DecodePool::spawn(cfg, decoder, tx.clone())?;
    let state = CoordinatorState::new(cache.clone(), transport, pool, tx.clone());
    let handle = tokio::spawn(run(state, rx, cancel));
    Ok((Coordinator { tx, cache }, handle))
}

struct FetchEntry {
    generation: u64,
    cancel: CancellationToken,
    /// Actors waiting on this download.
    keys: Vec<CacheKey>,
    progress: Option<f32>,
    abandon: Option<bool>,
}

pub struct CoordinatorState {
    cache: BufferCache,
    transport: Arc<dyn Transport>,
    pool: Option<DecodePool>,
    mailbox: CommandSender,
    actors: HashMap<CacheKey, LoadActor>,
    fetches: HashMap<SourceId, FetchEntry>,
    next_generation: u64,
    decodes_dispatched: u64,
    fetches_started: u64,
}

impl CoordinatorState {
    pub fn new(
        cache: BufferCache,
        transport: Arc<dyn Transport>,
        pool: DecodePool,
        mailbox: CommandSender,
    ) -> Self {
        Self {
            cache,
            transport,
            pool: Some(pool),
            mailbox,
            actors: HashMap::new(),
            fetches: HashMap::new(),
            next_generation: 0,
            decodes_dispatched: 0,
            fetches_started: 0,
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Request { spec, watcher } => self.request(spec, watcher),
            Command::Leave { key, watcher } => self.leave(&key, watcher),
            Command::Clear { scope } => self.clear(scope),
            Command::FetchProgress {
                source,
                generation,
                progress,
            } => self.on_fetch_progress(&source, generation, progress),
            Command::FetchComplete {
                source,
                generation,
                result,
            } => self.on_fetch_complete(&source, generation, result),
            Command::DecodeComplete(outcome) => {
                trace!(key = %outcome.key, elapsed_ms = outcome.elapsed.as_millis() as u64, "decode finished");
                self.on_decode_complete(&outcome.key, outcome.actor, outcome.result)
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn request(&mut self, spec: ImageSpec, watcher: WatcherRef) {
        if !watcher.is_alive() {
            return;
        }
        let key = spec.cache_key().clone();

        if let Some(actor) = self.actors.get_mut(&key) {
            if actor.join(watcher.clone()) {
                debug!(actor = %actor.id(), %key, watcher = %watcher.id(), "joined running actor");
            }
            return;
        }

        if let Some(buffer) = self.cache.acquire(&key) {
            trace!(%key, "request served from cache");
            watcher.deliver(LoadResult {
                key,
                outcome: Ok(buffer),
                from_cache: true,
            });
            return;
        }

        let mut actor = LoadActor::new(spec.clone());
        actor.join(watcher);
        debug!(actor = %actor.id(), %key, strategy = ?spec.source().strategy(), "actor created");
        let source = actor.source_id().cloned();
        self.actors.insert(key.clone(), actor);

        match source {
            Some(source) => self.attach_fetch(source, &spec),
            None => self.start_decode(&key, None),
        }
    }

    fn attach_fetch(&mut self, source: SourceId, spec: &ImageSpec) {
        let key = spec.cache_key().clone();
        if let Some(entry) = self.fetches.get_mut(&source) {
            debug!(%source, %key, "fetch already in flight, sharing it");
            entry.keys.push(key.clone());
            entry.abandon = merge_abandon(entry.abandon, abandon_policy(spec));
            if let Some(progress) = entry.progress {
                if let Some(actor) = self.actors.get_mut(&key) {
                    actor.record_progress(progress);
                }
            }
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        let stream = self.transport.fetch(spec, cancel.clone());
        tokio::spawn(drive_fetch(
            stream,
            source.clone(),
            generation,
            self.mailbox.clone(),
            cancel.clone(),
        ));
        let abandon = abandon_policy(spec);
        debug!(%source, generation, "fetch started");
        self.fetches_started += 1;
        self.fetches.insert(
            source,
            FetchEntry {
                generation,
                cancel,
                keys: vec![key],
                progress: None,
                abandon,
            },
        );
    }

    fn start_decode(&mut self, key: &CacheKey, data: Option<SourceData>) {
        let Some(actor) = self.actors.get_mut(key) else {
            return;
        };
        if actor.prune() {
            debug!(%key, "no live watchers left, skipping decode");
            self.retire(key);
            return;
        }
        let actor_id = actor.id();
        let Some(job) = actor.decode_job(data) else {
            return;
        };
        let submitted = match &self.pool {
            Some(pool) => pool.submit(job),
            None => Err(LoadError::Cancelled),
        };
        match submitted {
            Ok(worker) => {
                self.decodes_dispatched += 1;
                trace!(%key, %worker, "decode dispatched");
            }
            Err(err) => {
                warn!(%key, error = %err, "could not dispatch decode");
                self.complete(key, Some(actor_id), Err(err));
            }
        }
    }

    fn on_fetch_progress(&mut self, source: &SourceId, generation: u64, progress: f32) {
        let Some(entry) = self.fetches.get_mut(source) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.progress = Some(progress);
        let keys = entry.keys.clone();
        let mut abandoned = Vec::new();
        for key in keys {
            let Some(actor) = self.actors.get_mut(&key) else {
                continue;
            };
            if actor.prune() {
                abandoned.push(key);
            } else {
                actor.record_progress(progress);
            }
        }
        for key in abandoned {
            debug!(%key, "no live watchers left, retiring actor");
            self.retire(&key);
        }
    }

    fn on_fetch_complete(
        &mut self,
        source: &SourceId,
        generation: u64,
        result: Result<SourceData, LoadError>,
    ) {
        let current = self
            .fetches
            .get(source)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            trace!(%source, generation, "ignoring stale fetch result");
            return;
        }
        let Some(entry) = self.fetches.remove(source) else {
            return;
        };
        debug!(%source, ok = result.is_ok(), waiting = entry.keys.len(), "fetch complete");
        for key in entry.keys {
            match &result {
                Ok(data) => self.start_decode(&key, Some(data.clone())),
                Err(err) => self.complete(&key, None, Err(err.clone())),
            }
        }
    }

    fn on_decode_complete(
        &mut self,
        key: &CacheKey,
        actor: ActorId,
        result: Result<Buffer, LoadError>,
    ) {
        self.complete(key, Some(actor), result);
    }

    /// Retire the actor for `key` and hand `result` to all of its watchers.
    ///
    /// The cache is filled before fan-out so every watcher sees the same state.
    fn complete(&mut self, key: &CacheKey, actor: Option<ActorId>, result: Result<Buffer, LoadError>) {
        let matches = self
            .actors
            .get(key)
            .is_some_and(|a| actor.is_none_or(|id| a.id() == id));
        if !matches {
            trace!(%key, "result for retired actor dropped");
            return;
        }
        let Some(mut actor) = self.actors.remove(key) else {
            return;
        };
        if let Ok(buffer) = &result {
            if actor.spec().should_cache() {
                self.cache.insert(key.clone(), buffer.clone());
            }
        }
        let ok = result.is_ok();
        let delivered = actor.watchers_mut().fan_out(&LoadResult {
            key: key.clone(),
            outcome: result,
            from_cache: false,
        });
        debug!(actor = %actor.id(), %key, ok, delivered, age_ms = actor.age().as_millis() as u64, "actor completed");
    }

    fn leave(&mut self, key: &CacheKey, watcher: WatcherId) {
        let Some(actor) = self.actors.get_mut(key) else {
            return;
        };
        actor.leave(watcher);
        if actor.prune() {
            self.retire(key);
        }
    }

    /// Cancel and drop the actor for `key`, detaching it from its fetch.
    fn retire(&mut self, key: &CacheKey) -> Option<LoadActor> {
        let actor = self.actors.remove(key)?;
        actor.cancel();
        if let Some(source) = actor.source_id() {
            self.detach_fetch(source, key);
        }
        Some(actor)
    }

    fn detach_fetch(&mut self, source: &SourceId, key: &CacheKey) {
        let Some(entry) = self.fetches.get_mut(source) else {
            return;
        };
        entry.keys.retain(|k| k != key);
        if !entry.keys.is_empty() {
            return;
        }
        if let Some(entry) = self.fetches.remove(source) {
            debug!(%source, "last consumer gone, cancelling fetch");
            entry.cancel.cancel();
            if let Some(only_pending) = entry.abandon {
                self.transport.abandon(source, only_pending);
            }
        }
    }

    fn clear(&mut self, scope: ScopeId) {
        let doomed: Vec<CacheKey> = self
            .actors
            .keys()
            .filter(|key| key.scope() == scope)
            .cloned()
            .collect();
        let cancelled = doomed.len();
        for key in doomed {
            if let Some(mut actor) = self.retire(&key) {
                actor.watchers_mut().fan_out(&LoadResult {
                    key: key.clone(),
                    outcome: Err(LoadError::Cancelled),
                    from_cache: false,
                });
            }
        }
        let purged = self.cache.purge_scope(scope);
        info!(%scope, cancelled, purged, "scope cleared");
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            actors: self.actors.len(),
            fetches: self.fetches.len(),
            watchers: self.actors.values().map(|a| a.watchers().len()).sum(),
            decodes_dispatched: self.decodes_dispatched,
            fetches_started: self.fetches_started,
            cache: self.cache.stats(),
        }
    }

    async fn shutdown(&mut self) {
        for actor in self.actors.values() {
            actor.cancel();
        }
        self.actors.clear();
        for entry in self.fetches.values() {
            entry.cancel.cancel();
        }
        self.fetches.clear();
        if let Some(pool) = self.pool.take() {
            if tokio::task::spawn_blocking(move || pool.shutdown()).await.is_err() {
                warn!("decode pool shutdown panicked");
            }
        }
    }
}

/// Transport abandon policy requested by `spec`: `Some(only_pending)`.
fn abandon_policy(spec: &ImageSpec) -> Option<bool> {
    if spec.has(SpecFlags::CANCEL_ON_DROP) {
        Some(false)
    } else if spec.has(SpecFlags::CANCEL_ONLY_PENDING) {
        Some(true)
    } else {
        None
    }
}

/// Combine the policies of specs sharing one fetch; the broadest wins.
fn merge_abandon(current: Option<bool>, joining: Option<bool>) -> Option<bool> {
    match (current, joining) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), _) | (_, Some(true)) => Some(true),
        (None, None) => None,
    }
}

async fn drive_fetch(
    mut stream: BoxStream<'static, FetchEvent>,
    source: SourceId,
    generation: u64,
    mailbox: CommandSender,
    cancel: CancellationToken,
) {
    loop {
        let event = select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };
        let (cmd, last) = match event {
            Some(FetchEvent::Progress(progress)) => (
                Command::FetchProgress {
                    source: source.clone(),
                    generation,
                    progress,
                },
                false,
            ),
            Some(FetchEvent::Ready(data)) => (
                Command::FetchComplete {
                    source: source.clone(),
                    generation,
                    result: Ok(data),
                },
                true,
            ),
            Some(FetchEvent::Failed(reason)) => (
                Command::FetchComplete {
                    source: source.clone(),
                    generation,
                    result: Err(LoadError::FetchFailed {
                        origin: source.to_string(),
                        reason,
                    }),
                },
                true,
            ),
            None => (
                Command::FetchComplete {
                    source: source.clone(),
                    generation,
                    result: Err(LoadError::FetchFailed {
                        origin: source.to_string(),
                        reason: "transport ended without data".into(),
                    }),
                },
                true,
            ),
        };
        if mailbox.send(cmd).is_err() || last {
            break;
        }
    }
}

#[instrument(skip_all)]
pub async fn run(
    mut state: CoordinatorState,
    mut rx: UnboundedReceiver<Command>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("coordinator started");
    loop {
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; stopping coordinator");
                break;
            }
            cmd = rx.recv() => match cmd {
                Some(Command::Shutdown) | None => {
                    info!("shutdown requested; stopping coordinator");
                    break;
                }
                Some(cmd) => state.handle(cmd),
            },
        }
    }
    state.shutdown().await;
    Ok(())
}
