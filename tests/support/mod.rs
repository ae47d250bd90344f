#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use imagepipe::buffer::{DecodedImage, PixelFormat};
use imagepipe::cache::BufferCache;
use imagepipe::config::Configuration;
use imagepipe::error::DecodeError;
use imagepipe::events::{FetchEvent, LoadResult, SourceData};
use imagepipe::processing::decode::Decode;
use imagepipe::spec::{CacheKey, ImageSpec, SourceId};
use imagepipe::tasks::coordinator::{self, Coordinator};
use imagepipe::tasks::transport::Transport;
use imagepipe::tasks::watchers::{LivenessToken, Watcher, WatcherId, WatcherRef};

pub struct ScriptedFetch {
    pub source: SourceId,
    pub tx: fmpsc::UnboundedSender<FetchEvent>,
    pub cancel: CancellationToken,
}

/// Transport whose streams are fed by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    fetches: Mutex<Vec<ScriptedFetch>>,
    pub abandoned: Mutex<Vec<(SourceId, bool)>>,
}

impl ScriptedTransport {
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn send(&self, source: &SourceId, event: FetchEvent) {
        let fetches = self.fetches.lock();
        let fetch = fetches
            .iter()
            .rev()
            .find(|f| &f.source == source)
            .expect("no fetch started for source");
        fetch.tx.unbounded_send(event).expect("fetch stream dropped");
    }

    pub fn cancel_token(&self, source: &SourceId) -> CancellationToken {
        self.fetches
            .lock()
            .iter()
            .rev()
            .find(|f| &f.source == source)
            .map(|f| f.cancel.clone())
            .expect("no fetch started for source")
    }
}

impl Transport for ScriptedTransport {
    fn fetch(&self, spec: &ImageSpec, cancel: CancellationToken) -> BoxStream<'static, FetchEvent> {
        let (tx, rx) = fmpsc::unbounded();
        self.fetches.lock().push(ScriptedFetch {
            source: spec.source_id(),
            tx,
            cancel,
        });
        rx.boxed()
    }

    fn abandon(&self, source: &SourceId, only_pending: bool) {
        self.abandoned.lock().push((source.clone(), only_pending));
    }
}

/// Decoder that counts calls and optionally blocks until released.
pub struct CountingDecoder {
    calls: AtomicUsize,
    fail: AtomicBool,
    rotation: AtomicU16,
    gate: Option<Mutex<mpsc::Receiver<()>>>,
}

impl CountingDecoder {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            rotation: AtomicU16::new(0),
            gate: None,
        })
    }

    /// Each decode waits for one `send(())` on the returned sender.
    pub fn gated() -> (Arc<Self>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let decoder = Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            rotation: AtomicU16::new(0),
            gate: Some(Mutex::new(rx)),
        });
        (decoder, tx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Report this orientation through the spec, the way EXIF decoding does.
    pub fn set_rotation(&self, degrees: u16) {
        self.rotation.store(degrees, Ordering::SeqCst);
    }
}

impl Decode for CountingDecoder {
    fn decode(&self, spec: &ImageSpec, _data: Option<&SourceData>) -> Result<DecodedImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _ = gate.lock().recv();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DecodeError::Unsupported("scripted failure".into()));
        }
        let degrees = self.rotation.load(Ordering::SeqCst);
        if degrees != 0 {
            spec.rotation().set(degrees);
        }
        let side = spec.size().clamp(1, 8);
        Ok(DecodedImage {
            width: side,
            height: side,
            format: PixelFormat::Rgba8,
            pixels: vec![128; (side * side * 4) as usize],
            rotation: 0,
        })
    }
}

/// Watcher that records everything it is told.
#[derive(Default)]
pub struct Recorder {
    pub results: Mutex<Vec<LoadResult>>,
    pub progress: Mutex<Vec<(CacheKey, f32)>>,
}

impl Watcher for Recorder {
    fn on_progress(&self, key: &CacheKey, progress: f32) {
        self.progress.lock().push((key.clone(), progress));
    }

    fn on_result(&self, result: LoadResult) {
        self.results.lock().push(result);
    }
}

pub fn watcher() -> (Arc<Recorder>, WatcherRef, LivenessToken) {
    let recorder = Arc::new(Recorder::default());
    let token = LivenessToken::new();
    let target: Arc<dyn Watcher> = recorder.clone();
    let handle = WatcherRef::new(WatcherId::next(), token.clone(), target);
    (recorder, handle, token)
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub cache: BufferCache,
    pub transport: Arc<ScriptedTransport>,
    pub cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn start(decoder: Arc<CountingDecoder>) -> Harness {
    start_with(Configuration::default(), decoder, 64 * 1024 * 1024)
}

pub fn start_with(cfg: Configuration, decoder: Arc<CountingDecoder>, budget: usize) -> Harness {
    let cache = BufferCache::new(budget);
    let transport = Arc::new(ScriptedTransport::default());
    let cancel = CancellationToken::new();
    let (coordinator, _handle) = coordinator::spawn(
        &cfg,
        cache.clone(),
        transport.clone(),
        decoder,
        cancel.clone(),
    )
    .expect("spawn coordinator");
    Harness {
        coordinator,
        cache,
        transport,
        cancel,
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("condition not reached in time");
}

/// Like [`eventually`] for conditions on coordinator statistics.
pub async fn stats_until(
    coordinator: &Coordinator,
    mut cond: impl FnMut(&imagepipe::events::CoordinatorStats) -> bool,
) -> imagepipe::events::CoordinatorStats {
    let wait = async {
        loop {
            let stats = coordinator.stats().await.expect("coordinator running");
            if cond(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("statistics condition not reached in time")
}
