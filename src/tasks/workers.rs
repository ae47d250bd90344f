//! Dedicated decode threads, one per source category.
//!
//! Each worker owns a crossbeam queue and decodes one job at a time, posting
//! the outcome straight into the coordinator mailbox. A slow video frame
//! never holds up ordinary stills.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::config::Configuration;
use crate::error::{DecodeError, Error, LoadError};
use crate::events::{Command, CommandSender, DecodeJob, DecodeOutcome};
use crate::processing::decode::Decode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Plain pictures from files or fetched bytes.
    Still,
    /// Video frames and embedded audio art.
    Media,
    /// In-memory byte sources.
    Memory,
}

impl WorkerKind {
    pub const ALL: [Self; 3] = [Self::Still, Self::Media, Self::Memory];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Still => "still",
            Self::Media => "media",
            Self::Memory => "memory",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Still => 0,
            Self::Media => 1,
            Self::Memory => 2,
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message sent to a worker thread.
pub enum WorkerMsg {
    Decode(DecodeJob),
    Quit,
}

pub struct DecodePool {
    senders: [Sender<WorkerMsg>; 3],
    handles: Vec<JoinHandle<()>>,
}

impl DecodePool {
    pub fn spawn(
        cfg: &Configuration,
        decoder: Arc<dyn Decode>,
        reply: CommandSender,
    ) -> Result<Self, Error> {
        let slow = cfg.decode.slow_decode_warning;
        let mut handles = Vec::with_capacity(WorkerKind::ALL.len());
        let mut senders = Vec::with_capacity(WorkerKind::ALL.len());
        for kind in WorkerKind::ALL {
            let (tx, rx) = unbounded();
            let name = format!("{}-{}", cfg.workers.thread_name_prefix, kind);
            let decoder = Arc::clone(&decoder);
            let reply = reply.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(kind, rx, decoder, reply, slow))
                .map_err(|origin| Error::Spawn { name, origin })?;
            handles.push(handle);
            senders.push(tx);
        }
        let senders: [Sender<WorkerMsg>; 3] = senders
            .try_into()
            .map_err(|_| Error::Spawn {
                name: "decode pool".into(),
                origin: std::io::Error::other("worker count mismatch"),
            })?;
        Ok(Self { senders, handles })
    }

    /// Queue `job` on the worker for its source category.
    pub fn submit(&self, job: DecodeJob) -> Result<WorkerKind, LoadError> {
        let kind = job.spec.source().worker_kind();
        let key = job.spec.cache_key().to_string();
        self.senders[kind.index()]
            .send(WorkerMsg::Decode(job))
            .map(|()| kind)
            .map_err(|_| LoadError::DecodeFailed {
                key,
                reason: format!("{kind} worker has stopped"),
            })
    }

    /// Stop every worker after its current job and wait for it.
    pub fn shutdown(self) {
        for tx in &self.senders {
            let _ = tx.send(WorkerMsg::Quit);
        }
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("decode worker exited abnormally");
            }
        }
    }
}

fn worker_loop(
    kind: WorkerKind,
    rx: Receiver<WorkerMsg>,
    decoder: Arc<dyn Decode>,
    reply: CommandSender,
    slow: Duration,
) {
    debug!(worker = %kind, "decode worker started");
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Quit => break,
            WorkerMsg::Decode(job) => {
                let outcome = run_job(kind, decoder.as_ref(), job, slow);
                if reply.send(Command::DecodeComplete(outcome)).is_err() {
                    debug!(worker = %kind, "coordinator gone, stopping worker");
                    break;
                }
            }
        }
    }
    debug!(worker = %kind, "decode worker stopped");
}

fn run_job(kind: WorkerKind, decoder: &dyn Decode, job: DecodeJob, slow: Duration) -> DecodeOutcome {
    let key = job.spec.cache_key().clone();
    let started = Instant::now();
    if job.cancel.is_cancelled() {
        return DecodeOutcome {
            actor: job.actor,
            key,
            result: Err(LoadError::Cancelled),
            elapsed: Duration::ZERO,
        };
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        decoder.decode(&job.spec, job.data.as_ref())
    }))
    .unwrap_or_else(|payload| Err(DecodeError::Panicked(panic_message(payload.as_ref()))));
    let elapsed = started.elapsed();
    if elapsed > slow {
        warn!(worker = %kind, %key, elapsed_ms = elapsed.as_millis() as u64, "slow decode");
    }

    let result = match result {
        Ok(mut image) => {
            // Decoders may report orientation through either channel.
            if image.rotation == 0 {
                image.rotation = job.spec.rotation().degrees();
            }
            Ok(Buffer::new(image))
        }
        Err(err) => {
            if let DecodeError::Panicked(msg) = &err {
                warn!(worker = %kind, %key, panic = %msg, "decoder panicked");
            } else {
                debug!(worker = %kind, %key, error = %err, "decode failed");
            }
            Err(err.into_load_error(&key))
        }
    };
    DecodeOutcome {
        actor: job.actor,
        key,
        result,
        elapsed,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DecodedImage, PixelFormat};
    use crate::events::SourceData;
    use crate::spec::ImageSpec;
    use crate::tasks::actor::LoadActor;

    struct Flaky;

    impl Decode for Flaky {
        fn decode(&self, spec: &ImageSpec, _data: Option<&SourceData>) -> Result<DecodedImage, DecodeError> {
            match spec.size() {
                1 => panic!("boom"),
                2 => Err(DecodeError::Empty),
                4 => {
                    spec.rotation().set(270);
                    Ok(DecodedImage {
                        width: 1,
                        height: 1,
                        format: PixelFormat::Rgba8,
                        pixels: vec![0; 4],
                        rotation: 0,
                    })
                }
                _ => Ok(DecodedImage {
                    width: 1,
                    height: 1,
                    format: PixelFormat::Rgba8,
                    pixels: vec![0; 4],
                    rotation: 0,
                }),
            }
        }
    }

    fn job(size: u32) -> DecodeJob {
        let mut actor = LoadActor::new(ImageSpec::bytes("x", vec![0u8]).with_size(size));
        actor.decode_job(None).expect("job")
    }

    #[test]
    fn panics_become_decode_failures() {
        let outcome = run_job(WorkerKind::Memory, &Flaky, job(1), Duration::from_secs(1));
        match outcome.result {
            Err(LoadError::DecodeFailed { reason, .. }) => assert!(reason.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn errors_and_successes_are_reported() {
        let failed = run_job(WorkerKind::Memory, &Flaky, job(2), Duration::from_secs(1));
        assert!(matches!(failed.result, Err(LoadError::DecodeFailed { .. })));
        let ok = run_job(WorkerKind::Memory, &Flaky, job(3), Duration::from_secs(1));
        assert!(ok.result.is_ok());
    }

    #[test]
    fn reported_rotation_travels_with_the_buffer() {
        let outcome = run_job(WorkerKind::Memory, &Flaky, job(4), Duration::from_secs(1));
        assert_eq!(outcome.result.expect("decoded").rotation, 270);
    }

    #[test]
    fn cancelled_jobs_are_skipped() {
        let j = job(3);
        j.cancel.cancel();
        let outcome = run_job(WorkerKind::Memory, &Flaky, j, Duration::from_secs(1));
        assert_eq!(outcome.result.map(|_| ()), Err(LoadError::Cancelled));
    }

    #[test]
    fn pool_routes_jobs_and_shuts_down() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = DecodePool::spawn(&Configuration::default(), Arc::new(Flaky), tx).expect("spawn");
        assert_eq!(pool.submit(job(3)), Ok(WorkerKind::Memory));
        match rx.blocking_recv() {
            Some(Command::DecodeComplete(outcome)) => assert!(outcome.result.is_ok()),
            _ => panic!("expected a decode outcome"),
        }
        pool.shutdown();
    }
}
