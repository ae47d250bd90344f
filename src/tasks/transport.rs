//! Source byte transport.
//!
//! The coordinator only needs "give me the bytes for this source, with
//! progress". [`LocalFileTransport`] serves remote ids out of a local
//! directory, which is what the binary and the tests use.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::events::{FetchEvent, SourceData};
use crate::spec::{ImageSpec, SourceId, SourceKind};

pub trait Transport: Send + Sync {
    /// Start fetching the bytes behind `spec`'s source.
    ///
    /// The stream ends after a `Ready` or `Failed` event, or early once
    /// `cancel` fires.
    fn fetch(&self, spec: &ImageSpec, cancel: CancellationToken) -> BoxStream<'static, FetchEvent>;

    /// The last consumer of `source` is gone.
    fn abandon(&self, _source: &SourceId, _only_pending: bool) {}
}

const DEFAULT_CHUNK: usize = 64 * 1024;

/// Serves remote sources from files registered by id, or by remote id
/// relative to a root directory.
pub struct LocalFileTransport {
    root: PathBuf,
    chunk_size: usize,
    files: RwLock<HashMap<i64, PathBuf>>,
}

impl LocalFileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK,
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn register(&self, file_id: i64, path: impl Into<PathBuf>) {
        self.files.write().insert(file_id, path.into());
    }

    fn resolve(&self, source: &SourceKind) -> Option<PathBuf> {
        match source {
            SourceKind::Remote { file_id, remote_id } => self
                .files
                .read()
                .get(file_id)
                .cloned()
                .or_else(|| remote_id.as_deref().map(|id| self.root.join(id))),
            other => other.local_path().map(Path::to_path_buf),
        }
    }
}

enum ReadState {
    Open(PathBuf),
    Reading {
        file: tokio::fs::File,
        len: u64,
        data: Vec<u8>,
    },
    Done,
}

impl Transport for LocalFileTransport {
    fn fetch(&self, spec: &ImageSpec, cancel: CancellationToken) -> BoxStream<'static, FetchEvent> {
        let Some(path) = self.resolve(spec.source()) else {
            let msg = format!("no file registered for {}", spec.source_id());
            return stream::iter([FetchEvent::Failed(msg)]).boxed();
        };
        debug!(source = %spec.source_id(), path = %path.display(), "serving local file");
        let chunk = self.chunk_size;
        stream::unfold(ReadState::Open(path), move |state| {
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                match state {
                    ReadState::Open(path) => match open(&path).await {
                        Ok((file, len)) => {
                            let next = ReadState::Reading {
                                file,
                                len,
                                data: Vec::with_capacity(len as usize),
                            };
                            Some((FetchEvent::Progress(0.0), next))
                        }
                        Err(err) => Some((
                            FetchEvent::Failed(format!("{}: {err}", path.display())),
                            ReadState::Done,
                        )),
                    },
                    ReadState::Reading {
                        mut file,
                        len,
                        mut data,
                    } => {
                        let start = data.len();
                        data.resize(start + chunk, 0);
                        match file.read(&mut data[start..]).await {
                            Ok(0) => {
                                data.truncate(start);
                                trace!(bytes = data.len(), "local fetch complete");
                                Some((FetchEvent::Ready(SourceData::Bytes(data.into())), ReadState::Done))
                            }
                            Ok(n) => {
                                data.truncate(start + n);
                                let progress = if len == 0 {
                                    1.0
                                } else {
                                    (data.len() as f64 / len as f64).min(1.0) as f32
                                };
                                Some((FetchEvent::Progress(progress), ReadState::Reading { file, len, data }))
                            }
                            Err(err) => Some((FetchEvent::Failed(err.to_string()), ReadState::Done)),
                        }
                    }
                    ReadState::Done => None,
                }
            }
        })
        .boxed()
    }
}

async fn open(path: &Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

/// Extensions the decoder understands.
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "gif" | "webp"
            )
        })
        .unwrap_or(false)
}

/// Recursively collect image files under `roots`, sorted.
pub fn scan_images(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = roots
        .iter()
        .flat_map(|root| {
            WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
        })
        .filter(|p| is_image(p))
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ScopeId;

    #[tokio::test]
    async fn streams_progress_then_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![7u8; 100]).unwrap();
        let transport = LocalFileTransport::new(dir.path()).with_chunk_size(30);
        transport.register(5, &path);

        let spec = ImageSpec::remote(ScopeId(1), 5);
        let events: Vec<FetchEvent> = transport.fetch(&spec, CancellationToken::new()).collect().await;
        let progress: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                FetchEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress.first().copied(), Some(0.0));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        match events.last() {
            Some(FetchEvent::Ready(SourceData::Bytes(bytes))) => assert_eq!(bytes.len(), 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_and_cancelled_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalFileTransport::new(dir.path());
        let spec = ImageSpec::remote(ScopeId(1), 404);
        let events: Vec<FetchEvent> = transport.fetch(&spec, CancellationToken::new()).collect().await;
        assert!(matches!(events.as_slice(), [FetchEvent::Failed(_)]));

        std::fs::write(dir.path().join("x.png"), b"abc").unwrap();
        transport.register(1, dir.path().join("x.png"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<FetchEvent> = transport
            .fetch(&ImageSpec::remote(ScopeId(1), 1), cancel)
            .collect()
            .await;
        assert!(events.is_empty());
    }

    #[test]
    fn scan_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.JPG"), b"").unwrap();
        std::fs::write(dir.path().join("nested/b.png"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        let found = scan_images(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| is_image(p)));
    }
}
