//! Request descriptions and the keys derived from them.
//!
//! An [`ImageSpec`] says what picture to produce and how: which source, at
//! what size, with which transforms. Two specs are interchangeable when their
//! [`CacheKey`]s match, and every deduplication decision in the pipeline is
//! made on that key rather than on object identity.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::processing::decode::DecodeStrategy;
use crate::tasks::workers::WorkerKind;

/// Account or session a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct ScopeId(pub u32);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the decoded picture relates to the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScaleType {
    /// Downsample until the picture fits inside `size × size`.
    #[default]
    Fit,
    /// Downsample only until the short side still covers `size`.
    Crop,
    /// Tiled drawing; decoded like [`ScaleType::Fit`].
    Repeat,
}

/// Bitset of transform and lifetime flags carried by a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpecFlags(u32);

impl SpecFlags {
    pub const NONE: Self = Self(0);
    /// Center-crop the result to a square.
    pub const SQUARE: Self = Self(1);
    /// Never insert the result into the buffer cache.
    pub const NO_CACHE: Self = Self(1 << 1);
    /// Never blur, not even small results.
    pub const NO_BLUR: Self = Self(1 << 2);
    /// Keep the alpha channel even for opaque pictures.
    pub const FORCE_ARGB: Self = Self(1 << 3);
    /// Tiny, heavily blurred preview.
    pub const PRIVATE: Self = Self(1 << 4);
    /// Decode at full resolution.
    pub const HIGH_RES: Self = Self(1 << 5);
    /// Downsample to `size` even when [`SpecFlags::HIGH_RES`] is set.
    pub const FIT_SIZE: Self = Self(1 << 6);
    /// Receivers do not pin the buffer in the cache.
    pub const NO_REFERENCE: Self = Self(1 << 7);
    /// Receivers only consult the cache and never request a load.
    pub const CACHE_ONLY: Self = Self(1 << 8);
    /// Ask the transport to abandon the download when the last consumer leaves.
    pub const CANCEL_ON_DROP: Self = Self(1 << 9);
    /// Like [`SpecFlags::CANCEL_ON_DROP`] but only while the download is still queued.
    pub const CANCEL_ONLY_PENDING: Self = Self(1 << 10);
    /// Keep showing the previous buffer while this spec is pending.
    pub const SUPPRESS_EMPTY: Self = Self(1 << 11);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for SpecFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SpecFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Where the bytes of a picture come from.
///
/// Every variant other than [`SourceKind::Remote`] is decoded straight from
/// local data; remote sources go through the transport first.
#[derive(Clone)]
pub enum SourceKind {
    Remote {
        file_id: i64,
        remote_id: Option<Arc<str>>,
    },
    Local(PathBuf),
    /// Thumbnail of a gallery item stored at `path`.
    Gallery { path: PathBuf, media_id: i64 },
    /// Bytes already held in memory, identified by `id`.
    Bytes { id: Arc<str>, data: Arc<[u8]> },
    /// Cover art embedded in an audio container.
    AudioArt(PathBuf),
    VideoThumb { path: PathBuf, position_ms: u64 },
}

impl fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { file_id, remote_id } => f
                .debug_struct("Remote")
                .field("file_id", file_id)
                .field("remote_id", remote_id)
                .finish(),
            Self::Local(path) => f.debug_tuple("Local").field(path).finish(),
            Self::Gallery { path, media_id } => f
                .debug_struct("Gallery")
                .field("path", path)
                .field("media_id", media_id)
                .finish(),
            Self::Bytes { id, data } => f
                .debug_struct("Bytes")
                .field("id", id)
                .field("len", &data.len())
                .finish(),
            Self::AudioArt(path) => f.debug_tuple("AudioArt").field(path).finish(),
            Self::VideoThumb { path, position_ms } => f
                .debug_struct("VideoThumb")
                .field("path", path)
                .field("position_ms", position_ms)
                .finish(),
        }
    }
}

impl SourceKind {
    pub fn needs_fetch(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Decode strategy, fixed once per request.
    pub fn strategy(&self) -> DecodeStrategy {
        match self {
            Self::Remote { .. } | Self::Local(_) => DecodeStrategy::File,
            Self::Gallery { .. } => DecodeStrategy::GalleryThumb,
            Self::Bytes { .. } => DecodeStrategy::Memory,
            Self::AudioArt(_) => DecodeStrategy::AudioArt,
            Self::VideoThumb { .. } => DecodeStrategy::VideoFrame,
        }
    }

    /// Dedicated worker that decodes this kind of source.
    pub fn worker_kind(&self) -> WorkerKind {
        match self {
            Self::AudioArt(_) | Self::VideoThumb { .. } => WorkerKind::Media,
            Self::Bytes { .. } => WorkerKind::Memory,
            Self::Remote { .. } | Self::Local(_) | Self::Gallery { .. } => WorkerKind::Still,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Local(path) | Self::AudioArt(path) => Some(path),
            Self::Gallery { path, .. } | Self::VideoThumb { path, .. } => Some(path),
            Self::Remote { .. } | Self::Bytes { .. } => None,
        }
    }

    fn identity(&self) -> String {
        match self {
            Self::Remote { file_id, remote_id } => match remote_id {
                Some(remote) if *file_id == 0 => format!("remote:{remote}"),
                _ => format!("file{file_id}"),
            },
            Self::Local(path) => format!("local:{}", path.display()),
            Self::Gallery { path, media_id } => format!("gallery{media_id}:{}", path.display()),
            Self::Bytes { id, .. } => format!("bytes:{id}"),
            Self::AudioArt(path) => format!("mp3:{}", path.display()),
            Self::VideoThumb { path, position_ms } => {
                format!("video:{}@{position_ms}", path.display())
            }
        }
    }
}

/// Identity of the underlying bytes, shared by every size of the same picture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceId {
    scope: ScopeId,
    id: Arc<str>,
}

impl SourceId {
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.scope, self.id)
    }
}

/// Deterministic key of a spec's decoded output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: ScopeId,
    text: Arc<str>,
}

impl CacheKey {
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Rotation metadata shared by every clone of a spec.
///
/// Updated by the decoder from EXIF data; never part of the cache key.
#[derive(Debug, Clone, Default)]
pub struct Rotation(Arc<AtomicU16>);

impl Rotation {
    pub fn degrees(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }

    /// Store `degrees` normalized to a quarter turn.
    pub fn set(&self, degrees: u16) {
        let normalized = (degrees % 360) / 90 * 90;
        self.0.store(normalized, Ordering::Release);
    }

    pub fn is_rotated(&self) -> bool {
        matches!(self.degrees(), 90 | 270)
    }
}

#[derive(Debug, Clone)]
pub struct ImageSpec {
    scope: ScopeId,
    source: SourceKind,
    size: u32,
    scale: ScaleType,
    flags: SpecFlags,
    blur_radius: u8,
    rotation: Rotation,
    key: OnceLock<CacheKey>,
}

impl ImageSpec {
    pub fn new(scope: ScopeId, source: SourceKind) -> Self {
        Self {
            scope,
            source,
            size: 0,
            scale: ScaleType::default(),
            flags: SpecFlags::NONE,
            blur_radius: 0,
            rotation: Rotation::default(),
            key: OnceLock::new(),
        }
    }

    pub fn remote(scope: ScopeId, file_id: i64) -> Self {
        Self::new(
            scope,
            SourceKind::Remote {
                file_id,
                remote_id: None,
            },
        )
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(ScopeId::default(), SourceKind::Local(path.into()))
    }

    pub fn bytes(id: impl Into<Arc<str>>, data: impl Into<Arc<[u8]>>) -> Self {
        Self::new(
            ScopeId::default(),
            SourceKind::Bytes {
                id: id.into(),
                data: data.into(),
            },
        )
    }

    pub fn in_scope(mut self, scope: ScopeId) -> Self {
        self.scope = scope;
        self.key = OnceLock::new();
        self
    }

    /// Longest side of the output in pixels; `0` keeps the source size.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self.key = OnceLock::new();
        self
    }

    pub fn with_scale(mut self, scale: ScaleType) -> Self {
        self.scale = scale;
        self.key = OnceLock::new();
        self
    }

    pub fn with_flags(mut self, flags: SpecFlags) -> Self {
        self.flags.insert(flags);
        self.key = OnceLock::new();
        self
    }

    pub fn without_flags(mut self, flags: SpecFlags) -> Self {
        self.flags.remove(flags);
        self.key = OnceLock::new();
        self
    }

    pub fn with_blur(mut self, radius: u8) -> Self {
        self.blur_radius = radius;
        self.key = OnceLock::new();
        self
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn source(&self) -> &SourceKind {
        &self.source
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn scale(&self) -> ScaleType {
        self.scale
    }

    pub fn flags(&self) -> SpecFlags {
        self.flags
    }

    pub fn has(&self, flag: SpecFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Explicit blur radius, `0` when none was requested.
    pub fn blur_radius(&self) -> u8 {
        self.blur_radius
    }

    pub fn rotation(&self) -> &Rotation {
        &self.rotation
    }

    pub fn needs_fetch(&self) -> bool {
        self.source.needs_fetch()
    }

    pub fn should_cache(&self) -> bool {
        !self.has(SpecFlags::NO_CACHE)
    }

    pub fn needs_references(&self) -> bool {
        !self.has(SpecFlags::NO_REFERENCE)
    }

    pub fn is_private(&self) -> bool {
        self.has(SpecFlags::PRIVATE)
    }

    pub fn source_id(&self) -> SourceId {
        SourceId {
            scope: self.scope,
            id: self.source.identity().into(),
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        self.key.get_or_init(|| self.build_key())
    }

    /// Whether both specs produce the same decoded output.
    pub fn is_equivalent(&self, other: &ImageSpec) -> bool {
        self.cache_key() == other.cache_key()
    }

    fn build_key(&self) -> CacheKey {
        let mut text = format!("scope{}_{}_{}", self.scope, self.source.identity(), self.size);
        if self.has(SpecFlags::SQUARE) {
            text.push_str("_square");
        }
        if self.scale == ScaleType::Crop {
            text.push_str("_crop");
        }
        if self.is_private() {
            text.push_str("_private");
        }
        if self.has(SpecFlags::HIGH_RES) {
            text.push_str("_hires");
        }
        if self.has(SpecFlags::FIT_SIZE) {
            text.push_str("_fit");
        }
        if self.has(SpecFlags::FORCE_ARGB) {
            text.push_str("_argb");
        }
        if self.has(SpecFlags::NO_BLUR) {
            text.push_str("_noblur");
        } else if self.blur_radius != 0 {
            text.push_str(&format!("_blur{}", self.blur_radius));
        }
        CacheKey {
            scope: self.scope,
            text: text.into(),
        }
    }
}

impl PartialEq for ImageSpec {
    fn eq(&self, other: &Self) -> bool {
        self.is_equivalent(other)
    }
}

impl Eq for ImageSpec {}
