//! Decoded pixel buffers shared between the cache and receivers.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Memory layout of a decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit RGBA, used whenever alpha is needed.
    Rgba8,
    /// 8-bit RGB for opaque pictures.
    Rgb8,
}

impl PixelFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::Rgb8 => 3,
        }
    }
}

/// Pixels produced by one decode.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
    /// Clockwise quarter turns still to apply when drawing, in degrees.
    pub rotation: u16,
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .field("rotation", &self.rotation)
            .finish()
    }
}

impl DecodedImage {
    /// Real memory footprint, used for budget accounting.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.pixels.capacity().max(self.pixels.len()) + std::mem::size_of::<Self>()
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Shared handle to a decoded picture.
///
/// Cloning is cheap. Two handles are the same buffer iff [`Buffer::ptr_eq`]
/// holds; the cache relies on that to tell a salvaged buffer from a redecode.
#[derive(Debug, Clone)]
pub struct Buffer(Arc<DecodedImage>);

impl Buffer {
    pub fn new(image: DecodedImage) -> Self {
        Self(Arc::new(image))
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.0.byte_size()
    }

    pub(crate) fn downgrade(&self) -> Weak<DecodedImage> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<DecodedImage>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    /// Number of live handles, including the cache's own.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for Buffer {
    type Target = DecodedImage;

    fn deref(&self) -> &DecodedImage {
        &self.0
    }
}

impl From<DecodedImage> for Buffer {
    fn from(image: DecodedImage) -> Self {
        Self::new(image)
    }
}
