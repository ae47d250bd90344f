//! Bytes to pixels.
//!
//! [`ImageDecoder`] is the stock [`Decode`] implementation. It resolves the
//! source bytes for a spec, tries the scaled "modern" path, falls back once
//! to the legacy path, then applies orientation, square crop, blur and the
//! final pixel format.

use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use fast_image_resize as fir;
use image::{imageops, DynamicImage, ImageReader, RgbaImage};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat as JpegPixelFormat};
use tracing::{debug, trace};

use crate::buffer::{DecodedImage, PixelFormat};
use crate::config::DecodeOptions;
use crate::error::DecodeError;
use crate::events::SourceData;
use crate::processing::blur::{apply_blur, blur_radius_for};
use crate::processing::layout::{square_crop, target_dimensions};
use crate::spec::{ImageSpec, SourceKind, SpecFlags};

/// Per-kind decode strategy, fixed when the request is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    File,
    GalleryThumb,
    Memory,
    AudioArt,
    VideoFrame,
}

/// Pixel decoder used by the worker pool.
pub trait Decode: Send + Sync {
    fn decode(&self, spec: &ImageSpec, data: Option<&SourceData>) -> Result<DecodedImage, DecodeError>;
}

/// Pulls an encoded still frame out of a video.
pub trait FrameExtractor: Send + Sync {
    fn extract(&self, path: &Path, position_ms: u64) -> Result<Vec<u8>, DecodeError>;
}

pub struct ImageDecoder {
    opts: DecodeOptions,
    frames: Option<Arc<dyn FrameExtractor>>,
}

impl ImageDecoder {
    pub fn new(opts: DecodeOptions) -> Self {
        Self { opts, frames: None }
    }

    pub fn with_frame_extractor(mut self, frames: Arc<dyn FrameExtractor>) -> Self {
        self.frames = Some(frames);
        self
    }

    fn source_bytes(
        &self,
        spec: &ImageSpec,
        data: Option<&SourceData>,
    ) -> Result<Arc<[u8]>, DecodeError> {
        if let Some(data) = data {
            return match data {
                SourceData::Path(path) => Ok(fs::read(path)?.into()),
                SourceData::Bytes(bytes) => Ok(bytes.clone()),
            };
        }
        match (spec.source().strategy(), spec.source()) {
            (DecodeStrategy::Memory, SourceKind::Bytes { data, .. }) => Ok(data.clone()),
            (DecodeStrategy::AudioArt, SourceKind::AudioArt(path)) => {
                let container = fs::read(path)?;
                find_embedded_picture(&container)
                    .map(Arc::from)
                    .ok_or(DecodeError::Empty)
            }
            (DecodeStrategy::VideoFrame, SourceKind::VideoThumb { path, position_ms }) => {
                let frames = self.frames.as_ref().ok_or_else(|| {
                    DecodeError::Unsupported(format!("no frame extractor for {}", path.display()))
                })?;
                Ok(frames.extract(path, *position_ms)?.into())
            }
            (_, source) => match source.local_path() {
                Some(path) => Ok(fs::read(path)?.into()),
                None => Err(DecodeError::Unsupported(format!(
                    "{source:?} has no fetched data"
                ))),
            },
        }
    }

    /// Requested edge length after applying private/high-res rules.
    fn requested_size(&self, spec: &ImageSpec) -> u32 {
        if spec.is_private() {
            self.opts.private_size
        } else if spec.has(SpecFlags::HIGH_RES) && !spec.has(SpecFlags::FIT_SIZE) {
            0
        } else {
            spec.size()
        }
    }
}

impl Decode for ImageDecoder {
    fn decode(&self, spec: &ImageSpec, data: Option<&SourceData>) -> Result<DecodedImage, DecodeError> {
        let bytes = self.source_bytes(spec, data)?;
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let size = self.requested_size(spec);
        let orientation = read_orientation(&bytes).unwrap_or(1);

        let mut rgba = if self.opts.modern_decoder {
            match decode_modern(&bytes, size, spec) {
                Ok(img) => img,
                Err(err) => {
                    debug!(key = %spec.cache_key(), error = %err, "modern decode failed, trying legacy path");
                    decode_legacy(&bytes, size, spec)?
                }
            }
        } else {
            decode_legacy(&bytes, size, spec)?
        };

        let rotation = if self.opts.bake_orientation {
            rgba = apply_orientation(rgba, orientation);
            0
        } else {
            orientation_degrees(orientation)
        };
        spec.rotation().set(rotation);

        if spec.has(SpecFlags::SQUARE) {
            let (x, y, side) = square_crop(rgba.width(), rgba.height());
            rgba = imageops::crop_imm(&rgba, x, y, side, side).to_image();
        }

        let blur = blur_radius_for(spec, rgba.width(), rgba.height(), &self.opts);
        if let Some(radius) = blur {
            rgba = apply_blur(&rgba, radius);
        }

        let keep_alpha = blur.is_some()
            || spec.is_private()
            || spec.has(SpecFlags::FORCE_ARGB)
            || spec.has(SpecFlags::HIGH_RES)
            || rgba.pixels().any(|p| p.0[3] != u8::MAX);
        Ok(finish(rgba, keep_alpha, rotation))
    }
}

fn finish(rgba: RgbaImage, keep_alpha: bool, rotation: u16) -> DecodedImage {
    let (width, height) = rgba.dimensions();
    if keep_alpha {
        DecodedImage {
            width,
            height,
            format: PixelFormat::Rgba8,
            pixels: rgba.into_raw(),
            rotation,
        }
    } else {
        DecodedImage {
            width,
            height,
            format: PixelFormat::Rgb8,
            pixels: DynamicImage::ImageRgba8(rgba).to_rgb8().into_raw(),
            rotation,
        }
    }
}

fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8, 0xFF])
}

/// Scaled JPEG decode, or a format-sniffing decode, followed by a
/// convolution resize.
fn decode_modern(bytes: &[u8], size: u32, spec: &ImageSpec) -> Result<RgbaImage, DecodeError> {
    let decoded = if is_jpeg(bytes) {
        decode_jpeg_scaled(bytes, size, spec)?
    } else {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .decode()?
            .to_rgba8()
    };
    let (w, h) = target_dimensions(decoded.width(), decoded.height(), size, spec.scale());
    resize_rgba(&decoded, w, h)
}

fn decode_legacy(bytes: &[u8], size: u32, spec: &ImageSpec) -> Result<RgbaImage, DecodeError> {
    let decoded = image::load_from_memory(bytes)?.to_rgba8();
    let (w, h) = target_dimensions(decoded.width(), decoded.height(), size, spec.scale());
    if (w, h) == decoded.dimensions() {
        return Ok(decoded);
    }
    Ok(imageops::resize(&decoded, w, h, imageops::FilterType::Triangle))
}

fn decode_jpeg_scaled(bytes: &[u8], size: u32, spec: &ImageSpec) -> Result<RgbaImage, DecodeError> {
    let mut decoder = JpegDecoder::new(Cursor::new(bytes));
    decoder.read_info()?;
    let info = decoder.info().ok_or(DecodeError::Empty)?;
    let (w, h) = target_dimensions(u32::from(info.width), u32::from(info.height), size, spec.scale());
    if (w, h) != (u32::from(info.width), u32::from(info.height)) {
        let request_w = w.clamp(1, u32::from(u16::MAX)) as u16;
        let request_h = h.clamp(1, u32::from(u16::MAX)) as u16;
        decoder.scale(request_w, request_h)?;
    }
    let pixels = decoder.decode()?;
    let info = decoder.info().ok_or(DecodeError::Empty)?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));
    trace!(width, height, "scaled jpeg decode");

    let rgba: Vec<u8> = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels
            .chunks_exact(3)
            .flat_map(|c| [c[0], c[1], c[2], u8::MAX])
            .collect(),
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&v| [v, v, v, u8::MAX]).collect(),
        JpegPixelFormat::CMYK32 => pixels.chunks_exact(4).flat_map(cmyk_to_rgba).collect(),
        JpegPixelFormat::L16 => {
            return Err(DecodeError::Unsupported("16-bit grayscale jpeg".into()));
        }
    };
    RgbaImage::from_raw(width, height, rgba).ok_or(DecodeError::Empty)
}

fn cmyk_to_rgba(chunk: &[u8]) -> [u8; 4] {
    let k = f32::from(chunk[3]) / 255.0;
    let channel = |v: u8| {
        let v = f32::from(v) / 255.0 * (1.0 - k) + k;
        ((1.0 - v) * 255.0).round().clamp(0.0, 255.0) as u8
    };
    [channel(chunk[0]), channel(chunk[1]), channel(chunk[2]), u8::MAX]
}

fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage, DecodeError> {
    if source.dimensions() == (target_w, target_h) {
        return Ok(source.clone());
    }
    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| DecodeError::Resize(err.to_string()))?;
    let mut dst = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    fir::Resizer::new()
        .resize(&src_view, &mut dst, Some(&options))
        .map_err(|err| DecodeError::Resize(err.to_string()))?;
    RgbaImage::from_raw(target_w, target_h, dst.into_vec())
        .ok_or_else(|| DecodeError::Resize("resized buffer has the wrong length".into()))
}

fn read_orientation(bytes: &[u8]) -> Option<u16> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0).map(|v| v as u16)
}

fn orientation_degrees(orientation: u16) -> u16 {
    match orientation {
        3 | 4 => 180,
        5 | 6 => 90,
        7 | 8 => 270,
        _ => 0,
    }
}

fn apply_orientation(img: RgbaImage, orientation: u16) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    }
}

/// First embedded JPEG or PNG stream in an audio container.
fn find_embedded_picture(container: &[u8]) -> Option<Vec<u8>> {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF];
    let start = container
        .windows(PNG.len())
        .position(|w| w == PNG)
        .into_iter()
        .chain(container.windows(JPEG.len()).position(|w| w == JPEG))
        .min()?;
    Some(container[start..].to_vec())
}
