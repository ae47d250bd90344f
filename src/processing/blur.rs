use image::{imageops, RgbaImage};

use crate::config::DecodeOptions;
use crate::spec::{ImageSpec, SpecFlags};

/// Blur radius to apply to a `w × h` result of `spec`, if any.
pub fn blur_radius_for(spec: &ImageSpec, w: u32, h: u32, opts: &DecodeOptions) -> Option<u8> {
    if spec.has(SpecFlags::NO_BLUR) {
        return None;
    }
    if spec.is_private() {
        return Some(opts.private_blur_radius);
    }
    if spec.blur_radius() > 0 {
        return Some(spec.blur_radius());
    }
    let small = w < opts.small_image_blur_threshold && h < opts.small_image_blur_threshold;
    (small && opts.default_blur_radius > 0).then_some(opts.default_blur_radius)
}

pub fn apply_blur(image: &RgbaImage, radius: u8) -> RgbaImage {
    if radius == 0 {
        return image.clone();
    }
    imageops::blur(image, f32::from(radius))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ScopeId;

    #[test]
    fn radius_selection() {
        let opts = DecodeOptions::default();
        let spec = ImageSpec::remote(ScopeId(0), 1);
        assert_eq!(blur_radius_for(&spec, 50, 50, &opts), Some(3));
        assert_eq!(blur_radius_for(&spec, 500, 50, &opts), None);
        let private = spec.clone().with_flags(SpecFlags::PRIVATE);
        assert_eq!(blur_radius_for(&private, 500, 500, &opts), Some(7));
        let explicit = spec.clone().with_blur(5);
        assert_eq!(blur_radius_for(&explicit, 500, 500, &opts), Some(5));
        let never = private.with_flags(SpecFlags::NO_BLUR);
        assert_eq!(blur_radius_for(&never, 10, 10, &opts), None);
    }

    #[test]
    fn blur_keeps_dimensions() {
        let mut img = RgbaImage::new(8, 8);
        img.put_pixel(4, 4, image::Rgba([255, 255, 255, 255]));
        let out = apply_blur(&img, 2);
        assert_eq!(out.dimensions(), (8, 8));
        assert!(out.get_pixel(4, 4).0[0] < 255);
    }
}
