use crate::spec::ScaleType;

/// Output dimensions for a `src_w × src_h` picture requested at `size`.
///
/// Never upsamples. `size == 0` keeps the source dimensions.
pub fn target_dimensions(src_w: u32, src_h: u32, size: u32, scale: ScaleType) -> (u32, u32) {
    let iw = src_w.max(1) as f32;
    let ih = src_h.max(1) as f32;
    if size == 0 {
        return (src_w.max(1), src_h.max(1));
    }
    let s = size as f32;
    let factor = match scale {
        ScaleType::Fit | ScaleType::Repeat => (s / iw).min(s / ih),
        ScaleType::Crop => (s / iw).max(s / ih),
    };
    let factor = if factor.is_finite() { factor.min(1.0) } else { 1.0 };
    let w = (iw * factor).round().max(1.0);
    let h = (ih * factor).round().max(1.0);
    (w as u32, h as u32)
}

/// Largest centered square inside `w × h`, as `(x, y, side)`.
pub fn square_crop(w: u32, h: u32) -> (u32, u32, u32) {
    let side = w.min(h).max(1);
    let (x, y) = center_offset(side, side, w, h);
    (x, y, side)
}

pub fn center_offset(inner_w: u32, inner_h: u32, outer_w: u32, outer_h: u32) -> (u32, u32) {
    let ox = outer_w.saturating_sub(inner_w) / 2;
    let oy = outer_h.saturating_sub(inner_h) / 2;
    (ox, oy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_bounds_the_long_side() {
        assert_eq!(target_dimensions(400, 200, 100, ScaleType::Fit), (100, 50));
        assert_eq!(target_dimensions(200, 400, 100, ScaleType::Repeat), (50, 100));
    }

    #[test]
    fn crop_covers_the_short_side() {
        assert_eq!(target_dimensions(400, 200, 100, ScaleType::Crop), (200, 100));
    }

    #[test]
    fn never_upsamples() {
        assert_eq!(target_dimensions(40, 20, 100, ScaleType::Fit), (40, 20));
        assert_eq!(target_dimensions(40, 20, 100, ScaleType::Crop), (40, 20));
        assert_eq!(target_dimensions(40, 20, 0, ScaleType::Fit), (40, 20));
    }

    #[test]
    fn square_crop_is_centered() {
        assert_eq!(square_crop(10, 4), (3, 0, 4));
        assert_eq!(square_crop(4, 10), (0, 3, 4));
        assert_eq!(square_crop(5, 5), (0, 0, 5));
    }
}
