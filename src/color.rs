//! Packed-color helpers shared by the batcher, shaders, and cursor logic.
//!
//! Colors travel through the payload and the quad batch as `u32` values with
//! the red channel in the lowest byte (`0xAABBGGRR` when written as a
//! literal). Conversion to `[f32; 4]` only happens at the uniform-buffer
//! boundary.

/// Sentinel cursor color meaning "invert whatever is underneath".
pub const INVALID_COLOR: u32 = 0xffff_ffff;

/// Unpack a `u32` color into straight-alpha RGBA floats.
pub fn rgba_from_u32(rgba: u32) -> [f32; 4] {
    [
        ((rgba) & 0xff) as f32 / 255.0,
        ((rgba >> 8) & 0xff) as f32 / 255.0,
        ((rgba >> 16) & 0xff) as f32 / 255.0,
        ((rgba >> 24) & 0xff) as f32 / 255.0,
    ]
}

/// Unpack a `u32` color into premultiplied RGBA floats.
pub fn rgba_from_u32_premultiplied(rgba: u32) -> [f32; 4] {
    let [r, g, b, a] = rgba_from_u32(rgba);
    [r * a, g * a, b * a, a]
}

/// Invert-cursor color correction.
///
/// A literal bitwise complement of a mid-gray background (0x7f7f7f) produces
/// 0x808080, which is perceptually the same gray and leaves the cursor
/// invisible. Flipping only the top two bits of each channel (XOR 0xc0)
/// preserves the lower six bits, so mid-gray maps to a clearly lighter
/// 0xbfbfbf while saturated colors still invert strongly.
pub fn invert_corrected(rgba: u32) -> u32 {
    rgba ^ 0x00c0_c0c0
}

/// Plain per-channel complement, alpha untouched.
pub fn complement(rgba: u32) -> u32 {
    rgba ^ 0x00ff_ffff
}

/// Whether every color channel sits in the "near gray" band `[0x70, 0x8f]`
/// where a plain complement would be visually a no-op.
pub fn is_near_gray(rgba: u32) -> bool {
    let r = rgba & 0xff;
    let g = (rgba >> 8) & 0xff;
    let b = (rgba >> 16) & 0xff;
    (0x70..=0x8f).contains(&r) && (0x70..=0x8f).contains(&g) && (0x70..=0x8f).contains(&b)
}

/// Resolve the color an invert-cursor paints over the given background.
///
/// Near-gray backgrounds get the XOR correction; everything else gets the
/// plain complement, which is what a reverse-video cursor classically does.
pub fn invert_cursor_color(background: u32) -> u32 {
    if is_near_gray(background) {
        invert_corrected(background)
    } else {
        complement(background)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_channels() {
        let c = rgba_from_u32(0xff00_80ff);
        assert_eq!(c[0], 1.0);
        assert!((c[1] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(c[2], 0.0);
        assert_eq!(c[3], 1.0);
    }

    #[test]
    fn premultiply_halves_at_half_alpha() {
        let c = rgba_from_u32_premultiplied(0x80ff_ffff);
        let a = 128.0 / 255.0;
        assert!((c[0] - a).abs() < 1e-6);
        assert!((c[3] - a).abs() < 1e-6);
    }

    #[test]
    fn mid_gray_is_not_its_own_complement() {
        // 0x7f7f7f complements to 0x808080, which is invisible on gray.
        // The corrected invert must produce something else.
        let corrected = invert_cursor_color(0xff7f_7f7f);
        assert_ne!(corrected & 0x00ff_ffff, 0x0080_8080);
        assert_eq!(corrected & 0x00ff_ffff, 0x00bf_bfbf);
    }

    #[test]
    fn saturated_colors_get_plain_complement() {
        assert_eq!(invert_cursor_color(0xff00_0000) & 0xff_ffff, 0xff_ffff);
        assert_eq!(invert_cursor_color(0xffff_ffff) & 0xff_ffff, 0);
    }

    #[test]
    fn near_gray_band_edges() {
        assert!(is_near_gray(0xff8f_7080));
        assert!(!is_near_gray(0xff8f_6f80));
        assert!(!is_near_gray(0xff90_7080));
    }
}
