//! 2D rectangle bin packing for the glyph atlas, plus atlas sizing.
//!
//! Uses the Guillotine best-short-side-fit algorithm: maintain a list of
//! free rectangles, place into the one minimizing the shorter leftover
//! side, then split the remainder along the shorter leftover axis.
//!
//! Reference: Jukka Jylanki, "A Thousand Ways to Pack the Bin" (2010).

/// Derive the atlas extent from the target pixel size.
///
/// Picks the two nearest powers of two whose product covers the target
/// area, biased so width ≥ height. A 985×1946 target (area 1,916,810)
/// yields 2048×1024 (area 2,097,152). GPUs prefer power-of-two textures,
/// and quantizing by area means a per-pixel window resize never churns the
/// atlas: the extent only changes when the area crosses a power-of-two
/// boundary. The 256×256 floor guards the zero-area case and avoids
/// unreasonably small textures.
pub fn atlas_extent(target_w: u32, target_h: u32) -> (u16, u16) {
    let area = target_w.saturating_mul(target_h).max(256 * 256);
    // Highest set bit of area-1; area >= 65536 keeps this well-defined.
    let index = 31 - (area - 1).leading_zeros();
    let w = 1u32 << ((index + 2) / 2);
    let h = 1u32 << ((index + 1) / 2);
    (w.min(u32::from(u16::MAX)) as u16, h.min(u32::from(u16::MAX)) as u16)
}

// Axis-aligned rectangle for the packer's free-space tracking.
#[derive(Debug, Clone, Copy)]
struct FreeRect {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
}

/// Bin packer over a bounded atlas region.
///
/// A failed [`pack`](Self::pack) leaves every prior allocation intact; the
/// caller reacts by resetting the whole atlas, never by patching up partial
/// packer state.
pub struct RectPacker {
    width: u16,
    height: u16,
    free_rects: Vec<FreeRect>,
}

impl RectPacker {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            free_rects: vec![FreeRect {
                x: 0,
                y: 0,
                w: width,
                h: height,
            }],
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Find space for a `w`×`h` rectangle.
    ///
    /// Returns the top-left position within the atlas, or `None` when no
    /// free rectangle fits (the atlas is full).
    pub fn pack(&mut self, w: u16, h: u16) -> Option<(u16, u16)> {
        if w == 0 || h == 0 {
            return None;
        }

        let mut best_idx = None;
        let mut best_short = u16::MAX;
        let mut best_long = u16::MAX;

        for (i, r) in self.free_rects.iter().enumerate() {
            if r.w >= w && r.h >= h {
                let leftover_w = r.w - w;
                let leftover_h = r.h - h;
                let short = leftover_w.min(leftover_h);
                let long = leftover_w.max(leftover_h);
                if short < best_short || (short == best_short && long < best_long) {
                    best_idx = Some(i);
                    best_short = short;
                    best_long = long;
                }
            }
        }

        let idx = best_idx?;
        let r = self.free_rects[idx];
        let pos = (r.x, r.y);

        // Guillotine split: remove the chosen rect, add up to two children
        // along the shorter leftover axis.
        self.free_rects.swap_remove(idx);
        let leftover_w = r.w - w;
        let leftover_h = r.h - h;

        if leftover_w < leftover_h {
            if leftover_w > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x + w,
                    y: r.y,
                    w: leftover_w,
                    h,
                });
            }
            if leftover_h > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x,
                    y: r.y + h,
                    w: r.w,
                    h: leftover_h,
                });
            }
        } else {
            if leftover_h > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x,
                    y: r.y + h,
                    w,
                    h: leftover_h,
                });
            }
            if leftover_w > 0 {
                self.free_rects.push(FreeRect {
                    x: r.x + w,
                    y: r.y,
                    w: leftover_w,
                    h: r.h,
                });
            }
        }

        Some(pos)
    }

    /// Discard all allocations and adopt a new extent.
    pub fn reset(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
        self.free_rects.clear();
        self.free_rects.push(FreeRect {
            x: 0,
            y: 0,
            w: width,
            h: height,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_floor_is_256() {
        assert_eq!(atlas_extent(0, 0), (256, 256));
        assert_eq!(atlas_extent(1, 1), (256, 256));
        assert_eq!(atlas_extent(256, 256), (256, 256));
    }

    #[test]
    fn extent_width_biased_power_of_two() {
        // Area 1,916,810 -> 2048x1024, the documented reference case.
        assert_eq!(atlas_extent(985, 1946), (2048, 1024));
        // Just over a square power-of-two boundary grows the width first.
        assert_eq!(atlas_extent(1024, 1024), (1024, 1024));
        assert_eq!(atlas_extent(1025, 1024), (2048, 1024));
    }

    #[test]
    fn extent_covers_target_area() {
        for &(w, h) in &[(640, 480), (1920, 1080), (3840, 2160), (97, 3001)] {
            let (aw, ah) = atlas_extent(w, h);
            assert!(u32::from(aw) * u32::from(ah) >= w * h, "{w}x{h}");
            assert!(aw >= ah);
        }
    }

    #[test]
    fn pack_single() {
        let mut p = RectPacker::new(2048, 1024);
        assert_eq!(p.pack(16, 20), Some((0, 0)));
    }

    #[test]
    fn pack_no_overlap() {
        let mut p = RectPacker::new(256, 256);
        let mut packed = Vec::new();
        for i in 0..60u16 {
            let (w, h) = (10 + i % 13, 12 + i % 7);
            if let Some((x, y)) = p.pack(w, h) {
                packed.push((x, y, w, h));
            }
        }
        for (i, a) in packed.iter().enumerate() {
            for b in &packed[i + 1..] {
                let overlap_x = a.0 < b.0 + b.2 && b.0 < a.0 + a.2;
                let overlap_y = a.1 < b.1 + b.3 && b.1 < a.1 + a.3;
                assert!(!(overlap_x && overlap_y), "overlap: {a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn pack_fails_when_full_and_recovers_after_reset() {
        let mut p = RectPacker::new(32, 32);
        let mut count = 0;
        while p.pack(16, 16).is_some() {
            count += 1;
            assert!(count <= 4, "packed too many");
        }
        assert_eq!(count, 4);
        assert!(p.pack(16, 16).is_none());

        p.reset(64, 32);
        assert!(p.pack(16, 16).is_some());
        assert_eq!(p.width(), 64);
    }

    #[test]
    fn oversized_rect_is_rejected_without_corruption() {
        let mut p = RectPacker::new(64, 64);
        assert!(p.pack(65, 2).is_none());
        // The failure must not have consumed any space.
        assert_eq!(p.pack(64, 64), Some((0, 0)));
    }
}
