//! The glyph atlas: one bounded GPU texture, a rect packer, and the glyph
//! cache, with reset/retry handling when the texture fills up.
//!
//! Sizing follows the target pixel area quantized to powers of two (see
//! [`packer::atlas_extent`]), so the atlas only grows or shrinks when a
//! resize crosses a power-of-two area boundary. A reset allocates a fresh
//! texture, reinitializes the packer, and clears the cache; glyphs then
//! re-populate lazily.

use std::sync::Arc;

use super::glyph_cache::{GlyphCache, GlyphShading};
use super::packer::{self, RectPacker};
use super::rasterizer::RasterizedGlyph;
use crate::font::FontFace;

/// Padding added around each glyph in the atlas, guarding against
/// antialiasing bleed from linear sampling at rect edges.
const GLYPH_PAD: u16 = 1;

/// Returned when the atlas cannot fit another glyph. The caller flushes the
/// pending batch, resets the atlas, and retries the same glyph; prior
/// allocations are never corrupted by the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasFull;

/// A cached glyph's location, copied out of the cache entry.
#[derive(Debug, Clone, Copy)]
pub struct AtlasSlot {
    /// Atlas texel rect: x, y, w, h. Zero-sized for invisible glyphs.
    pub tex: [u16; 4],
    /// Signed pixel offset from the baseline origin to the rect's top-left.
    pub offset: [i16; 2],
    pub shading: GlyphShading,
}

impl AtlasSlot {
    pub fn is_visible(&self) -> bool {
        self.tex[2] != 0 && self.tex[3] != 0
    }
}

/// CPU side of the atlas: packer, cache, extent, and generation. Split from
/// the texture so the packing/caching behavior is testable without a GPU.
pub struct AtlasState {
    packer: RectPacker,
    cache: GlyphCache,
    /// Bumped on every reset; entries from older generations no longer
    /// exist because the cache is cleared with them.
    generation: u64,
}

impl Default for AtlasState {
    fn default() -> Self {
        Self::new()
    }
}

impl AtlasState {
    pub fn new() -> Self {
        let (w, h) = packer::atlas_extent(0, 0);
        Self {
            packer: RectPacker::new(w, h),
            cache: GlyphCache::new(),
            generation: 0,
        }
    }

    pub fn extent(&self) -> (u16, u16) {
        (self.packer.width(), self.packer.height())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reinitialize the packer for the given target size and clear the
    /// cache. Returns the new extent.
    pub fn reset(&mut self, target_size: [u32; 2]) -> (u16, u16) {
        let (w, h) = packer::atlas_extent(target_size[0], target_size[1]);
        self.packer.reset(w, h);
        self.cache.clear();
        self.generation += 1;
        (w, h)
    }

    /// Look up a glyph, rasterizing and packing it on miss.
    ///
    /// `rasterize` runs only on a miss. `place` receives the padded texel
    /// origin and the bitmap once a rect has been packed; the GPU owner
    /// uploads there. An invisible glyph (rasterize returns `None`) is
    /// recorded as a valid empty slot and never retried.
    pub fn get_or_insert(
        &mut self,
        face: &Arc<FontFace>,
        glyph: u16,
        rasterize: impl FnOnce() -> Option<RasterizedGlyph>,
        place: impl FnOnce(u16, u16, &RasterizedGlyph),
    ) -> Result<AtlasSlot, AtlasFull> {
        let (entry, inserted) = self.cache.find_or_insert(face, glyph);
        if !inserted {
            return Ok(AtlasSlot {
                tex: entry.tex,
                offset: entry.offset,
                shading: entry.shading,
            });
        }

        let Some(raster) = rasterize() else {
            // Stays a zero-area entry; `is_visible` filters it at draw time.
            return Ok(AtlasSlot {
                tex: entry.tex,
                offset: entry.offset,
                shading: GlyphShading::None,
            });
        };

        let padded_w = raster.width as u16 + 2 * GLYPH_PAD;
        let padded_h = raster.height as u16 + 2 * GLYPH_PAD;
        // On failure the fresh zero entry stays behind, but the caller's
        // reset clears the whole cache before any retry can observe it.
        let Some((x, y)) = self.packer.pack(padded_w, padded_h) else {
            return Err(AtlasFull);
        };

        entry.tex = [x, y, padded_w, padded_h];
        entry.offset = [
            (raster.left - i32::from(GLYPH_PAD)) as i16,
            (-raster.top - i32::from(GLYPH_PAD)) as i16,
        ];
        entry.shading = raster.shading;
        let slot = AtlasSlot {
            tex: entry.tex,
            offset: entry.offset,
            shading: entry.shading,
        };

        place(x + GLYPH_PAD, y + GLYPH_PAD, &raster);
        Ok(slot)
    }
}

/// GPU owner of the atlas texture. All texture access happens on the render
/// thread.
pub struct AtlasManager {
    pub state: AtlasState,
    texture: Option<wgpu::Texture>,
    view: Option<wgpu::TextureView>,
}

impl AtlasManager {
    pub fn new() -> Self {
        Self {
            state: AtlasState::new(),
            texture: None,
            view: None,
        }
    }

    pub fn view(&self) -> Option<&wgpu::TextureView> {
        self.view.as_ref()
    }

    /// Whether a texture exists yet; the first frame resets lazily.
    pub fn is_ready(&self) -> bool {
        self.texture.is_some()
    }

    /// Reset packer + cache and allocate a fresh texture; any bind group
    /// referencing the old view is invalid afterwards.
    ///
    /// The texture is never reused across resets, even at an unchanged
    /// extent: `write_texture` uploads commit at the start of the next
    /// submit, ahead of every recorded pass, so re-packing into the same
    /// texture mid-frame would let the new generation's bitmaps overwrite
    /// texels that already-flushed quads still reference.
    pub fn reset(&mut self, device: &wgpu::Device, target_size: [u32; 2]) {
        let (w, h) = self.state.reset(target_size);

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("glyph_atlas"),
            size: wgpu::Extent3d {
                width: u32::from(w),
                height: u32::from(h),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.view = Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
        self.texture = Some(texture);
        log::debug!(
            "atlas: reset to {w}x{h} (generation {})",
            self.state.generation()
        );
    }

    /// Cache lookup with rasterize-and-upload on miss.
    pub fn get_or_insert(
        &mut self,
        queue: &wgpu::Queue,
        face: &Arc<FontFace>,
        glyph: u16,
        rasterize: impl FnOnce() -> Option<RasterizedGlyph>,
    ) -> Result<AtlasSlot, AtlasFull> {
        let texture = self.texture.as_ref();
        self.state.get_or_insert(face, glyph, rasterize, |x, y, raster| {
            let Some(texture) = texture else { return };
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: u32::from(x),
                        y: u32::from(y),
                        z: 0,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                &raster.data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(raster.width * 4),
                    rows_per_image: Some(raster.height),
                },
                wgpu::Extent3d {
                    width: raster.width,
                    height: raster.height,
                    depth_or_array_layers: 1,
                },
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::test_support::dummy_face;

    fn raster(w: u32, h: u32) -> RasterizedGlyph {
        RasterizedGlyph {
            left: 1,
            top: h as i32,
            width: w,
            height: h,
            data: vec![0xff; (w * h * 4) as usize],
            shading: GlyphShading::Grayscale,
        }
    }

    #[test]
    fn hit_skips_rasterization() {
        let mut state = AtlasState::new();
        let face = dummy_face();
        let mut raster_calls = 0;

        for _ in 0..2 {
            state
                .get_or_insert(
                    &face,
                    5,
                    || {
                        raster_calls += 1;
                        Some(raster(8, 10))
                    },
                    |_, _, _| {},
                )
                .unwrap();
        }
        assert_eq!(raster_calls, 1);
    }

    #[test]
    fn slots_carry_padding_and_offset() {
        let mut state = AtlasState::new();
        let face = dummy_face();
        let mut placed = None;

        let slot = state
            .get_or_insert(
                &face,
                9,
                || Some(raster(8, 10)),
                |x, y, _| {
                    placed = Some((x, y));
                },
            )
            .unwrap();

        // 8x10 bitmap packs as 10x12 with the bitmap 1px inside.
        assert_eq!(slot.tex[2], 10);
        assert_eq!(slot.tex[3], 12);
        assert_eq!(placed, Some((slot.tex[0] + 1, slot.tex[1] + 1)));
        // Raster placement (left=1, top=h) maps to offset (0, -h-1).
        assert_eq!(slot.offset, [0, -11]);
        assert!(slot.is_visible());
    }

    #[test]
    fn invisible_glyph_is_a_cached_noop() {
        let mut state = AtlasState::new();
        let face = dummy_face();
        let mut raster_calls = 0;

        for _ in 0..2 {
            let slot = state
                .get_or_insert(
                    &face,
                    0,
                    || {
                        raster_calls += 1;
                        None
                    },
                    |_, _, _| {},
                )
                .unwrap();
            assert!(!slot.is_visible());
        }
        assert_eq!(raster_calls, 1, "empty glyph must not be retried");
    }

    #[test]
    fn reset_clears_cache_and_retry_succeeds() {
        let mut state = AtlasState::new();
        let face = dummy_face();

        // Fill the 256x256 atlas with oversized glyphs until packing fails.
        let mut glyph = 0u16;
        let full = loop {
            let result =
                state.get_or_insert(&face, glyph, || Some(raster(200, 120)), |_, _, _| {});
            match result {
                Ok(_) => glyph += 1,
                Err(e) => break e,
            }
            assert!(glyph < 100, "atlas never filled up");
        };
        assert_eq!(full, AtlasFull);
        let generation = state.generation();

        state.reset([0, 0]);
        assert_eq!(state.generation(), generation + 1);

        // The failed glyph packs into the fresh atlas.
        let slot = state
            .get_or_insert(&face, glyph, || Some(raster(200, 120)), |_, _, _| {})
            .unwrap();
        assert!(slot.is_visible());

        // And an earlier glyph reads as a miss again.
        let mut raster_calls = 0;
        state
            .get_or_insert(
                &face,
                0,
                || {
                    raster_calls += 1;
                    Some(raster(8, 10))
                },
                |_, _, _| {},
            )
            .unwrap();
        assert_eq!(raster_calls, 1, "reset must clear every entry");
    }

    #[test]
    fn extent_tracks_target_area() {
        let mut state = AtlasState::new();
        assert_eq!(state.extent(), (256, 256));
        assert_eq!(state.reset([985, 1946]), (2048, 1024));
        assert_eq!(state.extent(), (2048, 1024));
    }
}
