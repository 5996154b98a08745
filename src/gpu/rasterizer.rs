//! Single-glyph rasterization via swash.
//!
//! Color sources (COLR layers, embedded bitmaps) are attempted first and
//! classified as color glyphs; fonts without color data fall back to plain
//! outline rendering in the active antialiasing mode. Output is normalized
//! to premultiplied RGBA8 so the atlas holds exactly one format.

use swash::scale::image::Content;
use swash::scale::{Render, ScaleContext, Source, StrikeWith};
use swash::zeno::Format;

use super::glyph_cache::GlyphShading;
use crate::font::FontFace;
use crate::payload::AntialiasingMode;

/// A rasterized glyph bitmap with its placement relative to the baseline
/// origin: `left` px rightward, `top` px upward to the bitmap's top edge.
pub struct RasterizedGlyph {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
    /// Premultiplied RGBA8, `width * height * 4` bytes.
    pub data: Vec<u8>,
    pub shading: GlyphShading,
}

pub struct GlyphRasterizer {
    context: ScaleContext,
}

impl Default for GlyphRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl GlyphRasterizer {
    pub fn new() -> Self {
        Self {
            context: ScaleContext::new(),
        }
    }

    /// Rasterize one glyph at the given em size in pixels.
    ///
    /// Returns `None` for glyphs with no visible pixels (control characters,
    /// whitespace, degenerate geometry); callers record those as valid
    /// empty cache entries so they are never retried.
    pub fn rasterize(
        &mut self,
        face: &FontFace,
        glyph: u16,
        em_size_px: f32,
        aa_mode: AntialiasingMode,
    ) -> Option<RasterizedGlyph> {
        let mut scaler = self
            .context
            .builder(face.as_ref())
            .size(em_size_px)
            .hint(true)
            .build();

        let format = match aa_mode {
            AntialiasingMode::Grayscale => Format::Alpha,
            AntialiasingMode::ClearType => Format::Subpixel,
        };

        let image = Render::new(&[
            Source::ColorOutline(0),
            Source::ColorBitmap(StrikeWith::BestFit),
            Source::Outline,
        ])
        .format(format)
        .render(&mut scaler, glyph)?;

        let (width, height) = (image.placement.width, image.placement.height);
        if width == 0 || height == 0 {
            return None;
        }

        let pixels = (width * height) as usize;
        let (data, shading) = match image.content {
            Content::Mask => {
                // Coverage mask: expand to premultiplied white.
                let mut rgba = Vec::with_capacity(pixels * 4);
                for &c in &image.data {
                    rgba.extend_from_slice(&[c, c, c, c]);
                }
                (rgba, GlyphShading::Grayscale)
            }
            Content::SubpixelMask => {
                // Per-channel coverage weights, already 4 bytes per pixel.
                (image.data, GlyphShading::ClearType)
            }
            Content::Color => {
                // Straight-alpha RGBA from the font; premultiply.
                let mut rgba = image.data;
                for px in rgba.chunks_exact_mut(4) {
                    let a = u16::from(px[3]);
                    px[0] = ((u16::from(px[0]) * a) / 255) as u8;
                    px[1] = ((u16::from(px[1]) * a) / 255) as u8;
                    px[2] = ((u16::from(px[2]) * a) / 255) as u8;
                }
                (rgba, GlyphShading::Color)
            }
        };

        Some(RasterizedGlyph {
            left: image.placement.left,
            top: image.placement.top,
            width,
            height,
            data,
            shading,
        })
    }
}
