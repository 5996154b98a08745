//! The per-frame rendering payload and its generation-tagged settings.
//!
//! A layout/shaping stage owns and mutates this structure; the renderer only
//! reads it, once per frame. Change detection never deep-compares: every
//! settings block carries a [`Generation`] the producer bumps on mutation,
//! and the frame assembler keeps "last seen" copies to decide which GPU
//! resources to rebuild.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use winit::window::Window;

use crate::font::FontFace;

/// Monotonically increasing version tag compared by value equality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Generation(u32);

impl Generation {
    /// Bump to the next generation. Wrapping is fine: equality is the only
    /// comparison anyone performs.
    pub fn bump(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

/// Antialiasing algorithm selected for text shading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AntialiasingMode {
    #[default]
    Grayscale,
    ClearType,
}

/// Cursor shapes drawn by the cursor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CursorKind {
    #[default]
    FullBox,
    VerticalBar,
    Underscore,
    DoubleUnderscore,
    EmptyBox,
}

/// Identity of the presentation target. A generation bump here forces a
/// full swap-surface rebuild rather than an in-place resize.
#[derive(Clone, Default)]
pub struct TargetSettings {
    pub generation: Generation,
    /// Window backing the surface. `None` means no target yet; rendering
    /// against it is an error.
    pub window: Option<Arc<Window>>,
    /// Opaque targets skip alpha composition for lower present latency.
    pub opaque: bool,
}

/// Font-derived pixel metrics. All values are pre-resolved to device pixels
/// by the shaping stage; the renderer does no font-size math of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct FontSettings {
    pub generation: Generation,
    pub cell_size: [u16; 2],
    /// Baseline offset from the cell top, in px.
    pub baseline: f32,
    /// Device pixels per device-independent unit (DPI scale).
    pub px_per_dip: f32,
    pub antialiasing_mode: AntialiasingMode,
    pub underline_pos: u16,
    pub underline_width: u16,
    /// The two row offsets of a double underline.
    pub double_underline_pos: [u16; 2],
    pub strikethrough_pos: u16,
    pub strikethrough_width: u16,
    /// Width of border gridlines and double-underline strokes.
    pub thin_line_width: u16,
}

impl Default for FontSettings {
    fn default() -> Self {
        Self {
            generation: Generation::default(),
            cell_size: [8, 16],
            baseline: 12.0,
            px_per_dip: 1.0,
            antialiasing_mode: AntialiasingMode::default(),
            underline_pos: 14,
            underline_width: 1,
            double_underline_pos: [13, 15],
            strikethrough_pos: 8,
            strikethrough_width: 1,
            thin_line_width: 1,
        }
    }
}

/// Everything else that forces resource rebuilds when it changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiscSettings {
    pub generation: Generation,
    pub background_color: u32,
    pub selection_color: u32,
    /// Path to a user WGSL post-process shader. `None` disables the pass.
    pub custom_shader_path: Option<PathBuf>,
    /// Enables the built-in retro CRT post-process shader.
    pub retro_terminal_effect: bool,
}

/// Cursor appearance. Versioned by the overall settings generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSettings {
    /// `color::INVALID_COLOR` selects the invert path.
    pub color: u32,
    pub kind: CursorKind,
    /// Height of the block cursor as a percentage of the cell, anchored at
    /// the bottom; 100 fills the cell.
    pub height_percentage: u8,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            color: crate::color::INVALID_COLOR,
            kind: CursorKind::default(),
            height_percentage: 20,
        }
    }
}

/// The full settings block. `generation` changes whenever any nested block
/// changed; the nested generations identify which one.
#[derive(Clone, Default)]
pub struct Settings {
    pub generation: Generation,
    pub target: TargetSettings,
    pub font: FontSettings,
    pub misc: MiscSettings,
    pub cursor: CursorSettings,
    /// Target size in px.
    pub target_size: [u32; 2],
    /// Grid dimensions in cells.
    pub cell_count: [u32; 2],
}

bitflags! {
    /// Decoration kinds attached to a cell range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GridLines: u16 {
        const LEFT = 1 << 0;
        const TOP = 1 << 1;
        const RIGHT = 1 << 2;
        const BOTTOM = 1 << 3;
        const UNDERLINE = 1 << 4;
        const HYPERLINK_UNDERLINE = 1 << 5;
        const DOUBLE_UNDERLINE = 1 << 6;
        const STRIKETHROUGH = 1 << 7;
    }
}

/// A run of decorations over columns `[from, to)`.
#[derive(Debug, Clone)]
pub struct GridLineRange {
    pub from: u16,
    pub to: u16,
    pub lines: GridLines,
    pub color: u32,
}

/// One shaped run: a contiguous range of a row's glyph arrays drawn with a
/// single font face at a single em size.
#[derive(Clone)]
pub struct FontMapping {
    pub face: Arc<FontFace>,
    pub em_size_px: f32,
    /// Index range into the owning row's glyph arrays.
    pub glyphs: Range<usize>,
}

/// One shaped grid row, structure-of-arrays like the shaper produces it.
#[derive(Clone, Default)]
pub struct RowPayload {
    pub mappings: Vec<FontMapping>,
    pub glyph_indices: Vec<u16>,
    /// Horizontal advance per glyph, in DIPs.
    pub glyph_advances: Vec<f32>,
    /// (advance offset, ascender offset) per glyph, in DIPs.
    pub glyph_offsets: Vec<[f32; 2]>,
    pub colors: Vec<u32>,
    pub gridlines: Vec<GridLineRange>,
    /// Selected column span `[from, to)`; empty when nothing is selected.
    pub selection: Range<u16>,
}

/// Half-open rectangle in cell coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellRect {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

impl CellRect {
    pub fn new(left: u16, top: u16, right: u16, bottom: u16) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }
}

/// Warning surfaced through the payload's warning callback. The only
/// non-fatal error a caller ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderWarning {
    /// The custom post-process shader failed to compile; rendering
    /// continues without it.
    CustomShaderCompileFailed,
}

pub type WarningCallback = Arc<dyn Fn(RenderWarning) + Send + Sync>;
pub type SurfaceChangedCallback = Arc<dyn Fn() + Send + Sync>;

/// Everything the renderer reads for one frame.
#[derive(Clone, Default)]
pub struct RenderPayload {
    pub settings: Settings,
    pub rows: Vec<RowPayload>,
    /// Per-cell background colors, row-major, `cell_count.x * cell_count.y`
    /// entries.
    pub background: Vec<u32>,
    /// Cursor extent in cells; empty means hidden.
    pub cursor_rect: CellRect,
    /// Region that changed since the last frame, in cells. Empty means
    /// nothing to present.
    pub dirty_rect: CellRect,
    /// Rows the content scrolled since the last frame (positive = down).
    pub scroll_offset: i32,
    pub warning_callback: Option<WarningCallback>,
    /// Invoked after the swap surface has been (re)created.
    pub surface_changed_callback: Option<SurfaceChangedCallback>,
}

impl RenderPayload {
    /// Dirty rect covering the whole grid, the "no partial present" case.
    pub fn full_dirty_rect(&self) -> CellRect {
        CellRect::new(
            0,
            0,
            self.settings.cell_count[0] as u16,
            self.settings.cell_count[1] as u16,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_equality_only() {
        let mut g = Generation::default();
        let seen = g;
        assert_eq!(g, seen);
        g.bump();
        assert_ne!(g, seen);
    }

    #[test]
    fn cell_rect_emptiness() {
        assert!(CellRect::default().is_empty());
        assert!(CellRect::new(3, 1, 3, 5).is_empty());
        assert!(!CellRect::new(0, 0, 1, 1).is_empty());
    }
}
