//! Frame assembly: turns one [`RenderPayload`] into quads and render passes.
//!
//! Every frame re-reads the payload in full. The only state carried across
//! frames is GPU resources plus [`TrackedState`], the set of generation
//! counters and sizes that decides which resources to rebuild; nothing is
//! ever diffed structurally.
//!
//! Paint order within a frame: background, glyphs, grid lines, cursor,
//! selection. All of it accumulates into one quad batch and normally one
//! render pass; the batch only splits when the glyph atlas fills up
//! mid-frame, in which case the pending quads are drawn, the atlas is
//! reset, and assembly resumes with the same glyph.

use std::sync::Arc;

use crate::backend::{RenderBackend, RenderError};
use crate::color::{self, INVALID_COLOR};
use crate::font::FontFace;
use crate::gpu::atlas::{AtlasFull, AtlasManager};
use crate::gpu::batcher::{BatchBuffers, QuadBatcher, QuadInstance, ShadingType};
use crate::gpu::custom_shader::CustomShaderPass;
use crate::gpu::glyph_cache::GlyphShading;
use crate::gpu::pipeline::{self, CONST_BUFFER_SIZE, ConstBuffer};
use crate::gpu::presenter::{PresentRegion, SurfacePresenter, present_region};
use crate::gpu::rasterizer::GlyphRasterizer;
use crate::gpu::state::GpuState;
use crate::payload::{
    AntialiasingMode, CellRect, CursorKind, FontSettings, Generation, GridLines, RenderPayload,
    RowPayload, Settings,
};

/// Which resource groups this frame must rebuild, derived purely from
/// generation counters and size fields. Computing a plan twice against the
/// same tracked state yields the same plan; after
/// [`TrackedState::commit`] the plan for the same settings is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshPlan {
    pub font_changed: bool,
    pub misc_changed: bool,
    pub target_size_changed: bool,
    pub cell_count_changed: bool,
}

impl RefreshPlan {
    pub fn any(&self) -> bool {
        *self != Self::default()
    }
}

/// Last-seen generations and sizes.
#[derive(Debug, Default)]
pub struct TrackedState {
    /// `None` until the first commit, which forces a full rebuild even if
    /// the payload's counters happen to match our zero defaults.
    generation: Option<Generation>,
    font_generation: Generation,
    misc_generation: Generation,
    target_size: [u32; 2],
    cell_count: [u32; 2],
}

impl TrackedState {
    pub fn plan(&self, settings: &Settings) -> RefreshPlan {
        if self.generation == Some(settings.generation) {
            return RefreshPlan::default();
        }
        let first = self.generation.is_none();
        RefreshPlan {
            font_changed: first || self.font_generation != settings.font.generation,
            misc_changed: first || self.misc_generation != settings.misc.generation,
            target_size_changed: first || self.target_size != settings.target_size,
            cell_count_changed: first || self.cell_count != settings.cell_count,
        }
    }

    pub fn commit(&mut self, settings: &Settings) {
        self.generation = Some(settings.generation);
        self.font_generation = settings.font.generation;
        self.misc_generation = settings.misc.generation;
        self.target_size = settings.target_size;
        self.cell_count = settings.cell_count;
    }
}

/// Append one row's grid line decorations.
fn append_grid_lines(batcher: &mut QuadBatcher, row: &RowPayload, y: usize, font: &FontSettings) {
    let cw = f32::from(font.cell_size[0]);
    let ch = f32::from(font.cell_size[1]);
    let thin = f32::from(font.thin_line_width);
    let top = ch * y as f32;

    for r in &row.gridlines {
        debug_assert!(!r.lines.is_empty());

        let left = cw * f32::from(r.from);
        let width = cw * f32::from(r.to - r.from);
        let mut fill = |pos: [f32; 4], shading: ShadingType| {
            batcher.append(QuadInstance {
                pos,
                tex: [0.0; 4],
                color: r.color,
                shading,
            });
        };

        if r.lines.contains(GridLines::LEFT) {
            fill([left, top, thin, ch], ShadingType::SolidFill);
        }
        if r.lines.contains(GridLines::TOP) {
            fill([left, top, cw, thin], ShadingType::SolidFill);
        }
        if r.lines.contains(GridLines::RIGHT) {
            fill([left + cw - thin, top, thin, ch], ShadingType::SolidFill);
        }
        if r.lines.contains(GridLines::BOTTOM) {
            fill([left, top + ch - thin, cw, thin], ShadingType::SolidFill);
        }
        if r.lines.contains(GridLines::UNDERLINE) {
            fill(
                [
                    left,
                    top + f32::from(font.underline_pos),
                    width,
                    f32::from(font.underline_width),
                ],
                ShadingType::SolidFill,
            );
        }
        if r.lines.contains(GridLines::HYPERLINK_UNDERLINE) {
            fill(
                [
                    left,
                    top + f32::from(font.underline_pos),
                    width,
                    f32::from(font.underline_width),
                ],
                ShadingType::DashedLine,
            );
        }
        if r.lines.contains(GridLines::DOUBLE_UNDERLINE) {
            for pos in font.double_underline_pos {
                fill([left, top + f32::from(pos), width, thin], ShadingType::SolidFill);
            }
        }
        if r.lines.contains(GridLines::STRIKETHROUGH) {
            fill(
                [
                    left,
                    top + f32::from(font.strikethrough_pos),
                    width,
                    f32::from(font.strikethrough_width),
                ],
                ShadingType::SolidFill,
            );
        }
    }
}

/// Append one row's selection tint, merging with the quad from the previous
/// row when the two spans line up into one rectangle.
fn append_selection(
    batcher: &mut QuadBatcher,
    row: &RowPayload,
    y: usize,
    font: &FontSettings,
    selection_color: u32,
) {
    if row.selection.is_empty() {
        return;
    }
    let cw = f32::from(font.cell_size[0]);
    let ch = f32::from(font.cell_size[1]);
    let x = cw * f32::from(row.selection.start);
    let w = cw * f32::from(row.selection.end - row.selection.start);
    let top = ch * y as f32;

    if let Some(last) = batcher.last_quad() {
        if last.shading == ShadingType::SolidFill
            && last.color == selection_color
            && last.pos[0] == x
            && last.pos[2] == w
            && last.pos[1] + last.pos[3] == top
        {
            last.pos[3] += ch;
            return;
        }
    }
    batcher.append(QuadInstance {
        pos: [x, top, w, ch],
        tex: [0.0; 4],
        color: selection_color,
        shading: ShadingType::SolidFill,
    });
}

/// The pixel rects a cursor of the given shape covers within its cell rect.
fn cursor_shape_rects(
    kind: CursorKind,
    rect: [f32; 4],
    font: &FontSettings,
    height_percentage: u8,
) -> Vec<[f32; 4]> {
    let [x, y, w, h] = rect;
    let thin = f32::from(font.thin_line_width);
    match kind {
        CursorKind::FullBox => {
            let height = h * f32::from(height_percentage.min(100)) / 100.0;
            vec![[x, y + h - height, w, height]]
        }
        CursorKind::VerticalBar => vec![[x, y, thin, h]],
        CursorKind::Underscore => vec![[
            x,
            y + f32::from(font.underline_pos),
            w,
            f32::from(font.underline_width),
        ]],
        CursorKind::DoubleUnderscore => font
            .double_underline_pos
            .iter()
            .map(|&pos| [x, y + f32::from(pos), w, thin])
            .collect(),
        CursorKind::EmptyBox => vec![
            [x, y, w, thin],
            [x, y + h - thin, w, thin],
            [x, y, thin, h],
            [x + w - thin, y, thin, h],
        ],
    }
}

/// ClearType needs the dual-source pipeline; otherwise fall back to
/// grayscale regardless of what the font settings ask for.
fn effective_aa_mode(requested: AntialiasingMode, dual_source_blending: bool) -> AntialiasingMode {
    match requested {
        AntialiasingMode::ClearType if dual_source_blending => AntialiasingMode::ClearType,
        AntialiasingMode::ClearType | AntialiasingMode::Grayscale => AntialiasingMode::Grayscale,
    }
}

fn rects_intersect(a: [f32; 4], b: [f32; 4]) -> Option<[f32; 4]> {
    let left = a[0].max(b[0]);
    let top = a[1].max(b[1]);
    let right = (a[0] + a[2]).min(b[0] + b[2]);
    let bottom = (a[1] + a[3]).min(b[1] + b[3]);
    (left < right && top < bottom).then(|| [left, top, right - left, bottom - top])
}

/// Append the cursor.
///
/// A configured cursor color paints directly. The invert sentinel instead
/// derives a fill per covered column from the background underneath,
/// coalescing adjacent columns with equal fills, and then re-appends
/// clipped, color-inverted copies of every earlier quad the cursor
/// overlaps, so glyphs stay legible on top of the inverted block.
fn append_cursor(
    batcher: &mut QuadBatcher,
    settings: &Settings,
    background: &[u32],
    cursor_rect: CellRect,
) {
    if cursor_rect.is_empty() {
        return;
    }
    let font = &settings.font;
    let cw = f32::from(font.cell_size[0]);
    let ch = f32::from(font.cell_size[1]);
    let rect = [
        cw * f32::from(cursor_rect.left),
        ch * f32::from(cursor_rect.top),
        cw * f32::from(cursor_rect.right - cursor_rect.left),
        ch * f32::from(cursor_rect.bottom - cursor_rect.top),
    ];

    let invert = settings.cursor.color == INVALID_COLOR;
    let overlap_end = batcher.len();
    let shape_rects = cursor_shape_rects(
        settings.cursor.kind,
        rect,
        font,
        settings.cursor.height_percentage,
    );

    if invert {
        // Each covered column inverts its own background; a single color
        // for the whole rect would pick the wrong correction when only
        // some columns sit on near-gray.
        let row_base = usize::from(cursor_rect.top) * settings.cell_count[0] as usize;
        let column_fill = |col: u16| {
            color::invert_cursor_color(
                background.get(row_base + usize::from(col)).copied().unwrap_or(0),
            )
        };

        let mut col = cursor_rect.left;
        while col < cursor_rect.right {
            let fill = column_fill(col);
            let mut end = col + 1;
            while end < cursor_rect.right && column_fill(end) == fill {
                end += 1;
            }
            let run = [
                cw * f32::from(col),
                rect[1],
                cw * f32::from(end - col),
                rect[3],
            ];
            for &shape in &shape_rects {
                if let Some(clipped) = rects_intersect(shape, run) {
                    batcher.append(QuadInstance {
                        pos: clipped,
                        tex: [0.0; 4],
                        color: fill,
                        shading: ShadingType::SolidFill,
                    });
                }
            }
            col = end;
        }
    } else {
        for pos in shape_rects {
            batcher.append(QuadInstance {
                pos,
                tex: [0.0; 4],
                color: settings.cursor.color,
                shading: ShadingType::SolidFill,
            });
        }
        return;
    }

    // The whole-frame background quad is excluded: the inverted fill above
    // already covers it.
    let mut copies = Vec::new();
    for quad in &batcher.quads()[..overlap_end] {
        if quad.shading == ShadingType::Background {
            continue;
        }
        if let Some(clipped) = rects_intersect(rect, quad.pos) {
            let mut copy = *quad;
            copy.tex[0] += clipped[0] - copy.pos[0];
            copy.tex[1] += clipped[1] - copy.pos[1];
            copy.tex[2] = clipped[2];
            copy.tex[3] = clipped[3];
            copy.pos = clipped;
            copy.color = color::invert_corrected(copy.color);
            if copy.shading == ShadingType::Passthrough {
                copy.shading = ShadingType::PassthroughInvert;
            }
            copies.push(copy);
        }
    }
    for copy in copies {
        batcher.append(copy);
    }
}

/// The wgpu quad renderer.
pub struct WgpuBackend {
    gpu: GpuState,
    presenter: SurfacePresenter,
    atlas: AtlasManager,
    batcher: QuadBatcher,
    buffers: BatchBuffers,
    rasterizer: GlyphRasterizer,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: Option<wgpu::RenderPipeline>,
    pipeline_format: wgpu::TextureFormat,
    uniforms: wgpu::Buffer,
    bind_group: Option<wgpu::BindGroup>,
    background: Option<(wgpu::Texture, wgpu::TextureView)>,
    custom_shader: Option<CustomShaderPass>,
    tracked: TrackedState,
    cleartype_downgrade_logged: bool,
}

impl WgpuBackend {
    pub fn new(gpu: GpuState) -> Self {
        let bind_group_layout = pipeline::create_bind_group_layout(&gpu.device);
        let uniforms = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("quad_uniforms"),
            size: CONST_BUFFER_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            gpu,
            presenter: SurfacePresenter::new(),
            atlas: AtlasManager::new(),
            batcher: QuadBatcher::new(),
            buffers: BatchBuffers::new(),
            rasterizer: GlyphRasterizer::new(),
            bind_group_layout,
            pipeline: None,
            pipeline_format: wgpu::TextureFormat::Bgra8Unorm,
            uniforms,
            bind_group: None,
            background: None,
            custom_shader: None,
            tracked: TrackedState::default(),
            cleartype_downgrade_logged: false,
        }
    }

    fn effective_aa_mode(&mut self, settings: &Settings) -> AntialiasingMode {
        let mode = effective_aa_mode(settings.font.antialiasing_mode, self.gpu.dual_source_blending);
        if mode != settings.font.antialiasing_mode && !self.cleartype_downgrade_logged {
            self.cleartype_downgrade_logged = true;
            log::warn!("adapter lacks dual-source blending, using grayscale antialiasing");
        }
        mode
    }

    fn ensure_pipeline(&mut self) {
        let format = self.presenter.format();
        if self.pipeline.is_some() && self.pipeline_format == format {
            return;
        }
        self.pipeline = Some(pipeline::create_quad_pipeline(
            &self.gpu.device,
            format,
            &self.bind_group_layout,
            self.gpu.dual_source_blending,
        ));
        self.pipeline_format = format;
    }

    fn refresh_background_texture(&mut self, cell_count: [u32; 2]) {
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("background_colors"),
            size: wgpu::Extent3d {
                width: cell_count[0].max(1),
                height: cell_count[1].max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.background = Some((texture, view));
        self.bind_group = None;
    }

    fn upload_background(&self, payload: &RenderPayload) {
        let Some((texture, _)) = &self.background else {
            return;
        };
        let [w, h] = payload.settings.cell_count;
        let expected = (w * h) as usize;
        if payload.background.len() < expected || expected == 0 {
            return;
        }
        let mut bytes = Vec::with_capacity(expected * 4);
        for &c in &payload.background[..expected] {
            bytes.extend_from_slice(&c.to_ne_bytes());
        }
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(w * 4),
                rows_per_image: Some(h),
            },
            wgpu::Extent3d {
                width: w,
                height: h,
                depth_or_array_layers: 1,
            },
        );
    }

    fn update_uniforms(&self, settings: &Settings) {
        let cb = ConstBuffer {
            position_scale: [
                2.0 / settings.target_size[0].max(1) as f32,
                -2.0 / settings.target_size[1].max(1) as f32,
            ],
            cell_size: [
                f32::from(settings.font.cell_size[0]),
                f32::from(settings.font.cell_size[1]),
            ],
            cell_count: [settings.cell_count[0] as f32, settings.cell_count[1] as f32],
            grayscale_enhanced_contrast: 1.0,
            cleartype_enhanced_contrast: 0.5,
            // Identity alpha correction; platform gamma tables are out of
            // reach without a DirectWrite equivalent.
            gamma_ratios: [0.0; 4],
            dashed_line_length: f32::from(settings.font.underline_width) * 3.0,
        };
        self.gpu.queue.write_buffer(&self.uniforms, 0, &cb.as_bytes());
    }

    /// Draw and drain the accumulated quads into `view`.
    fn flush(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        first_pass: &mut bool,
        cell_count: [u32; 2],
    ) -> Result<(), RenderError> {
        if self.batcher.is_empty() {
            return Ok(());
        }
        let batch = self.batcher.take_frame();
        let (grew, instances, indices) =
            self.buffers
                .upload(&self.gpu.device, &self.gpu.queue, &batch, cell_count);
        if grew {
            self.bind_group = None;
        }

        if self.bind_group.is_none() {
            let (background_view, atlas_view) = match (&self.background, self.atlas.view()) {
                (Some((_, bg)), Some(atlas)) => (bg, atlas),
                _ => return Err(RenderError::SurfaceNotReady),
            };
            self.bind_group = Some(pipeline::create_bind_group(
                &self.gpu.device,
                &self.bind_group_layout,
                &self.uniforms,
                instances,
                background_view,
                atlas_view,
            ));
        }

        let load = if *first_pass {
            wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
        } else {
            wgpu::LoadOp::Load
        };
        *first_pass = false;

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("quad_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        if let (Some(pipeline), Some(bind_group)) = (&self.pipeline, &self.bind_group) {
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.set_index_buffer(indices.slice(..), batch.indices.format());
            pass.draw_indexed(0..batch.indices.count(), 0, 0..1);
        }
        Ok(())
    }

    /// Append every glyph of every row, rasterizing misses into the atlas.
    /// On atlas exhaustion the pending quads are flushed, the atlas resets,
    /// and the same glyph is retried against the empty atlas.
    fn append_text(
        &mut self,
        payload: &RenderPayload,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        first_pass: &mut bool,
    ) -> Result<(), RenderError> {
        let settings = &payload.settings;
        let font = &settings.font;
        let aa_mode = self.effective_aa_mode(settings);
        let ch = f32::from(font.cell_size[1]);
        let ppd = font.px_per_dip;
        let text_shading = match aa_mode {
            AntialiasingMode::ClearType => ShadingType::TextClearType,
            AntialiasingMode::Grayscale => ShadingType::TextGrayscale,
        };

        for (y, row) in payload.rows.iter().enumerate() {
            let baseline_y = ch * y as f32 + font.baseline;
            let mut cumulative_advance = 0.0f32;

            for mapping in &row.mappings {
                let mut i = mapping.glyphs.start;
                while i < mapping.glyphs.end {
                    let glyph = row.glyph_indices[i];
                    let rasterizer = &mut self.rasterizer;
                    let face: &Arc<FontFace> = &mapping.face;
                    let em_size = mapping.em_size_px;
                    let result = self.atlas.get_or_insert(&self.gpu.queue, face, glyph, || {
                        rasterizer.rasterize(face, glyph, em_size, aa_mode)
                    });

                    let slot = match result {
                        Ok(slot) => slot,
                        Err(AtlasFull) => {
                            // Draw what we have so cached rects stay valid,
                            // then start over with an empty atlas.
                            self.flush(encoder, view, first_pass, settings.cell_count)?;
                            self.atlas.reset(&self.gpu.device, settings.target_size);
                            self.bind_group = None;
                            continue;
                        }
                    };

                    if slot.is_visible() {
                        let offsets = row.glyph_offsets[i];
                        let pos = [
                            (cumulative_advance + offsets[0]) * ppd + f32::from(slot.offset[0]),
                            baseline_y - offsets[1] * ppd + f32::from(slot.offset[1]),
                            f32::from(slot.tex[2]),
                            f32::from(slot.tex[3]),
                        ];
                        let (color, shading) = if slot.shading == GlyphShading::Color {
                            (0, ShadingType::Passthrough)
                        } else {
                            (row.colors[i], text_shading)
                        };
                        self.batcher.append(QuadInstance {
                            pos,
                            tex: [
                                f32::from(slot.tex[0]),
                                f32::from(slot.tex[1]),
                                f32::from(slot.tex[2]),
                                f32::from(slot.tex[3]),
                            ],
                            color,
                            shading,
                        });
                    }

                    cumulative_advance += row.glyph_advances[i];
                    i += 1;
                }
            }
        }
        Ok(())
    }
}

impl RenderBackend for WgpuBackend {
    fn render(&mut self, payload: &RenderPayload) -> Result<(), RenderError> {
        let settings = &payload.settings;

        let surface_changed = self.presenter.ensure_target(&self.gpu, settings)?;
        if surface_changed {
            if let Some(cb) = &payload.surface_changed_callback {
                cb();
            }
        }
        self.ensure_pipeline();

        let plan = self.tracked.plan(settings);
        if plan.misc_changed {
            self.custom_shader = CustomShaderPass::refresh(
                &self.gpu.device,
                self.presenter.format(),
                &settings.misc,
                payload.warning_callback.as_ref(),
            );
        } else if self.custom_shader.as_ref().is_some_and(CustomShaderPass::take_invalidation) {
            log::info!("custom shader changed on disk, recompiling");
            self.custom_shader = CustomShaderPass::refresh(
                &self.gpu.device,
                self.presenter.format(),
                &settings.misc,
                payload.warning_callback.as_ref(),
            );
        }
        if plan.cell_count_changed {
            self.refresh_background_texture(settings.cell_count);
        }
        if plan.font_changed || plan.target_size_changed {
            self.update_uniforms(settings);
        }
        if plan.font_changed || !self.atlas.is_ready() {
            // Glyph bitmaps bake the em size and antialiasing mode, so a
            // font change invalidates all of them.
            self.atlas.reset(&self.gpu.device, settings.target_size);
            self.bind_group = None;
        }
        self.tracked.commit(settings);

        let region = present_region(
            payload.dirty_rect,
            payload.scroll_offset,
            settings.font.cell_size,
            settings.cell_count,
        );
        let region = match (region, self.requires_continuous_redraw()) {
            (Some(r), _) => r,
            (None, true) => PresentRegion::Full,
            (None, false) => return Ok(()),
        };

        self.upload_background(payload);

        let frame = self.presenter.acquire()?;
        let frame_view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame_encoder"),
            });

        // With a post-process shader active the quads render offscreen and
        // the shader pass resolves to the surface.
        let main_view = match &mut self.custom_shader {
            Some(shader) => shader
                .offscreen_view(&self.gpu.device, self.pipeline_format, settings.target_size)
                .clone(),
            None => frame_view.clone(),
        };

        self.batcher.clear();
        let mut first_pass = true;

        // Background, as one whole-target quad sampling the color bitmap.
        self.batcher.append(QuadInstance {
            pos: [
                0.0,
                0.0,
                settings.target_size[0] as f32,
                settings.target_size[1] as f32,
            ],
            tex: [0.0; 4],
            color: 0,
            shading: ShadingType::Background,
        });

        self.append_text(payload, &mut encoder, &main_view, &mut first_pass)?;

        for (y, row) in payload.rows.iter().enumerate() {
            append_grid_lines(&mut self.batcher, row, y, &settings.font);
        }

        append_cursor(
            &mut self.batcher,
            settings,
            &payload.background,
            payload.cursor_rect,
        );

        for (y, row) in payload.rows.iter().enumerate() {
            append_selection(
                &mut self.batcher,
                row,
                y,
                &settings.font,
                settings.misc.selection_color,
            );
        }

        self.flush(&mut encoder, &main_view, &mut first_pass, settings.cell_count)?;

        if let Some(shader) = &mut self.custom_shader {
            shader.record(
                &self.gpu.device,
                &self.gpu.queue,
                &mut encoder,
                &frame_view,
                settings.font.px_per_dip,
                color::rgba_from_u32_premultiplied(settings.misc.background_color),
            );
        }

        if let PresentRegion::Partial { dirty, scroll } = region {
            log::trace!("partial present: dirty={dirty:?} scroll={scroll:?}");
        }

        self.gpu.queue.submit(Some(encoder.finish()));
        self.presenter.present(&self.gpu.queue, frame);
        Ok(())
    }

    fn requires_continuous_redraw(&self) -> bool {
        self.custom_shader
            .as_ref()
            .is_some_and(CustomShaderPass::requires_continuous_redraw)
    }

    fn wait_until_can_render(&mut self) {
        let device = &self.gpu.device;
        self.presenter.wait_until_can_render(|| {
            let _ = device.poll(wgpu::PollType::Poll);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::GridLineRange;

    fn settings() -> Settings {
        Settings {
            cell_count: [80, 24],
            target_size: [640, 384],
            ..Settings::default()
        }
    }

    #[test]
    fn refresh_plan_is_empty_after_commit() {
        let mut tracked = TrackedState::default();
        let mut s = settings();

        let plan = tracked.plan(&s);
        assert!(plan.font_changed && plan.misc_changed && plan.cell_count_changed);
        assert_eq!(plan, tracked.plan(&s), "planning must not mutate state");

        tracked.commit(&s);
        assert!(!tracked.plan(&s).any());

        s.font.generation.bump();
        s.generation.bump();
        let plan = tracked.plan(&s);
        assert!(plan.font_changed);
        assert!(!plan.misc_changed);
    }

    #[test]
    fn hyperlink_underline_is_dashed() {
        let mut batcher = QuadBatcher::new();
        let row = RowPayload {
            gridlines: vec![GridLineRange {
                from: 2,
                to: 6,
                lines: GridLines::HYPERLINK_UNDERLINE | GridLines::STRIKETHROUGH,
                color: 0xff88_4422,
            }],
            ..RowPayload::default()
        };
        append_grid_lines(&mut batcher, &row, 1, &FontSettings::default());

        let quads = batcher.quads();
        assert_eq!(quads.len(), 2);
        assert_eq!(quads[0].shading, ShadingType::DashedLine);
        assert_eq!(quads[0].pos, [16.0, 30.0, 32.0, 1.0]);
        assert_eq!(quads[1].shading, ShadingType::SolidFill);
    }

    #[test]
    fn selection_spans_merge_across_rows() {
        let mut batcher = QuadBatcher::new();
        let font = FontSettings::default();
        let row = RowPayload {
            selection: 4..10,
            ..RowPayload::default()
        };

        append_selection(&mut batcher, &row, 0, &font, 0x7f00_ff00);
        append_selection(&mut batcher, &row, 1, &font, 0x7f00_ff00);
        assert_eq!(batcher.len(), 1);
        assert_eq!(batcher.quads()[0].pos, [32.0, 0.0, 48.0, 32.0]);

        // A different span on row 3 (with a gap) stays separate.
        let other = RowPayload {
            selection: 0..2,
            ..RowPayload::default()
        };
        append_selection(&mut batcher, &other, 3, &font, 0x7f00_ff00);
        assert_eq!(batcher.len(), 2);
    }

    #[test]
    fn invert_cursor_corrects_mid_gray_and_reappends_overlaps() {
        let mut batcher = QuadBatcher::new();
        let mut s = settings();
        s.cursor.height_percentage = 100;

        // A color glyph partially overlapping the cursor cell.
        batcher.append(QuadInstance {
            pos: [6.0, 2.0, 8.0, 10.0],
            tex: [100.0, 50.0, 8.0, 10.0],
            color: 0,
            shading: ShadingType::Passthrough,
        });

        // Mid-gray background under the cursor cell.
        let mut background = vec![0u32; 80 * 24];
        background[0] = 0x007f_7f7f;
        append_cursor(&mut batcher, &s, &background, CellRect::new(0, 0, 1, 1));

        let quads = batcher.quads();
        assert_eq!(quads.len(), 3);
        // Plain complement of 0x7f7f7f is invisible gray; the corrected
        // invert must be used instead.
        assert_eq!(quads[1].color, 0x00bf_bfbf);
        assert_eq!(quads[1].shading, ShadingType::SolidFill);

        // The glyph copy is clipped to the cursor cell and inverted.
        let copy = quads[2];
        assert_eq!(copy.shading, ShadingType::PassthroughInvert);
        assert_eq!(copy.pos, [6.0, 2.0, 2.0, 10.0]);
        assert_eq!(copy.tex, [100.0, 50.0, 2.0, 10.0]);
    }

    #[test]
    fn invert_cursor_resolves_backgrounds_per_column() {
        let mut batcher = QuadBatcher::new();
        let mut s = settings();
        s.cursor.height_percentage = 100;

        // Column 0 is near-gray, column 1 is saturated red: the first needs
        // the XOR correction, the second the plain complement.
        let mut background = vec![0u32; 80 * 24];
        background[0] = 0x007f_7f7f;
        background[1] = 0x0000_00ff;
        append_cursor(&mut batcher, &s, &background, CellRect::new(0, 0, 2, 1));

        let quads = batcher.quads();
        assert_eq!(quads.len(), 2);
        assert_eq!(quads[0].pos, [0.0, 0.0, 8.0, 16.0]);
        assert_eq!(quads[0].color, 0x00bf_bfbf);
        assert_eq!(quads[1].pos, [8.0, 0.0, 8.0, 16.0]);
        assert_eq!(quads[1].color, 0x00ff_ff00);
    }

    #[test]
    fn equal_invert_columns_coalesce_into_one_quad() {
        let mut batcher = QuadBatcher::new();
        let mut s = settings();
        s.cursor.height_percentage = 100;

        let background = vec![0x0020_4060u32; 80 * 24];
        append_cursor(&mut batcher, &s, &background, CellRect::new(4, 0, 7, 1));

        let quads = batcher.quads();
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].pos, [32.0, 0.0, 24.0, 16.0]);
    }

    #[test]
    fn cleartype_downgrades_without_dual_source_blending() {
        assert_eq!(
            effective_aa_mode(AntialiasingMode::ClearType, true),
            AntialiasingMode::ClearType
        );
        assert_eq!(
            effective_aa_mode(AntialiasingMode::ClearType, false),
            AntialiasingMode::Grayscale
        );
        assert_eq!(
            effective_aa_mode(AntialiasingMode::Grayscale, true),
            AntialiasingMode::Grayscale
        );
    }

    #[test]
    fn configured_cursor_color_paints_directly() {
        let mut batcher = QuadBatcher::new();
        let mut s = settings();
        s.cursor.color = 0xffff_0000;
        s.cursor.kind = CursorKind::VerticalBar;

        append_cursor(&mut batcher, &s, &[], CellRect::new(10, 2, 11, 3));
        let quads = batcher.quads();
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].color, 0xffff_0000);
        assert_eq!(quads[0].pos, [80.0, 32.0, 1.0, 16.0]);
    }

    #[test]
    fn empty_box_cursor_draws_four_edges() {
        let rects = cursor_shape_rects(
            CursorKind::EmptyBox,
            [0.0, 0.0, 16.0, 16.0],
            &FontSettings::default(),
            100,
        );
        assert_eq!(rects.len(), 4);
    }

    #[test]
    fn identical_payload_assembles_identical_quads() {
        let font = FontSettings::default();
        let s = settings();
        let row = RowPayload {
            selection: 1..5,
            gridlines: vec![GridLineRange {
                from: 0,
                to: 8,
                lines: GridLines::UNDERLINE,
                color: 0xffff_ffff,
            }],
            ..RowPayload::default()
        };

        let build = || {
            let mut batcher = QuadBatcher::new();
            append_grid_lines(&mut batcher, &row, 0, &font);
            append_cursor(&mut batcher, &s, &[0x0020_4060; 80 * 24], CellRect::new(2, 0, 3, 1));
            append_selection(&mut batcher, &row, 0, &font, s.misc.selection_color);
            batcher.take_frame()
        };

        let a = build();
        let b = build();
        assert_eq!(a.instances, b.instances);
        assert_eq!(a.indices.bytes(), b.indices.bytes());
    }
}
