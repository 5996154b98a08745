//! Quad accumulation and GPU buffer management for the instanced pipeline.
//!
//! Every drawable — background stripes, glyphs, grid lines, the cursor,
//! selection tint — is one [`QuadInstance`] appended in back-to-front paint
//! order. The vertex stage pulls instances from a storage buffer (quad id =
//! `vertex_index >> 2`), so a flush is a single indexed draw over the whole
//! frame regardless of how shading types interleave.
//!
//! [`QuadBatcher`] is the CPU accumulator; [`BatchBuffers`] owns the GPU
//! buffers and grows them exponentially so steady-state frames never
//! reallocate.

/// How the fragment stage interprets a quad. Values match the `switch` in
/// the shader module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShadingType {
    /// Samples the per-cell background color texture.
    Background = 0,
    /// Alpha-mask glyph modulated by the foreground color.
    TextGrayscale = 1,
    /// Per-channel coverage glyph, dual-source blended.
    TextClearType = 2,
    /// Atlas texels copied through unmodified (color emoji).
    Passthrough = 3,
    /// Passthrough with inverted destination, for cursors overlapping
    /// colored glyphs.
    PassthroughInvert = 4,
    /// Procedural dashed underline; no texture.
    DashedLine = 5,
    /// Untextured colored rectangle.
    SolidFill = 6,
}

/// One instanced quad. Layout mirrors the WGSL struct: two vec4s, two u32s,
/// padded to a 48-byte array stride.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadInstance {
    /// Target-pixel rect: x, y, w, h.
    pub pos: [f32; 4],
    /// Atlas texel rect: x, y, w, h. Unused by untextured shading types.
    pub tex: [f32; 4],
    /// Packed 0xAABBGGRR, premultiplied.
    pub color: u32,
    pub shading: ShadingType,
}

/// Bytes per instance in the storage buffer, including WGSL struct padding.
pub const QUAD_STRIDE: usize = 48;

impl QuadInstance {
    fn write(&self, out: &mut Vec<u8>) {
        for v in self.pos {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        for v in self.tex {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        out.extend_from_slice(&self.color.to_ne_bytes());
        out.extend_from_slice(&(self.shading as u32).to_ne_bytes());
        out.extend_from_slice(&[0u8; 8]);
    }
}

/// Index data for one flush, in whichever width the vertex count permits.
pub enum FrameIndices {
    U16(Vec<u8>),
    U32(Vec<u8>),
}

impl FrameIndices {
    pub fn format(&self) -> wgpu::IndexFormat {
        match self {
            Self::U16(_) => wgpu::IndexFormat::Uint16,
            Self::U32(_) => wgpu::IndexFormat::Uint32,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::U16(b) | Self::U32(b) => b,
        }
    }

    pub fn count(&self) -> u32 {
        let per = match self {
            Self::U16(_) => 2,
            Self::U32(_) => 4,
        };
        (self.bytes().len() / per) as u32
    }
}

/// One flush worth of serialized quads.
pub struct FrameBatch {
    pub instances: Vec<u8>,
    pub indices: FrameIndices,
    pub quad_count: usize,
}

/// Quads to pre-allocate; typical frames stay well under this, so the
/// accumulator never reallocates mid-frame.
const MIN_QUAD_CAPACITY: usize = 1024;

/// CPU-side quad accumulator, cleared by [`take_frame`](Self::take_frame).
pub struct QuadBatcher {
    quads: Vec<QuadInstance>,
}

impl Default for QuadBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl QuadBatcher {
    pub fn new() -> Self {
        Self {
            quads: Vec::with_capacity(MIN_QUAD_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.quads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }

    pub fn append(&mut self, quad: QuadInstance) {
        self.quads.push(quad);
    }

    /// Accumulated quads in paint order. The cursor pass scans these to
    /// find glyphs it overlaps.
    pub fn quads(&self) -> &[QuadInstance] {
        &self.quads
    }

    /// The most recently appended quad, for run coalescing: a caller that
    /// would append an identical quad adjacent to the last one widens it
    /// instead.
    pub fn last_quad(&mut self) -> Option<&mut QuadInstance> {
        self.quads.last_mut()
    }

    /// Discard accumulated quads without producing a batch. Used when the
    /// atlas resets mid-frame after the pending quads were already drawn.
    pub fn clear(&mut self) {
        self.quads.clear();
    }

    /// Serialize and drain the accumulated quads.
    ///
    /// Each quad k expands to vertices 4k..4k+3 and the index pattern
    /// `[4k, 4k+1, 4k+2, 4k+2, 4k+1, 4k+3]` (two triangles, consistent
    /// winding). 16-bit indices are used whenever the vertex id range fits.
    pub fn take_frame(&mut self) -> FrameBatch {
        let quad_count = self.quads.len();
        let mut instances = Vec::with_capacity(quad_count * QUAD_STRIDE);
        for quad in &self.quads {
            quad.write(&mut instances);
        }

        let indices = if quad_count * 4 <= usize::from(u16::MAX) + 1 {
            let mut bytes = Vec::with_capacity(quad_count * 6 * 2);
            for k in 0..quad_count {
                let v = (k * 4) as u16;
                for i in [v, v + 1, v + 2, v + 2, v + 1, v + 3] {
                    bytes.extend_from_slice(&i.to_ne_bytes());
                }
            }
            FrameIndices::U16(bytes)
        } else {
            let mut bytes = Vec::with_capacity(quad_count * 6 * 4);
            for k in 0..quad_count {
                let v = (k * 4) as u32;
                for i in [v, v + 1, v + 2, v + 2, v + 1, v + 3] {
                    bytes.extend_from_slice(&i.to_ne_bytes());
                }
            }
            FrameIndices::U32(bytes)
        };

        self.quads.clear();
        FrameBatch {
            instances,
            indices,
            quad_count,
        }
    }
}

/// GPU buffers backing a flush. Capacities only grow, by doubling from a
/// seed derived from the cell count, so the common frame reuses both
/// buffers via `write_buffer`.
pub struct BatchBuffers {
    instances: Option<wgpu::Buffer>,
    indices: Option<wgpu::Buffer>,
}

impl BatchBuffers {
    pub fn new() -> Self {
        Self {
            instances: None,
            indices: None,
        }
    }

    /// Upload a batch, reallocating either buffer only when it is too
    /// small. Returns the bound buffers; a reallocation of the instance
    /// buffer invalidates bind groups referencing it.
    pub fn upload(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        batch: &FrameBatch,
        cell_count: [u32; 2],
    ) -> (bool, &wgpu::Buffer, &wgpu::Buffer) {
        // Seed from a plausible quads-per-frame upper bound: backgrounds
        // plus one glyph per cell.
        let seed_quads = (cell_count[0] * cell_count[1]).saturating_mul(2).max(64) as usize;

        let (instances_grew, instances) = grow_buffer(
            device,
            queue,
            &mut self.instances,
            &batch.instances,
            seed_quads * QUAD_STRIDE,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            "quad_instances",
        );
        let (_, indices) = grow_buffer(
            device,
            queue,
            &mut self.indices,
            batch.indices.bytes(),
            seed_quads * 6 * 2,
            wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            "quad_indices",
        );
        (instances_grew, instances, indices)
    }
}

/// Write `data` into `slot`, doubling the allocation past `data.len()` when
/// the existing buffer is absent or too small. Returns whether a
/// reallocation happened, plus the live buffer.
fn grow_buffer<'a>(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    slot: &'a mut Option<wgpu::Buffer>,
    data: &[u8],
    seed: usize,
    usage: wgpu::BufferUsages,
    label: &str,
) -> (bool, &'a wgpu::Buffer) {
    let needed = data.len() as u64;
    let grow = match slot {
        Some(buf) => buf.size() < needed,
        None => true,
    };

    if grow {
        let mut size = (seed as u64).max(256);
        while size < needed {
            size *= 2;
        }
        *slot = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        }));
    }

    let buf = slot.get_or_insert_with(|| {
        // Populated above; get_or_insert_with only for the borrow.
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: 256,
            usage,
            mapped_at_creation: false,
        })
    });
    if !data.is_empty() {
        queue.write_buffer(buf, 0, data);
    }
    (grow, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(x: f32) -> QuadInstance {
        QuadInstance {
            pos: [x, 0.0, 8.0, 16.0],
            tex: [0.0; 4],
            color: 0xff00_00ff,
            shading: ShadingType::SolidFill,
        }
    }

    #[test]
    fn six_indices_and_four_vertices_per_quad() {
        let mut batcher = QuadBatcher::new();
        for i in 0..1000 {
            batcher.append(quad(i as f32));
        }
        let batch = batcher.take_frame();

        assert_eq!(batch.quad_count, 1000);
        assert_eq!(batch.instances.len(), 1000 * QUAD_STRIDE);
        assert_eq!(batch.indices.count(), 6000);

        // Spot-check the per-quad pattern for quad 2.
        let bytes = batch.indices.bytes();
        let at = |i: usize| u16::from_ne_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        assert_eq!(
            [at(12), at(13), at(14), at(15), at(16), at(17)],
            [8, 9, 10, 10, 9, 11]
        );
    }

    #[test]
    fn index_width_switches_past_u16_range() {
        let mut batcher = QuadBatcher::new();
        for _ in 0..16384 {
            batcher.append(quad(0.0));
        }
        // 4 * 16384 == 65536 vertex ids: 0..=65535 still fits in u16.
        assert_eq!(
            batcher.take_frame().indices.format(),
            wgpu::IndexFormat::Uint16
        );

        for _ in 0..16385 {
            batcher.append(quad(0.0));
        }
        assert_eq!(
            batcher.take_frame().indices.format(),
            wgpu::IndexFormat::Uint32
        );
    }

    #[test]
    fn batcher_seeds_its_capacity() {
        let mut batcher = QuadBatcher::new();
        assert!(batcher.quads.capacity() >= MIN_QUAD_CAPACITY);
        batcher.append(quad(0.0));
        let _ = batcher.take_frame();
        // Draining keeps the allocation.
        assert!(batcher.quads.capacity() >= MIN_QUAD_CAPACITY);
    }

    #[test]
    fn take_frame_drains_the_batcher() {
        let mut batcher = QuadBatcher::new();
        batcher.append(quad(0.0));
        batcher.append(quad(8.0));
        assert_eq!(batcher.len(), 2);

        let batch = batcher.take_frame();
        assert_eq!(batch.quad_count, 2);
        assert!(batcher.is_empty());
        assert_eq!(batcher.take_frame().quad_count, 0);
    }

    #[test]
    fn last_quad_supports_run_coalescing() {
        let mut batcher = QuadBatcher::new();
        batcher.append(quad(0.0));
        if let Some(last) = batcher.last_quad() {
            last.pos[2] += 8.0;
        }
        assert_eq!(batcher.last_quad().map(|q| q.pos[2]), Some(16.0));
        assert_eq!(batcher.len(), 1);
    }

    #[test]
    fn serialized_stride_matches_declared_layout() {
        let mut out = Vec::new();
        quad(3.0).write(&mut out);
        assert_eq!(out.len(), QUAD_STRIDE);
        // color sits right after the two vec4s.
        assert_eq!(
            u32::from_ne_bytes([out[32], out[33], out[34], out[35]]),
            0xff00_00ff
        );
    }
}
