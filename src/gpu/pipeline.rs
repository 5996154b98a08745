//! The single instanced render pipeline and its WGSL shader.
//!
//! One pipeline draws every shading type; the fragment stage switches on
//! the per-quad [`ShadingType`](super::batcher::ShadingType) value. The
//! vertex stage pulls quads from a storage buffer by `vertex_index >> 2`,
//! so no vertex buffer is bound at all.
//!
//! Two blend variants exist: dual-source (per-channel ClearType weights via
//! a second fragment output) and a plain premultiplied-alpha fallback for
//! adapters without `DUAL_SOURCE_BLENDING`.

/// Uniform buffer size in bytes, padded to the WGSL struct layout.
pub const CONST_BUFFER_SIZE: u64 = 64;

/// Per-frame shader constants. Field order and padding mirror the WGSL
/// `Uniforms` struct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstBuffer {
    /// 2/width, -2/height: pixel coordinates to clip space (with a -1/+1
    /// bias applied in the shader).
    pub position_scale: [f32; 2],
    /// Cell size in pixels, for background texture addressing.
    pub cell_size: [f32; 2],
    pub cell_count: [f32; 2],
    pub grayscale_enhanced_contrast: f32,
    pub cleartype_enhanced_contrast: f32,
    pub gamma_ratios: [f32; 4],
    /// Dash period of dashed underlines, in pixels.
    pub dashed_line_length: f32,
}

impl ConstBuffer {
    pub fn as_bytes(&self) -> [u8; CONST_BUFFER_SIZE as usize] {
        let mut out = [0u8; CONST_BUFFER_SIZE as usize];
        let mut offset = 0;
        let mut push = |v: f32| {
            out[offset..offset + 4].copy_from_slice(&v.to_ne_bytes());
            offset += 4;
        };
        push(self.position_scale[0]);
        push(self.position_scale[1]);
        push(self.cell_size[0]);
        push(self.cell_size[1]);
        push(self.cell_count[0]);
        push(self.cell_count[1]);
        push(self.grayscale_enhanced_contrast);
        push(self.cleartype_enhanced_contrast);
        for v in self.gamma_ratios {
            push(v);
        }
        push(self.dashed_line_length);
        out
    }
}

// Shared shader body. The antialiasing helpers follow the DirectWrite
// blending model: light-on-dark contrast boost, contrast enhancement, and
// polynomial alpha correction driven by the gamma ratios.
const SHADER_BODY: &str = "
struct Uniforms {
    position_scale: vec2<f32>,
    cell_size: vec2<f32>,
    cell_count: vec2<f32>,
    grayscale_enhanced_contrast: f32,
    cleartype_enhanced_contrast: f32,
    gamma_ratios: vec4<f32>,
    dashed_line_length: f32,
}

struct Quad {
    // x, y, w, h in target pixels.
    position: vec4<f32>,
    // x, y, w, h in atlas texels.
    texcoord: vec4<f32>,
    // 0xAABBGGRR.
    color: u32,
    shading: u32,
    padding: vec2<u32>,
}

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(0) @binding(1) var<storage, read> quads: array<Quad>;
@group(0) @binding(2) var background: texture_2d<f32>;
@group(0) @binding(3) var glyph_atlas: texture_2d<f32>;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) @interpolate(flat) color: vec4<f32>,
    @location(1) @interpolate(flat) shading: u32,
    @location(2) texcoord: vec2<f32>,
}

fn unpack_color(c: u32) -> vec4<f32> {
    return vec4<f32>(
        f32(c & 0xffu),
        f32((c >> 8u) & 0xffu),
        f32((c >> 16u) & 0xffu),
        f32((c >> 24u) & 0xffu),
    ) / 255.0;
}

@vertex
fn vs_main(@builtin(vertex_index) vi: u32) -> VsOut {
    let quad = quads[vi >> 2u];
    let corner = vec2<f32>(f32(vi & 1u), f32((vi >> 1u) & 1u));
    let pixel_pos = quad.position.xy + quad.position.zw * corner;

    var out: VsOut;
    out.position = vec4<f32>(pixel_pos * uniforms.position_scale + vec2<f32>(-1.0, 1.0), 0.0, 1.0);
    out.color = unpack_color(quad.color);
    out.shading = quad.shading;
    out.texcoord = quad.texcoord.xy + quad.texcoord.zw * corner;
    return out;
}

fn premultiply(c: vec4<f32>) -> vec4<f32> {
    return vec4<f32>(c.rgb * c.a, c.a);
}

fn light_on_dark_contrast(enhanced_contrast: f32, color: vec3<f32>) -> f32 {
    let luminance = dot(vec3<f32>(0.30, 0.59, 0.11), color);
    let multiplier = saturate(4.0 * (0.75 - luminance));
    return enhanced_contrast * multiplier;
}

fn color_intensity(color: vec3<f32>) -> f32 {
    return dot(color, vec3<f32>(0.25, 0.5, 0.25));
}

fn enhance_contrast(alpha: f32, k: f32) -> f32 {
    return alpha * (k + 1.0) / (alpha * k + 1.0);
}

fn enhance_contrast3(alpha: vec3<f32>, k: f32) -> vec3<f32> {
    return alpha * (k + 1.0) / (alpha * k + 1.0);
}

fn apply_alpha_correction(a: f32, f: f32, g: vec4<f32>) -> f32 {
    return a + a * (1.0 - a) * ((g.x * f + g.y) * a + (g.z * f + g.w));
}

fn apply_alpha_correction3(a: vec3<f32>, f: f32, g: vec4<f32>) -> vec3<f32> {
    return a + a * (1.0 - a) * ((g.x * f + g.y) * a + (g.z * f + g.w));
}

// Mirror an out-of-range cell index back into [0, n): ..., 1, 0, 0, 1, ...
// n-2, n-1, n-1, n-2, ... so pixels past the grid repeat the edge cells
// reflected instead of smearing the last row/column.
fn mirror_cell(i: vec2<i32>, n: vec2<i32>) -> vec2<i32> {
    let period = 2 * n;
    let m = ((i % period) + period) % period;
    return select(m, period - 1 - m, m >= n);
}

struct ShadeResult {
    color: vec4<f32>,
    weights: vec4<f32>,
}

fn shade(in: VsOut) -> ShadeResult {
    var color: vec4<f32>;
    var weights: vec4<f32>;

    switch in.shading {
        // Background: one texel per cell, mirrored at the grid edges.
        case 0u: {
            let cell = vec2<i32>(in.position.xy / uniforms.cell_size);
            let count = max(vec2<i32>(uniforms.cell_count), vec2<i32>(1));
            color = textureLoad(background, mirror_cell(cell, count), 0);
            weights = vec4<f32>(color.a);
        }
        // Grayscale text: coverage in the alpha channel.
        case 1u: {
            let glyph = textureLoad(glyph_atlas, vec2<i32>(in.texcoord), 0);
            let foreground = premultiply(in.color);
            let contrast = light_on_dark_contrast(uniforms.grayscale_enhanced_contrast, in.color.rgb);
            let intensity = color_intensity(in.color.rgb);
            var a = enhance_contrast(glyph.a, contrast);
            a = apply_alpha_correction(a, intensity, uniforms.gamma_ratios);
            color = a * foreground;
            weights = vec4<f32>(color.a);
        }
        // ClearType text: per-channel coverage in rgb.
        case 2u: {
            let glyph = textureLoad(glyph_atlas, vec2<i32>(in.texcoord), 0);
            let contrast = light_on_dark_contrast(uniforms.cleartype_enhanced_contrast, in.color.rgb);
            let intensity = color_intensity(in.color.rgb);
            var a = enhance_contrast3(glyph.rgb, contrast);
            a = apply_alpha_correction3(a, intensity, uniforms.gamma_ratios);
            weights = vec4<f32>(a * in.color.a, 1.0);
            color = weights * vec4<f32>(in.color.rgb, 1.0);
        }
        // Passthrough: premultiplied atlas texels (color glyphs).
        case 3u: {
            color = textureLoad(glyph_atlas, vec2<i32>(in.texcoord), 0);
            weights = vec4<f32>(color.a);
        }
        // Passthrough with the covered pixels inverted, for cursor overlap.
        case 4u: {
            let glyph = textureLoad(glyph_atlas, vec2<i32>(in.texcoord), 0);
            color = vec4<f32>(vec3<f32>(glyph.a) - glyph.rgb, glyph.a);
            weights = vec4<f32>(color.a);
        }
        // Dashed line: 2-on-1-off duty cycle along x.
        case 5u: {
            let on = fract(in.position.x / uniforms.dashed_line_length) < 0.666666687;
            color = select(vec4<f32>(0.0), premultiply(in.color), on);
            weights = vec4<f32>(color.a);
        }
        // Solid fill.
        default: {
            color = premultiply(in.color);
            weights = vec4<f32>(color.a);
        }
    }

    return ShadeResult(color, weights);
}
";

const FS_DUAL_SOURCE: &str = "
struct FsOutput {
    @location(0) @blend_src(0) color: vec4<f32>,
    @location(0) @blend_src(1) weights: vec4<f32>,
}

@fragment
fn fs_main(in: VsOut) -> FsOutput {
    let r = shade(in);
    return FsOutput(r.color, r.weights);
}
";

const FS_SINGLE_SOURCE: &str = "
@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    return shade(in).color;
}
";

fn shader_source(dual_source: bool) -> String {
    if dual_source {
        format!("enable dual_source_blending;\n{SHADER_BODY}{FS_DUAL_SOURCE}")
    } else {
        format!("{SHADER_BODY}{FS_SINGLE_SOURCE}")
    }
}

pub fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("quad_bind_group_layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(CONST_BUFFER_SIZE),
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            texture_entry(2),
            texture_entry(3),
        ],
    })
}

/// Bind group tying one frame's resources together. Rebuilt whenever the
/// instance buffer, background texture, or atlas texture is recreated.
pub fn create_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    uniforms: &wgpu::Buffer,
    quads: &wgpu::Buffer,
    background: &wgpu::TextureView,
    atlas: &wgpu::TextureView,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("quad_bind_group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: quads.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::TextureView(background),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: wgpu::BindingResource::TextureView(atlas),
            },
        ],
    })
}

/// Build the quad pipeline for the given surface format.
///
/// With dual-source blending the destination factor reads the second
/// fragment output, giving per-channel text blending; without it the
/// pipeline falls back to premultiplied alpha and the frame assembler only
/// emits grayscale text.
pub fn create_quad_pipeline(
    device: &wgpu::Device,
    format: wgpu::TextureFormat,
    bind_group_layout: &wgpu::BindGroupLayout,
    dual_source: bool,
) -> wgpu::RenderPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("quad_shader"),
        source: wgpu::ShaderSource::Wgsl(shader_source(dual_source).into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("quad_pipeline_layout"),
        bind_group_layouts: &[bind_group_layout],
        immediate_size: 0,
    });

    let dst_factor = if dual_source {
        wgpu::BlendFactor::OneMinusSrc1
    } else {
        wgpu::BlendFactor::OneMinusSrcAlpha
    };
    let blend_component = wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor,
        operation: wgpu::BlendOperation::Add,
    };

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("quad_pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState {
                    color: blend_component,
                    alpha: blend_component,
                }),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_buffer_layout_matches_wgsl() {
        let cb = ConstBuffer {
            position_scale: [0.5, -0.5],
            cell_size: [8.0, 16.0],
            cell_count: [80.0, 24.0],
            grayscale_enhanced_contrast: 1.0,
            cleartype_enhanced_contrast: 0.5,
            gamma_ratios: [0.1, 0.2, 0.3, 0.4],
            dashed_line_length: 6.0,
        };
        let bytes = cb.as_bytes();
        assert_eq!(bytes.len() as u64, CONST_BUFFER_SIZE);

        let at = |i: usize| f32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        // gamma_ratios is vec4-aligned at offset 32.
        assert_eq!(at(32), 0.1);
        assert_eq!(at(48), 6.0);
        // Trailing pad is zeroed.
        assert_eq!(at(52), 0.0);
    }

    #[test]
    fn background_sampling_mirrors_at_edges() {
        assert!(SHADER_BODY.contains("fn mirror_cell"));
        assert!(SHADER_BODY.contains("textureLoad(background, mirror_cell(cell, count), 0)"));
        // No clamp-to-edge smear left in the background case.
        assert!(!SHADER_BODY.contains("clamp(cell"));
    }

    #[test]
    fn shader_variants_differ_only_in_fragment_stage() {
        let dual = shader_source(true);
        let single = shader_source(false);
        assert!(dual.starts_with("enable dual_source_blending;"));
        assert!(dual.contains("@blend_src(1)"));
        assert!(!single.contains("@blend_src"));
        assert!(dual.contains("fn vs_main") && single.contains("fn vs_main"));
    }
}
