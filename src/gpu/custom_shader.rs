//! User-supplied post-processing shaders and the built-in retro effect.
//!
//! The frame is rendered into an offscreen texture and a second fullscreen
//! pass runs the custom fragment stage over it. User WGSL is appended to a
//! fixed prelude that declares the uniform block, the frame texture, and
//! the fullscreen-triangle vertex stage; the file must define `fs_main`.
//!
//! Compilation failures never take the renderer down: the pass is disabled,
//! the error is logged, and the payload's warning callback fires so the
//! host can tell the user. Edits to the shader file are picked up via a
//! filesystem watch and recompiled on the next frame.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use notify::{RecursiveMode, Watcher};

use crate::payload::{MiscSettings, RenderWarning, WarningCallback};

/// Prelude prepended to every custom shader. `fs_main` comes from the user.
const SHADER_PRELUDE: &str = "
struct ShaderInput {
    time: f32,
    scale: f32,
    resolution: vec2<f32>,
    background: vec4<f32>,
}

@group(0) @binding(0) var<uniform> shader_input: ShaderInput;
@group(0) @binding(1) var frame: texture_2d<f32>;
@group(0) @binding(2) var frame_sampler: sampler;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) vi: u32) -> VsOut {
    let uv = vec2<f32>(f32((vi << 1u) & 2u), f32(vi & 2u));
    var out: VsOut;
    out.position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(uv.x, 1.0 - uv.y);
    return out;
}
";

/// Scanlines plus a slight phosphor tint and vignette. Time-independent.
const RETRO_SHADER: &str = "
@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    var color = textureSample(frame, frame_sampler, in.uv);

    let scanline = 0.85 + 0.15 * cos(in.position.y * 3.14159);
    color = vec4<f32>(color.rgb * scanline, color.a);

    // Phosphor green tint.
    color = vec4<f32>(color.r * 0.75, color.g, color.b * 0.75, color.a);

    let center = in.uv - vec2<f32>(0.5);
    let vignette = 1.0 - 0.35 * dot(center, center);
    return vec4<f32>(color.rgb * vignette, color.a);
}
";

/// Bytes of the WGSL `ShaderInput` uniform.
const SHADER_INPUT_SIZE: u64 = 32;

/// Watches the custom shader file and flags edits for recompilation.
struct ShaderWatcher {
    invalidated: Arc<AtomicBool>,
    // Dropping the watcher stops the notification stream.
    _watcher: notify::RecommendedWatcher,
}

impl ShaderWatcher {
    fn new(path: &Path) -> Option<Self> {
        let parent = path.parent()?.to_path_buf();
        let file = path.to_path_buf();
        let invalidated = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&invalidated);
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if event.paths.iter().any(|p| p == &file) {
                        flag.store(true, Ordering::Relaxed);
                    }
                }
            })
            .map_err(|e| log::warn!("custom shader: failed to create watcher: {e}"))
            .ok()?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| log::warn!("custom shader: failed to watch {}: {e}", parent.display()))
            .ok()?;

        log::debug!("custom shader: watching {}", path.display());
        Some(Self {
            invalidated,
            _watcher: watcher,
        })
    }
}

/// The fullscreen post-processing pass, present only while a custom shader
/// or the retro effect is active and compiled successfully.
pub struct CustomShaderPass {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniforms: wgpu::Buffer,
    offscreen: Option<(wgpu::Texture, wgpu::TextureView)>,
    offscreen_size: [u32; 2],
    bind_group: Option<wgpu::BindGroup>,
    start: Instant,
    requires_continuous_redraw: bool,
    watcher: Option<ShaderWatcher>,
}

impl CustomShaderPass {
    /// Build the pass for the current settings. Returns `None` when no
    /// effect is configured, or when the user shader fails to compile (the
    /// warning callback fires in that case).
    pub fn refresh(
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        misc: &MiscSettings,
        warning_callback: Option<&WarningCallback>,
    ) -> Option<Self> {
        let (body, requires_continuous_redraw, watcher) = match &misc.custom_shader_path {
            Some(path) => {
                let body = match std::fs::read_to_string(path) {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("custom shader: cannot read {}: {e}", path.display());
                        if let Some(cb) = warning_callback {
                            cb(RenderWarning::CustomShaderCompileFailed);
                        }
                        return None;
                    }
                };
                // Without reflection, assume per-frame evaluation unless the
                // source never touches the time uniform.
                let animated = body.contains("shader_input.time");
                (body, animated, ShaderWatcher::new(path))
            }
            None if misc.retro_terminal_effect => (RETRO_SHADER.to_string(), false, None),
            None => return None,
        };

        let source = format!("{SHADER_PRELUDE}{body}");

        // An error scope turns a malformed user shader into a recoverable
        // warning instead of a device loss.
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("custom_shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(error) = pollster::block_on(scope.pop()) {
            log::warn!("custom shader: compilation failed: {error}");
            if let Some(cb) = warning_callback {
                cb(RenderWarning::CustomShaderCompileFailed);
            }
            return None;
        }

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("custom_shader_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(SHADER_INPUT_SIZE),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("custom_shader_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("custom_shader_pipeline"),
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
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });
        if let Some(error) = pollster::block_on(scope.pop()) {
            // A missing or ill-typed fs_main surfaces here.
            log::warn!("custom shader: pipeline creation failed: {error}");
            if let Some(cb) = warning_callback {
                cb(RenderWarning::CustomShaderCompileFailed);
            }
            return None;
        }

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("custom_shader_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("custom_shader_uniforms"),
            size: SHADER_INPUT_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Some(Self {
            pipeline,
            bind_group_layout,
            sampler,
            uniforms,
            offscreen: None,
            offscreen_size: [0, 0],
            bind_group: None,
            start: Instant::now(),
            requires_continuous_redraw,
            watcher,
        })
    }

    pub fn requires_continuous_redraw(&self) -> bool {
        self.requires_continuous_redraw
    }

    /// Whether the shader file changed on disk since the last call.
    pub fn take_invalidation(&self) -> bool {
        self.watcher
            .as_ref()
            .is_some_and(|w| w.invalidated.swap(false, Ordering::Relaxed))
    }

    /// The offscreen view the main frame renders into, (re)created at the
    /// current target size.
    pub fn offscreen_view(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        target_size: [u32; 2],
    ) -> &wgpu::TextureView {
        if self.offscreen_size != target_size {
            self.offscreen = None;
            self.bind_group = None;
            self.offscreen_size = target_size;
        }
        let (_, view) = self.offscreen.get_or_insert_with(|| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some("custom_shader_offscreen"),
                size: wgpu::Extent3d {
                    width: target_size[0].max(1),
                    height: target_size[1].max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            (texture, view)
        });
        view
    }

    /// Record the fullscreen pass from the offscreen texture to the target.
    pub fn record(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        scale: f32,
        background: [f32; 4],
    ) {
        let Some((_, offscreen_view)) = &self.offscreen else {
            return;
        };

        let mut bytes = [0u8; SHADER_INPUT_SIZE as usize];
        let fields = [
            self.start.elapsed().as_secs_f32(),
            scale,
            self.offscreen_size[0] as f32,
            self.offscreen_size[1] as f32,
            background[0],
            background[1],
            background[2],
            background[3],
        ];
        for (i, v) in fields.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        queue.write_buffer(&self.uniforms, 0, &bytes);

        if self.bind_group.is_none() {
            self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("custom_shader_bind_group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.uniforms.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(offscreen_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            }));
        }

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("custom_shader_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        pass.set_pipeline(&self.pipeline);
        if let Some(bind_group) = &self.bind_group {
            pass.set_bind_group(0, bind_group, &[]);
        }
        pass.draw(0..3, 0..1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retro_shader_uses_the_prelude_contract() {
        let source = format!("{SHADER_PRELUDE}{RETRO_SHADER}");
        assert!(source.contains("fn vs_main"));
        assert!(source.contains("fn fs_main"));
        // The built-in effect is static; nothing should read the clock.
        assert!(!RETRO_SHADER.contains("shader_input.time"));
    }

    #[test]
    fn time_detection_drives_continuous_redraw() {
        let animated = "let t = shader_input.time;";
        let stills = "let r = shader_input.resolution;";
        assert!(animated.contains("shader_input.time"));
        assert!(!stills.contains("shader_input.time"));
    }
}
