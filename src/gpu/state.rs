//! GPU device bring-up shared by every surface and pipeline.

use std::sync::Arc;

use winit::window::Window;

use crate::backend::RenderError;

/// Instance, adapter, device, and queue — created once, owned by the render
/// thread, never shared.
pub struct GpuState {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Whether the device supports dual-source blending, required for the
    /// ClearType shading path. Without it the frame assembler falls back to
    /// grayscale antialiasing.
    pub dual_source_blending: bool,
}

impl GpuState {
    /// Initialize the GPU. The window is only used to pick a compatible
    /// adapter; surfaces are created later by the presenter.
    pub fn new(window: &Arc<Window>) -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        let surface = instance.create_surface(window.clone())?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .map_err(|_| RenderError::NoAdapter)?;

        let dual_source_blending = adapter
            .features()
            .contains(wgpu::Features::DUAL_SOURCE_BLENDING);
        let required_features = if dual_source_blending {
            wgpu::Features::DUAL_SOURCE_BLENDING
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("quadgrid"),
            required_features,
            required_limits: wgpu::Limits::default(),
            ..Default::default()
        }))?;

        log::info!(
            "GPU init: adapter={}, dual_source_blending={dual_source_blending}",
            adapter.get_info().name,
        );

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            dual_source_blending,
        })
    }
}
