//! The render-backend contract and backend selection.
//!
//! Backends form a closed set behind one capability trait: callers probe
//! once at startup and hold a `Box<dyn RenderBackend>` for the lifetime of
//! the renderer. The GPU quad backend is the only variant this crate ships;
//! a pure vector-raster fallback would plug in behind the same trait.

use thiserror::Error;

use crate::gpu::{GpuState, WgpuBackend};
use crate::payload::RenderPayload;

/// Fatal renderer failures. Any of these aborts the current frame and is
/// expected to make the caller reinitialize the renderer; no partial frame
/// is ever presented after one.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no presentation target is attached to the payload")]
    NoTarget,
    #[error("render target was used before settings were applied")]
    SurfaceNotReady,
    #[error("no suitable GPU adapter found")]
    NoAdapter,
    #[error("failed to create GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("failed to create swap surface: {0}")]
    CreateSurface(#[from] wgpu::CreateSurfaceError),
    #[error("failed to acquire swap-surface buffer: {0}")]
    AcquireSurface(#[from] wgpu::SurfaceError),
}

/// Capability interface shared by all render backends.
pub trait RenderBackend {
    /// Render one frame from the payload and present it.
    ///
    /// The payload is re-read in full every call; the backend keeps only
    /// generation counters between frames.
    fn render(&mut self, payload: &RenderPayload) -> Result<(), RenderError>;

    /// Whether the backend needs a frame every vsync even without content
    /// changes (e.g. an animated custom shader).
    fn requires_continuous_redraw(&self) -> bool;

    /// Block until the presentation target can accept another frame.
    /// Bounded; a stalled target cannot hang the render thread.
    fn wait_until_can_render(&mut self);
}

/// Probe the machine and construct the best available backend.
///
/// Selection happens exactly once; there is no per-frame fallback chain.
pub fn probe(payload: &RenderPayload) -> Result<Box<dyn RenderBackend>, RenderError> {
    let window = payload
        .settings
        .target
        .window
        .as_ref()
        .ok_or(RenderError::NoTarget)?;
    let gpu = GpuState::new(window)?;
    log::info!("render backend: wgpu quad renderer");
    Ok(Box::new(WgpuBackend::new(gpu)))
}
