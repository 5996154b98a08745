//! Surface lifecycle and presentation pacing.
//!
//! The surface is recreated when the target generation changes and
//! reconfigured when only the pixel size changes. Opaque targets use an
//! opaque composite mode, which lets the compositor skip blending and cuts
//! present latency; transparent targets use premultiplied alpha.
//!
//! Presentation is throttled by an armed one-shot wait: after each
//! submitted frame the render thread may block (bounded at 100ms) until the
//! GPU has drained the previous submission, keeping input-to-screen latency
//! at roughly one frame even when the compositor buffers more.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::RenderError;
use crate::gpu::state::GpuState;
use crate::payload::{CellRect, Generation, Settings};

const PRESENT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);
const PRESENT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Wait for a frame completion on `rx`, invoking `poll` between channel
/// checks so the completion callback can actually fire: `Queue` callbacks
/// run only while the device is maintained, so a wait that merely blocks on
/// the channel would sit out its whole timeout every frame.
fn wait_for_frame(rx: &mpsc::Receiver<()>, mut poll: impl FnMut(), timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        poll();
        match rx.recv_timeout(PRESENT_POLL_INTERVAL) {
            Ok(()) => return,
            Err(_) => {
                if Instant::now() >= deadline {
                    return;
                }
            }
        }
    }
}

/// Scroll metadata for a partial present: the compositor may shift the
/// previous frame's `rect` by `offset_y` pixels before applying the dirty
/// region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollRegion {
    /// Pixel rect (left, top, right, bottom) that scrolled.
    pub rect: [i32; 4],
    pub offset_y: i32,
}

/// What part of the target this frame actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentRegion {
    Full,
    Partial {
        /// Dirty pixel rect: left, top, right, bottom.
        dirty: [i32; 4],
        scroll: Option<ScrollRegion>,
    },
}

/// Convert the payload's cell-space damage into pixel space.
///
/// Returns `None` for an empty dirty rect: nothing changed, so no frame is
/// rendered or presented at all. A dirty rect covering the whole grid is a
/// full present; anything else scales cells to pixels, including the scroll
/// rect clamped to the rows that stay on screen.
pub fn present_region(
    dirty: CellRect,
    scroll_offset: i32,
    cell_size: [u16; 2],
    cell_count: [u32; 2],
) -> Option<PresentRegion> {
    if dirty.is_empty() {
        return None;
    }

    let full = dirty.left == 0
        && dirty.top == 0
        && u32::from(dirty.right) == cell_count[0]
        && u32::from(dirty.bottom) == cell_count[1];
    if full {
        return Some(PresentRegion::Full);
    }

    let (cw, ch) = (i32::from(cell_size[0]), i32::from(cell_size[1]));
    let dirty_px = [
        i32::from(dirty.left) * cw,
        i32::from(dirty.top) * ch,
        i32::from(dirty.right) * cw,
        i32::from(dirty.bottom) * ch,
    ];

    let scroll = (scroll_offset != 0).then(|| {
        let rect = [
            0,
            scroll_offset.max(0) * ch,
            cell_count[0] as i32 * cw,
            (cell_count[1] as i32 + scroll_offset.min(0)) * ch,
        ];
        ScrollRegion {
            rect,
            offset_y: scroll_offset * ch,
        }
    });

    Some(PresentRegion::Partial {
        dirty: dirty_px,
        scroll,
    })
}

/// Owns the wgpu surface for the current presentation target.
pub struct SurfacePresenter {
    surface: Option<wgpu::Surface<'static>>,
    format: wgpu::TextureFormat,
    target_generation: Option<Generation>,
    target_size: [u32; 2],
    opaque: bool,
    frame_done_tx: mpsc::Sender<()>,
    frame_done_rx: mpsc::Receiver<()>,
    /// Armed after a present; [`wait_until_can_render`](Self::wait_until_can_render)
    /// only blocks while armed, so repeated waits without an intervening
    /// frame return immediately.
    wait_armed: bool,
}

impl SurfacePresenter {
    pub fn new() -> Self {
        let (frame_done_tx, frame_done_rx) = mpsc::channel();
        Self {
            surface: None,
            format: wgpu::TextureFormat::Bgra8Unorm,
            target_generation: None,
            target_size: [0, 0],
            opaque: true,
            frame_done_tx,
            frame_done_rx,
            wait_armed: false,
        }
    }

    /// The configured surface format, for pipeline construction.
    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    /// Bring the surface in sync with the settings. Returns true when the
    /// surface was created or reconfigured, which invalidates size-derived
    /// GPU state held by the caller.
    pub fn ensure_target(
        &mut self,
        gpu: &GpuState,
        settings: &Settings,
    ) -> Result<bool, RenderError> {
        let window = settings.target.window.as_ref().ok_or(RenderError::NoTarget)?;

        let recreate = self.surface.is_none()
            || self.target_generation != Some(settings.target.generation)
            || self.opaque != settings.target.opaque;
        let reconfigure = recreate || self.target_size != settings.target_size;
        if !reconfigure {
            return Ok(false);
        }

        if recreate {
            let surface = gpu.instance.create_surface(Arc::clone(window))?;
            let caps = surface.get_capabilities(&gpu.adapter);

            // The shader works in linear premultiplied color on a non-sRGB
            // view, matching the atlas contents.
            self.format = caps
                .formats
                .iter()
                .copied()
                .find(|f| !f.is_srgb())
                .unwrap_or(caps.formats[0]);
            self.opaque = settings.target.opaque;
            self.surface = Some(surface);
            self.target_generation = Some(settings.target.generation);
        }

        let surface = match &self.surface {
            Some(s) => s,
            None => return Err(RenderError::SurfaceNotReady),
        };
        let caps = surface.get_capabilities(&gpu.adapter);
        let alpha_mode = if self.opaque {
            wgpu::CompositeAlphaMode::Opaque
        } else if caps
            .alpha_modes
            .contains(&wgpu::CompositeAlphaMode::PreMultiplied)
        {
            wgpu::CompositeAlphaMode::PreMultiplied
        } else {
            caps.alpha_modes[0]
        };

        surface.configure(
            &gpu.device,
            &wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format: self.format,
                width: settings.target_size[0].max(1),
                height: settings.target_size[1].max(1),
                present_mode: wgpu::PresentMode::Fifo,
                alpha_mode,
                view_formats: vec![],
                desired_maximum_frame_latency: 1,
            },
        );
        self.target_size = settings.target_size;
        log::debug!(
            "surface: configured {}x{} format={:?} alpha={alpha_mode:?}",
            settings.target_size[0],
            settings.target_size[1],
            self.format
        );
        Ok(true)
    }

    /// Acquire the next buffer to render into.
    pub fn acquire(&mut self) -> Result<wgpu::SurfaceTexture, RenderError> {
        let surface = self.surface.as_ref().ok_or(RenderError::SurfaceNotReady)?;
        Ok(surface.get_current_texture()?)
    }

    /// Present a finished frame and arm the next pacing wait.
    pub fn present(&mut self, queue: &wgpu::Queue, frame: wgpu::SurfaceTexture) {
        // Drain stale completions so the armed wait reflects this frame.
        while self.frame_done_rx.try_recv().is_ok() {}
        let tx = self.frame_done_tx.clone();
        queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        frame.present();
        self.wait_armed = true;
    }

    /// Block until the previously presented frame's work has drained, or
    /// 100ms, whichever comes first. `poll` must maintain the device (e.g.
    /// `Device::poll` with [`wgpu::PollType::Poll`]); it is called
    /// repeatedly while waiting. No-op unless a present armed the wait.
    pub fn wait_until_can_render(&mut self, poll: impl FnMut()) {
        if !self.wait_armed {
            return;
        }
        self.wait_armed = false;
        wait_for_frame(&self.frame_done_rx, poll, PRESENT_WAIT_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: [u16; 2] = [8, 16];
    const GRID: [u32; 2] = [80, 24];

    #[test]
    fn empty_dirty_rect_skips_the_frame() {
        let dirty = CellRect::new(3, 3, 3, 10);
        assert_eq!(present_region(dirty, 0, CELL, GRID), None);
    }

    #[test]
    fn full_grid_is_a_full_present() {
        let dirty = CellRect::new(0, 0, 80, 24);
        assert_eq!(present_region(dirty, -2, CELL, GRID), Some(PresentRegion::Full));
    }

    #[test]
    fn partial_present_scales_cells_to_pixels() {
        let dirty = CellRect::new(2, 1, 10, 4);
        assert_eq!(
            present_region(dirty, 0, CELL, GRID),
            Some(PresentRegion::Partial {
                dirty: [16, 16, 80, 64],
                scroll: None,
            })
        );
    }

    #[test]
    fn scroll_up_clamps_the_bottom_of_the_scroll_rect() {
        // Content moved up by 3 rows: the top 3 destination rows are fresh,
        // rows below come from the previous frame shifted by -3.
        let dirty = CellRect::new(0, 21, 80, 24);
        let region = present_region(dirty, -3, CELL, GRID);
        assert_eq!(
            region,
            Some(PresentRegion::Partial {
                dirty: [0, 336, 640, 384],
                scroll: Some(ScrollRegion {
                    rect: [0, 0, 640, (24 - 3) * 16],
                    offset_y: -48,
                }),
            })
        );
    }

    #[test]
    fn pacing_wait_returns_once_polling_surfaces_the_completion() {
        let (tx, rx) = mpsc::channel();
        let mut polls = 0;
        let start = Instant::now();
        wait_for_frame(
            &rx,
            || {
                polls += 1;
                if polls == 3 {
                    let _ = tx.send(());
                }
            },
            Duration::from_secs(5),
        );
        assert!(polls >= 3);
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "wait must end when the completion arrives, not at the timeout"
        );
    }

    #[test]
    fn pacing_wait_is_bounded_without_a_completion() {
        let (_tx, rx) = mpsc::channel::<()>();
        let start = Instant::now();
        wait_for_frame(&rx, || {}, Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn scroll_down_starts_below_the_incoming_rows() {
        let dirty = CellRect::new(0, 0, 80, 2);
        let region = present_region(dirty, 2, CELL, GRID);
        match region {
            Some(PresentRegion::Partial {
                scroll: Some(scroll),
                ..
            }) => {
                assert_eq!(scroll.rect, [0, 32, 640, 384]);
                assert_eq!(scroll.offset_y, 32);
            }
            other => panic!("unexpected region: {other:?}"),
        }
    }
}
