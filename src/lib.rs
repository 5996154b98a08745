//! Incremental GPU text rendering for terminal-style cell grids.
//!
//! A shaping/layout stage produces a [`payload::RenderPayload`]: shaped
//! glyph rows, per-cell background colors, decorations, cursor, selection,
//! and generation-tagged settings. [`backend::probe`] picks a render
//! backend once at startup; every [`backend::RenderBackend::render`] call
//! re-reads the payload in full and draws one frame as a batch of instanced
//! quads over a rect-packed glyph atlas.
//!
//! Change detection is by generation counter only: producers bump the
//! counter of whatever settings block they mutate, and the renderer
//! rebuilds exactly the GPU resources that depend on it. Frame pacing,
//! partial-present damage tracking, and the paint-coalescing render thread
//! live in [`thread`] and [`gpu::presenter`].

pub mod backend;
pub mod color;
pub mod font;
pub mod gpu;
pub mod payload;
pub mod thread;

pub use backend::{RenderBackend, RenderError, probe};
pub use payload::RenderPayload;
pub use thread::{RenderLoop, RenderThread};
