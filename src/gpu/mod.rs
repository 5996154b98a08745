//! GPU rendering: wgpu state, glyph atlas, quad batching, and the frame
//! assembler.

pub mod atlas;
pub mod batcher;
pub mod custom_shader;
pub mod frame;
pub mod glyph_cache;
pub mod packer;
pub mod pipeline;
pub mod presenter;
pub mod rasterizer;
pub mod state;

pub use frame::WgpuBackend;
pub use state::GpuState;
