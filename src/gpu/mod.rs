//! wgpu backend: kernels as compute shaders over storage buffers, display as
//! a full-screen fragment pass into the window surface.

mod context;
mod device;
mod params;

pub use context::GpuContext;
pub use device::GpuDevice;
pub use params::{DisplayUniforms, FieldInfo, PassParams};
