//! Real-time stable-fluids dye simulation driven by pointer input.
//!
//! [`FluidSim`] owns the fields and runs the solver on any [`ShadingDevice`]:
//! [`gpu::GpuDevice`] for the window, [`CpuDevice`] for tests and headless
//! runs.

pub mod capture;
pub mod config;
pub mod cpu;
pub mod device;
pub mod error;
pub mod field;
pub mod frame;
pub mod gpu;
pub mod input;
pub mod kernels;
pub mod sim;
pub mod variant;

pub use config::{Color, FluidConfig};
pub use cpu::CpuDevice;
pub use device::{DisplayParams, FieldData, Pass, ShadingDevice};
pub use error::{FluidError, FluidResult};
pub use field::SurfaceSize;
pub use frame::{FrameLoop, MAX_FRAME_DT};
pub use input::{InputMapper, MOUSE_POINTER_ID};
pub use sim::{FluidSim, TickOutcome};
