//! The programmable shading device the simulation runs on.
//!
//! A device allocates grid storage, runs one kernel [`Pass`] at a time against
//! bound input fields and a distinct target, and presents the dye field.

use crate::config::Color;
use crate::error::FluidResult;
use crate::field::{FieldDesc, FieldHandle, GridField, SurfaceSize};
use crate::kernels::{self, Sampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub linear_filtering: bool,
}

/// Kernel programs, one per stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Curl,
    Vorticity,
    Divergence,
    Clear,
    Pressure,
    GradientSubtract,
    Advection,
    Splat,
}

impl Kernel {
    pub const ALL: [Kernel; 8] = [
        Kernel::Curl,
        Kernel::Vorticity,
        Kernel::Divergence,
        Kernel::Clear,
        Kernel::Pressure,
        Kernel::GradientSubtract,
        Kernel::Advection,
        Kernel::Splat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Kernel::Curl => "curl",
            Kernel::Vorticity => "vorticity",
            Kernel::Divergence => "divergence",
            Kernel::Clear => "clear",
            Kernel::Pressure => "pressure",
            Kernel::GradientSubtract => "gradient_subtract",
            Kernel::Advection => "advection",
            Kernel::Splat => "splat",
        }
    }
}

/// One kernel invocation: bound inputs, the render target and its uniforms.
#[derive(Debug, Clone, Copy)]
pub enum Pass<'a> {
    Curl {
        velocity: &'a GridField,
        target: &'a GridField,
    },
    Vorticity {
        velocity: &'a GridField,
        curl: &'a GridField,
        target: &'a GridField,
        strength: f32,
        dt: f32,
    },
    Divergence {
        velocity: &'a GridField,
        target: &'a GridField,
    },
    Clear {
        source: &'a GridField,
        target: &'a GridField,
        value: f32,
    },
    Pressure {
        pressure: &'a GridField,
        divergence: &'a GridField,
        target: &'a GridField,
    },
    GradientSubtract {
        pressure: &'a GridField,
        velocity: &'a GridField,
        target: &'a GridField,
    },
    Advection {
        velocity: &'a GridField,
        source: &'a GridField,
        target: &'a GridField,
        dt: f32,
        dissipation: f32,
    },
    Splat {
        source: &'a GridField,
        target: &'a GridField,
        point: [f32; 2],
        value: [f32; 3],
        radius: f32,
        aspect_ratio: f32,
    },
}

impl<'a> Pass<'a> {
    pub fn kernel(&self) -> Kernel {
        match self {
            Pass::Curl { .. } => Kernel::Curl,
            Pass::Vorticity { .. } => Kernel::Vorticity,
            Pass::Divergence { .. } => Kernel::Divergence,
            Pass::Clear { .. } => Kernel::Clear,
            Pass::Pressure { .. } => Kernel::Pressure,
            Pass::GradientSubtract { .. } => Kernel::GradientSubtract,
            Pass::Advection { .. } => Kernel::Advection,
            Pass::Splat { .. } => Kernel::Splat,
        }
    }

    pub fn target(&self) -> &'a GridField {
        match *self {
            Pass::Curl { target, .. }
            | Pass::Vorticity { target, .. }
            | Pass::Divergence { target, .. }
            | Pass::Clear { target, .. }
            | Pass::Pressure { target, .. }
            | Pass::GradientSubtract { target, .. }
            | Pass::Advection { target, .. }
            | Pass::Splat { target, .. } => target,
        }
    }

    /// Bound inputs in binding order.
    pub fn sources(&self) -> [Option<&'a GridField>; 2] {
        match *self {
            Pass::Curl { velocity, .. } | Pass::Divergence { velocity, .. } => [Some(velocity), None],
            Pass::Vorticity { velocity, curl, .. } => [Some(velocity), Some(curl)],
            Pass::Clear { source, .. } | Pass::Splat { source, .. } => [Some(source), None],
            Pass::Pressure { pressure, divergence, .. } => [Some(pressure), Some(divergence)],
            Pass::GradientSubtract { pressure, velocity, .. } => [Some(pressure), Some(velocity)],
            Pass::Advection { velocity, source, .. } => [Some(velocity), Some(source)],
        }
    }

    /// Neighbor spacing of the stencil, in normalized coordinates. Stencils
    /// always step in simulation-grid texels, even when the target is the
    /// finer dye grid.
    pub fn texel_size(&self) -> [f32; 2] {
        match *self {
            Pass::Curl { velocity, .. }
            | Pass::Vorticity { velocity, .. }
            | Pass::Divergence { velocity, .. }
            | Pass::Advection { velocity, .. } => velocity.texel_size(),
            Pass::Pressure { pressure, .. } | Pass::GradientSubtract { pressure, .. } => pressure.texel_size(),
            Pass::Clear { target, .. } | Pass::Splat { target, .. } => target.texel_size(),
        }
    }

    /// The handle shared between an input and the target, if any.
    pub fn aliased_field(&self) -> Option<u64> {
        let target = self.target().handle().raw();
        self.sources()
            .into_iter()
            .flatten()
            .any(|s| s.handle().raw() == target)
            .then_some(target)
    }
}

/// Uniforms of the display composition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayParams {
    pub surface: SurfaceSize,
    pub shading: bool,
    pub back_color: Color,
    pub transparent: bool,
}

impl DisplayParams {
    pub fn texel_size(&self) -> [f32; 2] {
        let s = self.surface.sanitized();
        [1.0 / s.width as f32, 1.0 / s.height as f32]
    }

    /// Premultiplied color the surface is cleared to before blending.
    pub fn clear_color(&self) -> [f32; 4] {
        if self.transparent {
            [0.0; 4]
        } else {
            let c = self.back_color;
            [c.r, c.g, c.b, 1.0]
        }
    }
}

/// Host copy of a field, rows bottom to top.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldData {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<f32>,
}

impl FieldData {
    pub fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let channels = self.channels as usize;
        let base = (y as usize * self.width as usize + x as usize) * channels;
        let mut out = [0.0; 4];
        out[..channels].copy_from_slice(&self.data[base..base + channels]);
        out
    }
}

impl Sampler for FieldData {
    fn sample(&self, uv: [f32; 2]) -> [f32; 4] {
        kernels::sample_bilinear(self.width, self.height, uv, |x, y| self.texel(x, y))
    }
}

pub trait ShadingDevice {
    fn capabilities(&self) -> DeviceCapabilities;

    /// Reserve zero-initialized storage for a field.
    fn allocate(&mut self, desc: &FieldDesc) -> FluidResult<FieldHandle>;

    fn release(&mut self, handle: FieldHandle);

    /// Execute one kernel over every texel of the pass target.
    fn run(&mut self, pass: &Pass<'_>) -> FluidResult<()>;

    /// Compose the dye field onto the visible surface.
    fn present(&mut self, dye: &GridField, display: &DisplayParams) -> FluidResult<()>;

    fn read_field(&mut self, field: &GridField) -> FluidResult<FieldData>;

    fn resize_surface(&mut self, _size: SurfaceSize) {}
}
