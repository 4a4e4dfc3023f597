use bytemuck::{Pod, Zeroable};

use crate::device::{DisplayParams, Pass};
use crate::field::{FieldDesc, FilterMode, GridField};

/// Shape of one bound field as the shaders see it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct FieldInfo {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub linear: u32,
}

impl FieldInfo {
    pub fn of(desc: &FieldDesc) -> Self {
        Self {
            width: desc.width,
            height: desc.height,
            channels: desc.layout.channels(),
            linear: (desc.filter == FilterMode::Linear) as u32,
        }
    }
}

fn info(field: Option<&GridField>) -> FieldInfo {
    field.map(|f| FieldInfo::of(f.desc())).unwrap_or_default()
}

/// Uniforms of one kernel pass; `a` and `b` follow `Pass::sources` order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PassParams {
    pub dst: FieldInfo,
    pub a: FieldInfo,
    pub b: FieldInfo,
    pub texel_size: [f32; 2],
    pub dt: f32,
    pub scalar: f32, // vorticity strength, clear value, dissipation or splat radius
    pub point: [f32; 2],
    pub aspect_ratio: f32,
    pub _pad: f32,
    pub value: [f32; 4],
}

const _: [(); 96] = [(); std::mem::size_of::<PassParams>()];

impl PassParams {
    pub fn from_pass(pass: &Pass<'_>) -> Self {
        let [a, b] = pass.sources();
        let mut params = Self {
            dst: FieldInfo::of(pass.target().desc()),
            a: info(a),
            b: info(b),
            texel_size: pass.texel_size(),
            dt: 0.0,
            scalar: 0.0,
            point: [0.0; 2],
            aspect_ratio: 1.0,
            _pad: 0.0,
            value: [0.0; 4],
        };
        match *pass {
            Pass::Vorticity { strength, dt, .. } => {
                params.scalar = strength;
                params.dt = dt;
            }
            Pass::Clear { value, .. } => params.scalar = value,
            Pass::Advection { dt, dissipation, .. } => {
                params.dt = dt;
                params.scalar = dissipation;
            }
            Pass::Splat { point, value, radius, aspect_ratio, .. } => {
                params.point = point;
                params.value = [value[0], value[1], value[2], 1.0];
                params.scalar = radius;
                params.aspect_ratio = aspect_ratio;
            }
            Pass::Curl { .. } | Pass::Divergence { .. } | Pass::Pressure { .. } | Pass::GradientSubtract { .. } => {}
        }
        params
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DisplayUniforms {
    pub dye: FieldInfo,
    pub texel_size: [f32; 2],
    pub _pad: [f32; 2],
}

const _: [(); 32] = [(); std::mem::size_of::<DisplayUniforms>()];

impl DisplayUniforms {
    pub fn new(dye: &GridField, display: &DisplayParams) -> Self {
        Self { dye: FieldInfo::of(dye.desc()), texel_size: display.texel_size(), _pad: [0.0; 2] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;
    use crate::field::{allocate, ChannelLayout, Precision};

    #[test]
    fn splat_params_carry_point_and_color() {
        let mut device = CpuDevice::new();
        let desc = FieldDesc::new((8, 4), ChannelLayout::Rgba, Precision::Half, FilterMode::Linear);
        let source = allocate(&mut device, desc).unwrap();
        let target = allocate(&mut device, desc).unwrap();
        let params = PassParams::from_pass(&Pass::Splat {
            source: &source,
            target: &target,
            point: [0.25, 0.5],
            value: [0.0, 0.38, 1.0],
            radius: 0.001,
            aspect_ratio: 2.0,
        });
        assert_eq!(params.dst.width, 8);
        assert_eq!(params.a.channels, 4);
        assert_eq!(params.a.linear, 1);
        assert_eq!(params.b.width, 0);
        assert_eq!(params.value, [0.0, 0.38, 1.0, 1.0]);
        assert_eq!(params.scalar, 0.001);
        assert_eq!(params.texel_size, [0.125, 0.25]);
    }
}
