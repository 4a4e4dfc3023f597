//! Reference backend that runs every kernel on the host.
//!
//! Slow next to the GPU path but deterministic, so the test-suite and
//! headless runs drive the simulation through it.

use std::collections::HashMap;

use crate::device::{DeviceCapabilities, DisplayParams, FieldData, Pass, ShadingDevice};
use crate::error::{FluidError, FluidResult};
use crate::field::{FieldDesc, FieldHandle, FilterMode, GridField, Precision};
use crate::kernels::{self, Sampler, Stencil};

/// Round to the nearest binary16 value, keeping `f32` storage.
pub fn quantize_half(v: f32) -> f32 {
    if !v.is_finite() || v == 0.0 {
        return v;
    }
    let a = v.abs();
    if a >= 65520.0 {
        return f32::INFINITY.copysign(v);
    }
    if a < 6.103_515_6e-5 {
        // Subnormal range: fixed steps of 2^-24.
        const STEP: f32 = 5.960_464_5e-8;
        return (v / STEP).round() * STEP;
    }
    // Drop the 13 low mantissa bits, rounding half away from zero.
    f32::from_bits((v.to_bits() + 0x0000_1000) & !0x0000_1fff)
}

struct CpuTexture {
    desc: FieldDesc,
    data: Vec<f32>,
}

impl CpuTexture {
    fn fetch(&self, x: u32, y: u32) -> [f32; 4] {
        let channels = self.desc.layout.channels() as usize;
        let base = (y as usize * self.desc.width as usize + x as usize) * channels;
        let mut out = [0.0; 4];
        out[..channels].copy_from_slice(&self.data[base..base + channels]);
        out
    }

    fn store(&mut self, x: u32, y: u32, value: [f32; 4]) {
        let channels = self.desc.layout.channels() as usize;
        let base = (y as usize * self.desc.width as usize + x as usize) * channels;
        let half = self.desc.precision == Precision::Half;
        for (dst, &v) in self.data[base..base + channels].iter_mut().zip(value.iter()) {
            *dst = if half { quantize_half(v) } else { v };
        }
    }
}

impl Sampler for CpuTexture {
    fn sample(&self, uv: [f32; 2]) -> [f32; 4] {
        let (w, h) = (self.desc.width, self.desc.height);
        match self.desc.filter {
            FilterMode::Linear => kernels::sample_bilinear(w, h, uv, |x, y| self.fetch(x, y)),
            FilterMode::Nearest => kernels::sample_nearest(w, h, uv, |x, y| self.fetch(x, y)),
        }
    }
}

/// Last composed frame, rows bottom to top, premultiplied RGBA.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
}

impl Frame {
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[(y * self.width + x) as usize]
    }
}

pub struct CpuDevice {
    fields: HashMap<u64, CpuTexture>,
    next_id: u64,
    texel_limit: Option<usize>,
    linear_filtering: bool,
    passes_run: u64,
    frame: Option<Frame>,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            fields: HashMap::new(),
            next_id: 1,
            texel_limit: None,
            linear_filtering: true,
            passes_run: 0,
            frame: None,
        }
    }

    /// Refuse allocations once the live texel total would exceed `limit`.
    pub fn with_texel_limit(limit: usize) -> Self {
        Self { texel_limit: Some(limit), ..Self::new() }
    }

    pub fn without_linear_filtering(mut self) -> Self {
        self.linear_filtering = false;
        self
    }

    pub fn set_texel_limit(&mut self, limit: Option<usize>) {
        self.texel_limit = limit;
    }

    pub fn allocated_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn allocated_texels(&self) -> usize {
        self.fields.values().map(|t| t.desc.texel_count()).sum()
    }

    pub fn passes_run(&self) -> u64 {
        self.passes_run
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Overwrite a field's contents, e.g. to seed a test state.
    pub fn write_field(&mut self, field: &GridField, data: &[f32]) -> FluidResult<()> {
        let id = field.handle().raw();
        let texture = self.fields.get_mut(&id).ok_or(FluidError::UnknownField(id))?;
        if data.len() != texture.data.len() {
            return Err(FluidError::Allocation(format!(
                "expected {} values for field {}, got {}",
                texture.data.len(),
                id,
                data.len()
            )));
        }
        texture.data.copy_from_slice(data);
        Ok(())
    }

    fn texture(&self, field: &GridField) -> FluidResult<&CpuTexture> {
        let id = field.handle().raw();
        self.fields.get(&id).ok_or(FluidError::UnknownField(id))
    }

    fn execute(&self, pass: &Pass<'_>, target: &mut CpuTexture) -> FluidResult<()> {
        let texel = pass.texel_size();
        let (w, h) = (target.desc.width, target.desc.height);

        match *pass {
            Pass::Curl { velocity, .. } => {
                let velocity = self.texture(velocity)?;
                for_each_texel(target, |uv| {
                    [kernels::curl(velocity, &Stencil::new(uv, texel)), 0.0, 0.0, 1.0]
                });
            }
            Pass::Vorticity { velocity, curl, strength, dt, .. } => {
                let (velocity, curl) = (self.texture(velocity)?, self.texture(curl)?);
                for_each_texel(target, |uv| {
                    let v = kernels::vorticity(velocity, curl, &Stencil::new(uv, texel), strength, dt);
                    [v[0], v[1], 0.0, 1.0]
                });
            }
            Pass::Divergence { velocity, .. } => {
                let velocity = self.texture(velocity)?;
                for_each_texel(target, |uv| {
                    [kernels::divergence(velocity, &Stencil::new(uv, texel)), 0.0, 0.0, 1.0]
                });
            }
            Pass::Clear { source, value, .. } => {
                let source = self.texture(source)?;
                for_each_texel(target, |uv| kernels::clear(source, uv, value));
            }
            Pass::Pressure { pressure, divergence, .. } => {
                let (pressure, divergence) = (self.texture(pressure)?, self.texture(divergence)?);
                for_each_texel(target, |uv| {
                    [kernels::pressure(pressure, divergence, &Stencil::new(uv, texel)), 0.0, 0.0, 1.0]
                });
            }
            Pass::GradientSubtract { pressure, velocity, .. } => {
                let (pressure, velocity) = (self.texture(pressure)?, self.texture(velocity)?);
                for_each_texel(target, |uv| {
                    let v = kernels::gradient_subtract(pressure, velocity, &Stencil::new(uv, texel));
                    [v[0], v[1], 0.0, 1.0]
                });
            }
            Pass::Advection { velocity, source, dt, dissipation, .. } => {
                let (velocity, source) = (self.texture(velocity)?, self.texture(source)?);
                for_each_texel(target, |uv| kernels::advect(velocity, source, uv, texel, dt, dissipation));
            }
            Pass::Splat { source, point, value, radius, aspect_ratio, .. } => {
                let source = self.texture(source)?;
                for_each_texel(target, |uv| kernels::splat(source, uv, point, value, radius, aspect_ratio));
            }
        }

        log::trace!("cpu pass {} over {}x{}", pass.kernel().name(), w, h);
        Ok(())
    }
}

fn for_each_texel(target: &mut CpuTexture, kernel: impl Fn([f32; 2]) -> [f32; 4]) {
    let (w, h) = (target.desc.width, target.desc.height);
    for y in 0..h {
        for x in 0..w {
            let value = kernel(kernels::texel_center(x, y, w, h));
            target.store(x, y, value);
        }
    }
}

impl ShadingDevice for CpuDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { linear_filtering: self.linear_filtering }
    }

    fn allocate(&mut self, desc: &FieldDesc) -> FluidResult<FieldHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(FluidError::Allocation(format!(
                "zero-sized field {}x{}",
                desc.width, desc.height
            )));
        }
        if let Some(limit) = self.texel_limit {
            let requested = self.allocated_texels() + desc.texel_count();
            if requested > limit {
                return Err(FluidError::Allocation(format!(
                    "{}x{} field exceeds the {} texel budget",
                    desc.width, desc.height, limit
                )));
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.fields.insert(id, CpuTexture { desc: *desc, data: vec![0.0; desc.value_count()] });
        Ok(FieldHandle::new(id))
    }

    fn release(&mut self, handle: FieldHandle) {
        if self.fields.remove(&handle.raw()).is_none() {
            log::warn!("Released unknown field {}", handle.raw());
        }
    }

    fn run(&mut self, pass: &Pass<'_>) -> FluidResult<()> {
        if let Some(field) = pass.aliased_field() {
            return Err(FluidError::AliasedPass { pass: pass.kernel().name(), field });
        }

        // Detach the target so the sources can be borrowed alongside it.
        let target_id = pass.target().handle().raw();
        let mut target = self.fields.remove(&target_id).ok_or(FluidError::UnknownField(target_id))?;
        let result = self.execute(pass, &mut target);
        self.fields.insert(target_id, target);

        if result.is_ok() {
            self.passes_run += 1;
        }
        result
    }

    fn present(&mut self, dye: &GridField, display: &DisplayParams) -> FluidResult<()> {
        let texture = self.texture(dye)?;
        let surface = display.surface.sanitized();
        let texel = display.texel_size();
        let clear = display.clear_color();

        let mut pixels = Vec::with_capacity(surface.width as usize * surface.height as usize);
        for y in 0..surface.height {
            for x in 0..surface.width {
                let uv = kernels::texel_center(x, y, surface.width, surface.height);
                let color = kernels::display(texture, &Stencil::new(uv, texel), display.shading);
                pixels.push(kernels::composite(color, clear));
            }
        }

        self.frame = Some(Frame { width: surface.width, height: surface.height, pixels });
        Ok(())
    }

    fn read_field(&mut self, field: &GridField) -> FluidResult<FieldData> {
        let texture = self.texture(field)?;
        Ok(FieldData {
            width: texture.desc.width,
            height: texture.desc.height,
            channels: texture.desc.layout.channels(),
            data: texture.data.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Color;
    use crate::field::{allocate, ChannelLayout, SurfaceSize};

    fn desc(w: u32, h: u32, layout: ChannelLayout) -> FieldDesc {
        FieldDesc::new((w, h), layout, Precision::Full, FilterMode::Linear)
    }

    #[test]
    fn half_quantization_matches_binary16_steps() {
        assert_eq!(quantize_half(1.0), 1.0);
        assert_eq!(quantize_half(0.0), 0.0);
        assert_eq!(quantize_half(-2.5), -2.5);
        // 1 + 2^-10 is the next binary16 value after 1.
        assert_eq!(quantize_half(1.0 + 0.0004), 1.0);
        assert_eq!(quantize_half(1.0 + 0.0007), 1.0 + 1.0 / 1024.0);
        assert_eq!(quantize_half(1.0e6), f32::INFINITY);
        assert!(quantize_half(0.38) <= 0.38);
        assert!((quantize_half(0.38) - 0.38).abs() < 0.38 / 1024.0);
    }

    #[test]
    fn new_fields_are_zeroed() {
        let mut device = CpuDevice::new();
        let field = allocate(&mut device, desc(3, 2, ChannelLayout::Rgba)).unwrap();
        let data = device.read_field(&field).unwrap();
        assert_eq!(data.data, vec![0.0; 24]);
        assert_eq!((data.width, data.height, data.channels), (3, 2, 4));
    }

    #[test]
    fn aliased_pass_is_rejected() {
        let mut device = CpuDevice::new();
        let field = allocate(&mut device, desc(4, 4, ChannelLayout::R)).unwrap();
        let err = device.run(&Pass::Clear { source: &field, target: &field, value: 0.5 }).unwrap_err();
        assert!(matches!(err, FluidError::AliasedPass { pass: "clear", .. }));
        assert_eq!(device.passes_run(), 0);
    }

    #[test]
    fn clear_pass_scales_previous_pressure() {
        let mut device = CpuDevice::new();
        let d = FieldDesc::new((2, 2), ChannelLayout::R, Precision::Full, FilterMode::Nearest);
        let source = allocate(&mut device, d).unwrap();
        let target = allocate(&mut device, d).unwrap();
        device.write_field(&source, &[1.0, -2.0, 4.0, 8.0]).unwrap();
        device.run(&Pass::Clear { source: &source, target: &target, value: 0.1 }).unwrap();
        let out = device.read_field(&target).unwrap().data;
        let expected = [0.1, -0.2, 0.4, 0.8];
        for (o, e) in out.iter().zip(expected.iter()) {
            assert!((o - e).abs() < 1e-6);
        }
    }

    #[test]
    fn released_handles_are_forgotten() {
        let mut device = CpuDevice::new();
        let a = allocate(&mut device, desc(2, 2, ChannelLayout::R)).unwrap();
        let b = allocate(&mut device, desc(2, 2, ChannelLayout::R)).unwrap();
        let raw = a.handle().raw();
        a.release(&mut device);
        assert_eq!(device.allocated_fields(), 1);
        assert!(!device.fields.contains_key(&raw));
        assert!(device.write_field(&b, &[0.0; 3]).is_err());
        assert!(device.write_field(&b, &[0.0; 4]).is_ok());
    }

    #[test]
    fn present_composites_over_background() {
        let mut device = CpuDevice::new();
        let dye = allocate(&mut device, desc(2, 2, ChannelLayout::Rgba)).unwrap();
        let display = DisplayParams {
            surface: SurfaceSize::new(4, 4),
            shading: false,
            back_color: Color::new(1.0, 0.0, 0.0),
            transparent: false,
        };
        device.present(&dye, &display).unwrap();
        let frame = device.last_frame().unwrap();
        assert_eq!((frame.width, frame.height), (4, 4));
        assert_eq!(frame.pixel(1, 2), [1.0, 0.0, 0.0, 1.0]);

        let transparent = DisplayParams { transparent: true, ..display };
        device.present(&dye, &transparent).unwrap();
        assert_eq!(device.last_frame().unwrap().pixel(0, 0), [0.0; 4]);
    }
}
