//! Field storage: grid descriptors, opaque device handles and the
//! double-buffered fields the simulation ping-pongs between.
//!
//! Handles are created only by a [`ShadingDevice`] inside [`allocate`] and
//! given back only through [`GridField::release`]; they are neither `Clone`
//! nor `Copy`, so every field has exactly one owner.

use crate::config::FluidConfig;
use crate::device::ShadingDevice;
use crate::error::FluidResult;

/// Renderable surface size in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Zero-sized surfaces (minimized windows) are treated as 1x1.
    pub fn sanitized(self) -> Self {
        Self::new(self.width.max(1), self.height.max(1))
    }

    pub fn aspect_ratio(&self) -> f32 {
        let s = self.sanitized();
        s.width as f32 / s.height as f32
    }
}

/// Grid dimensions for a target resolution on a surface: the shorter axis gets
/// `round(resolution)` cells, the longer one `round(resolution * aspect)`.
pub fn resolution(target: f32, surface: SurfaceSize) -> (u32, u32) {
    let surface = surface.sanitized();
    let mut aspect = surface.aspect_ratio();
    if aspect < 1.0 {
        aspect = 1.0 / aspect;
    }
    let min = (target.round() as u32).max(1);
    let max = ((target * aspect).round() as u32).max(1);
    if surface.width > surface.height {
        (max, min)
    } else {
        (min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    R,
    Rg,
    Rgba,
}

impl ChannelLayout {
    pub fn channels(self) -> u32 {
        match self {
            ChannelLayout::R => 1,
            ChannelLayout::Rg => 2,
            ChannelLayout::Rgba => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Half,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDesc {
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    pub precision: Precision,
    pub filter: FilterMode,
}

impl FieldDesc {
    pub fn new(
        (width, height): (u32, u32),
        layout: ChannelLayout,
        precision: Precision,
        filter: FilterMode,
    ) -> Self {
        Self { width: width.max(1), height: height.max(1), layout, precision, filter }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn value_count(&self) -> usize {
        self.texel_count() * self.layout.channels() as usize
    }

    pub fn texel_size(&self) -> [f32; 2] {
        [1.0 / self.width as f32, 1.0 / self.height as f32]
    }
}

/// Opaque reference to device-side storage.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FieldHandle(u64);

impl FieldHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
pub struct GridField {
    handle: FieldHandle,
    desc: FieldDesc,
}

impl GridField {
    pub fn handle(&self) -> &FieldHandle {
        &self.handle
    }

    pub fn desc(&self) -> &FieldDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.desc.texel_size()
    }

    pub fn release<D: ShadingDevice + ?Sized>(self, device: &mut D) {
        device.release(self.handle);
    }
}

pub fn allocate<D: ShadingDevice + ?Sized>(device: &mut D, desc: FieldDesc) -> FluidResult<GridField> {
    let handle = device.allocate(&desc)?;
    Ok(GridField { handle, desc })
}

/// Two fields of the same shape; `read` is always the latest complete state.
#[derive(Debug)]
pub struct DoubleField {
    read: GridField,
    write: GridField,
}

impl DoubleField {
    pub fn read(&self) -> &GridField {
        &self.read
    }

    pub fn write(&self) -> &GridField {
        &self.write
    }

    pub fn desc(&self) -> &FieldDesc {
        self.read.desc()
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.read.texel_size()
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
    }

    pub fn release<D: ShadingDevice + ?Sized>(self, device: &mut D) {
        self.read.release(device);
        self.write.release(device);
    }
}

pub fn allocate_double<D: ShadingDevice + ?Sized>(
    device: &mut D,
    desc: FieldDesc,
) -> FluidResult<DoubleField> {
    let read = allocate(device, desc)?;
    match allocate(device, desc) {
        Ok(write) => Ok(DoubleField { read, write }),
        Err(e) => {
            read.release(device);
            Err(e)
        }
    }
}

/// Every grid one simulation run needs.
#[derive(Debug)]
pub struct SimFields {
    pub velocity: DoubleField,
    pub dye: DoubleField,
    pub pressure: DoubleField,
    pub divergence: GridField,
    pub curl: GridField,
}

impl SimFields {
    pub fn allocate<D: ShadingDevice + ?Sized>(
        device: &mut D,
        config: &FluidConfig,
        surface: SurfaceSize,
    ) -> FluidResult<Self> {
        let sim_res = resolution(config.sim_resolution as f32, surface);
        let dye_res = resolution(config.dye_resolution as f32, surface);
        let filtering = if device.capabilities().linear_filtering {
            FilterMode::Linear
        } else {
            FilterMode::Nearest
        };
        let half = Precision::Half;

        let dye = allocate_double(device, FieldDesc::new(dye_res, ChannelLayout::Rgba, half, filtering))?;
        let velocity = match allocate_double(device, FieldDesc::new(sim_res, ChannelLayout::Rg, half, filtering)) {
            Ok(v) => v,
            Err(e) => {
                dye.release(device);
                return Err(e);
            }
        };
        let scalar = FieldDesc::new(sim_res, ChannelLayout::R, half, FilterMode::Nearest);
        let divergence = match allocate(device, scalar) {
            Ok(d) => d,
            Err(e) => {
                dye.release(device);
                velocity.release(device);
                return Err(e);
            }
        };
        let curl = match allocate(device, scalar) {
            Ok(c) => c,
            Err(e) => {
                dye.release(device);
                velocity.release(device);
                divergence.release(device);
                return Err(e);
            }
        };
        let pressure = match allocate_double(device, scalar) {
            Ok(p) => p,
            Err(e) => {
                dye.release(device);
                velocity.release(device);
                divergence.release(device);
                curl.release(device);
                return Err(e);
            }
        };

        log::info!(
            "Allocated fields: sim {}x{}, dye {}x{} ({:?} filtering)",
            sim_res.0,
            sim_res.1,
            dye_res.0,
            dye_res.1,
            filtering
        );

        Ok(Self { velocity, dye, pressure, divergence, curl })
    }

    pub fn release<D: ShadingDevice + ?Sized>(self, device: &mut D) {
        self.velocity.release(device);
        self.dye.release(device);
        self.pressure.release(device);
        self.divergence.release(device);
        self.curl.release(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;

    #[test]
    fn landscape_surface_stretches_width() {
        let (w, h) = resolution(128.0, SurfaceSize::new(1920, 1080));
        assert_eq!(h, 128);
        assert_eq!(w, (128.0f32 * 1920.0 / 1080.0).round() as u32);
    }

    #[test]
    fn portrait_surface_stretches_height() {
        let (w, h) = resolution(128.0, SurfaceSize::new(600, 900));
        assert_eq!(w, 128);
        assert_eq!(h, 192);
    }

    #[test]
    fn square_surface_uses_target_on_both_axes() {
        assert_eq!(resolution(127.6, SurfaceSize::new(500, 500)), (128, 128));
    }

    #[test]
    fn degenerate_inputs_never_yield_zero_cells() {
        assert_eq!(resolution(0.0, SurfaceSize::new(0, 0)), (1, 1));
        let desc = FieldDesc::new((0, 0), ChannelLayout::R, Precision::Full, FilterMode::Nearest);
        assert_eq!(desc.texel_size(), [1.0, 1.0]);
    }

    #[test]
    fn swap_exchanges_labels_without_copying() {
        let mut device = CpuDevice::new();
        let desc = FieldDesc::new((4, 4), ChannelLayout::Rg, Precision::Full, FilterMode::Linear);
        let mut field = allocate_double(&mut device, desc).unwrap();
        let read_id = field.read().handle().raw();
        let write_id = field.write().handle().raw();
        let allocated = device.allocated_fields();

        field.swap();
        assert_eq!(field.read().handle().raw(), write_id);
        assert_eq!(field.write().handle().raw(), read_id);
        assert_eq!(device.allocated_fields(), allocated);

        field.swap();
        assert_eq!(field.read().handle().raw(), read_id);
    }

    #[test]
    fn failed_allocation_rolls_back_partial_fields() {
        // Enough room for the dye pair only.
        let config = FluidConfig { sim_resolution: 8, dye_resolution: 8, ..FluidConfig::default() };
        let mut device = CpuDevice::with_texel_limit(8 * 8 * 2 + 1);
        let result = SimFields::allocate(&mut device, &config, SurfaceSize::new(64, 64));
        assert!(result.is_err());
        assert_eq!(device.allocated_fields(), 0);
    }

    #[test]
    fn sim_fields_follow_configured_resolutions() {
        let config = FluidConfig { sim_resolution: 16, dye_resolution: 32, ..FluidConfig::default() };
        let mut device = CpuDevice::new();
        let fields = SimFields::allocate(&mut device, &config, SurfaceSize::new(200, 100)).unwrap();
        assert_eq!((fields.velocity.desc().width, fields.velocity.desc().height), (32, 16));
        assert_eq!((fields.dye.desc().width, fields.dye.desc().height), (64, 32));
        assert_eq!(fields.pressure.desc().filter, FilterMode::Nearest);
        assert_eq!(fields.velocity.desc().layout, ChannelLayout::Rg);
        assert_eq!(device.allocated_fields(), 8);
        fields.release(&mut device);
        assert_eq!(device.allocated_fields(), 0);
    }
}
