//! The simulation driver: owns the device, the fields and the pointer state,
//! and runs one splat/step/render cycle per tick.

use std::path::{Path, PathBuf};

use crate::capture;
use crate::config::{Color, FluidConfig};
use crate::device::{DisplayParams, FieldData, Pass, ShadingDevice};
use crate::error::{FluidError, FluidResult};
use crate::field::{self, GridField, SimFields, SurfaceSize};
use crate::input::{InputMapper, Splat};

enum SimState {
    /// No fields allocated: before the first surface, or after an allocation
    /// failure. Every tick retries.
    Idle,
    Running(SimFields),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced,
    Paused,
}

pub struct FluidSim<D: ShadingDevice> {
    device: D,
    config: FluidConfig,
    state: SimState,
    surface: Option<SurfaceSize>,
    input: InputMapper,
}

impl<D: ShadingDevice> FluidSim<D> {
    pub fn new(device: D, config: FluidConfig) -> Self {
        Self::with_input(device, config, InputMapper::new(SurfaceSize::new(1, 1)))
    }

    /// Use a prepared input mapper, e.g. one with a fixed palette seed.
    pub fn with_input(device: D, mut config: FluidConfig, input: InputMapper) -> Self {
        config.sanitize();
        Self { device, config, state: SimState::Idle, surface: None, input }
    }

    /// Allocate every field for `surface`. On failure the simulation stays
    /// idle and the next tick tries again.
    pub fn initialize(&mut self, surface: SurfaceSize) -> FluidResult<()> {
        let surface = surface.sanitized();
        self.surface = Some(surface);
        self.input.set_surface(surface);
        self.device.resize_surface(surface);
        self.reallocate()
    }

    fn reallocate(&mut self) -> FluidResult<()> {
        let surface = self.surface.ok_or(FluidError::NotRunning)?;
        if let SimState::Running(fields) = std::mem::replace(&mut self.state, SimState::Idle) {
            fields.release(&mut self.device);
        }
        let fields = SimFields::allocate(&mut self.device, &self.config, surface)?;
        self.state = SimState::Running(fields);
        Ok(())
    }

    /// Swap in new parameters. Only resolution changes rebuild the fields;
    /// everything else applies from the next tick.
    pub fn reconfigure(&mut self, mut config: FluidConfig) -> FluidResult<()> {
        config.sanitize();
        let rebuild = self.config.requires_reallocation(&config);
        self.config = config;
        if rebuild && self.surface.is_some() {
            log::info!("Resolution changed, reallocating fields");
            self.reallocate()?;
        }
        Ok(())
    }

    /// Advance one frame. `resized` carries the new surface size when it
    /// changed since the last tick.
    pub fn tick(&mut self, dt: f32, resized: Option<SurfaceSize>) -> FluidResult<TickOutcome> {
        if let Some(size) = resized.map(SurfaceSize::sanitized) {
            if self.surface != Some(size) {
                log::debug!("Surface resized to {}x{}", size.width, size.height);
                self.surface = Some(size);
                self.input.set_surface(size);
                self.device.resize_surface(size);
                self.reallocate()?;
            }
        }

        if !self.is_running() {
            self.reallocate()?;
        }

        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };

        let splats = self.input.take_splats(self.config.splat_force);
        for splat in &splats {
            self.apply_splat(splat)?;
        }

        let outcome = if self.config.paused {
            TickOutcome::Paused
        } else {
            self.step(dt)?;
            TickOutcome::Advanced
        };

        self.render()?;
        Ok(outcome)
    }

    fn apply_splat(&mut self, splat: &Splat) -> FluidResult<()> {
        let Self { device, config, state, surface, .. } = self;
        let SimState::Running(fields) = state else {
            return Err(FluidError::NotRunning);
        };
        let aspect_ratio = surface.map_or(1.0, |s| s.aspect_ratio());
        let radius = config.splat_radius_uv();

        device.run(&Pass::Splat {
            source: fields.velocity.read(),
            target: fields.velocity.write(),
            point: splat.point,
            value: [splat.impulse[0], splat.impulse[1], 0.0],
            radius,
            aspect_ratio,
        })?;
        fields.velocity.swap();

        device.run(&Pass::Splat {
            source: fields.dye.read(),
            target: fields.dye.write(),
            point: splat.point,
            value: splat.color.to_array(),
            radius,
            aspect_ratio,
        })?;
        fields.dye.swap();
        Ok(())
    }

    /// One full solver step. Each stage reads the read side of its inputs
    /// and writes a distinct target; double fields swap right after.
    pub fn step(&mut self, dt: f32) -> FluidResult<()> {
        let Self { device, config, state, .. } = self;
        let SimState::Running(fields) = state else {
            return Err(FluidError::NotRunning);
        };
        let SimFields { velocity, dye, pressure, divergence, curl } = fields;

        device.run(&Pass::Curl { velocity: velocity.read(), target: curl })?;

        device.run(&Pass::Vorticity {
            velocity: velocity.read(),
            curl,
            target: velocity.write(),
            strength: config.curl,
            dt,
        })?;
        velocity.swap();

        device.run(&Pass::Divergence { velocity: velocity.read(), target: divergence })?;

        device.run(&Pass::Clear {
            source: pressure.read(),
            target: pressure.write(),
            value: config.pressure,
        })?;
        pressure.swap();

        for _ in 0..config.pressure_iterations {
            device.run(&Pass::Pressure {
                pressure: pressure.read(),
                divergence,
                target: pressure.write(),
            })?;
            pressure.swap();
        }

        device.run(&Pass::GradientSubtract {
            pressure: pressure.read(),
            velocity: velocity.read(),
            target: velocity.write(),
        })?;
        velocity.swap();

        device.run(&Pass::Advection {
            velocity: velocity.read(),
            source: velocity.read(),
            target: velocity.write(),
            dt,
            dissipation: config.velocity_dissipation,
        })?;
        velocity.swap();

        device.run(&Pass::Advection {
            velocity: velocity.read(),
            source: dye.read(),
            target: dye.write(),
            dt,
            dissipation: config.density_dissipation,
        })?;
        dye.swap();

        Ok(())
    }

    fn display_params(&self, surface: SurfaceSize) -> DisplayParams {
        DisplayParams {
            surface,
            shading: self.config.shading,
            back_color: self.config.back_color,
            transparent: self.config.transparent,
        }
    }

    pub fn render(&mut self) -> FluidResult<()> {
        let surface = self.surface.ok_or(FluidError::NotRunning)?;
        let display = self.display_params(surface);
        let SimState::Running(fields) = &self.state else {
            return Err(FluidError::NotRunning);
        };
        self.device.present(fields.dye.read(), &display)
    }

    /// Host copy of one of the current fields.
    pub fn read_back(&mut self, select: impl FnOnce(&SimFields) -> &GridField) -> FluidResult<FieldData> {
        let SimState::Running(fields) = &self.state else {
            return Err(FluidError::NotRunning);
        };
        self.device.read_field(select(fields))
    }

    /// Render the current dye field off-screen at the capture resolution and
    /// write it as a timestamped PNG into `dir`.
    pub fn capture(&mut self, dir: &Path) -> FluidResult<PathBuf> {
        let surface = self.surface.ok_or(FluidError::NotRunning)?;
        let display = self.display_params(surface);
        let dye = self.read_back(|fields| fields.dye.read())?;
        let size = field::resolution(self.config.capture_resolution as f32, surface);
        let image = capture::compose_capture(&dye, size, &display);
        capture::save_capture(&image, dir)
    }

    pub fn notify_contact_start(&mut self, id: i64, x: f32, y: f32) {
        self.input.on_contact_start(id, x, y);
    }

    pub fn notify_contact_move(&mut self, id: i64, x: f32, y: f32, color: Option<Color>) {
        self.input.on_contact_move(id, x, y, color);
    }

    pub fn notify_contact_end(&mut self, id: i64) {
        self.input.on_contact_end(id);
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.config.paused = paused;
    }

    pub fn set_shading(&mut self, shading: bool) {
        self.config.shading = shading;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SimState::Running(_))
    }

    pub fn fields(&self) -> Option<&SimFields> {
        match &self.state {
            SimState::Running(fields) => Some(fields),
            SimState::Idle => None,
        }
    }

    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    pub fn surface(&self) -> Option<SurfaceSize> {
        self.surface
    }

    pub fn input(&self) -> &InputMapper {
        &self.input
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Release every field and hand the device back.
    pub fn into_device(mut self) -> D {
        if let SimState::Running(fields) = std::mem::replace(&mut self.state, SimState::Idle) {
            fields.release(&mut self.device);
        }
        self.device
    }
}
