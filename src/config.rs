use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FluidResult;

pub const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.r, self.g, self.b]
    }

    fn clamped(self) -> Self {
        Self::new(
            self.r.clamp(0.0, 1.0),
            self.g.clamp(0.0, 1.0),
            self.b.clamp(0.0, 1.0),
        )
    }
}

/// Simulation parameters. Held by the driver for the whole run; resolution
/// changes only take effect through `FluidSim::reconfigure`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FluidConfig {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
    pub capture_resolution: u32,
    pub density_dissipation: f32,
    pub velocity_dissipation: f32,
    pub pressure: f32, // decay applied to last frame's pressure before solving
    pub pressure_iterations: u32,
    pub curl: f32,
    pub splat_radius: f32,
    pub splat_force: f32,
    pub shading: bool,
    pub paused: bool,
    pub back_color: Color,
    pub transparent: bool,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 1440,
            capture_resolution: 512,
            density_dissipation: 3.5,
            velocity_dissipation: 2.0,
            pressure: 0.1,
            pressure_iterations: 20,
            curl: 3.0,
            splat_radius: 0.1,
            splat_force: 3000.0,
            shading: true,
            paused: false,
            back_color: Color::BLACK,
            transparent: true,
        }
    }
}

impl FluidConfig {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> FluidResult<Self> {
        let data = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&data)?;
        config.sanitize();
        Ok(config)
    }

    pub fn save_to_disk(&self, path: &Path) -> FluidResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.sim_resolution = self.sim_resolution.clamp(1, 1024);
        self.dye_resolution = self.dye_resolution.clamp(1, 4096);
        self.capture_resolution = self.capture_resolution.clamp(1, 8192);
        self.density_dissipation = self.density_dissipation.clamp(0.0, 100.0);
        self.velocity_dissipation = self.velocity_dissipation.clamp(0.0, 100.0);
        self.pressure = self.pressure.clamp(0.0, 1.0);
        self.pressure_iterations = self.pressure_iterations.clamp(1, 200);
        self.curl = self.curl.clamp(0.0, 100.0);
        self.splat_radius = self.splat_radius.clamp(0.001, 10.0);
        self.splat_force = self.splat_force.clamp(0.0, 100_000.0);
        self.back_color = self.back_color.clamped();
    }

    /// Radius in normalized texture units, as the splat kernel expects it.
    pub fn splat_radius_uv(&self) -> f32 {
        self.splat_radius / 100.0
    }

    /// True when switching from `self` to `other` invalidates every field.
    pub fn requires_reallocation(&self, other: &FluidConfig) -> bool {
        self.sim_resolution != other.sim_resolution || self.dye_resolution != other.dye_resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: FluidConfig = serde_json::from_str(r#"{ "curl": 10.0 }"#).unwrap();
        assert_eq!(config.curl, 10.0);
        assert_eq!(config.sim_resolution, 128);
        assert_eq!(config.pressure_iterations, 20);
        assert!(config.transparent);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = FluidConfig {
            sim_resolution: 0,
            pressure: 4.0,
            pressure_iterations: 0,
            back_color: Color::new(2.0, -1.0, 0.5),
            ..FluidConfig::default()
        };
        config.sanitize();
        assert_eq!(config.sim_resolution, 1);
        assert_eq!(config.pressure, 1.0);
        assert_eq!(config.pressure_iterations, 1);
        assert_eq!(config.back_color, Color::new(1.0, 0.0, 0.5));
    }

    #[test]
    fn only_resolution_changes_need_reallocation() {
        let base = FluidConfig::default();
        let shaded = FluidConfig { shading: false, curl: 30.0, ..base.clone() };
        assert!(!base.requires_reallocation(&shaded));
        let finer = FluidConfig { dye_resolution: 512, ..base.clone() };
        assert!(base.requires_reallocation(&finer));
    }

    #[test]
    fn settings_survive_disk_round_trip() {
        let dir = std::env::temp_dir().join(format!("fluid_cursor_cfg_{}", std::process::id()));
        let path = dir.join(SETTINGS_FILE_NAME);
        let config = FluidConfig { paused: true, splat_force: 1234.0, ..FluidConfig::default() };
        config.save_to_disk(&path).unwrap();
        let loaded = FluidConfig::load_from_disk(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_dir_all(&dir);
    }
}
