//! Off-screen snapshot of the dye field as a PNG.

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgba, RgbaImage};

use crate::device::{DisplayParams, FieldData};
use crate::error::FluidResult;
use crate::field::SurfaceSize;
use crate::kernels::{self, Stencil};

/// Run the display kernel over `dye` at `(width, height)` and compose it over
/// the clear color. Image rows run top to bottom.
pub fn compose_capture(dye: &FieldData, (width, height): (u32, u32), display: &DisplayParams) -> RgbaImage {
    let (width, height) = (width.max(1), height.max(1));
    let target = DisplayParams { surface: SurfaceSize::new(width, height), ..*display };
    let texel = target.texel_size();
    let clear = target.clear_color();

    let mut image = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let uv = kernels::texel_center(x, y, width, height);
            let color = kernels::display(dye, &Stencil::new(uv, texel), target.shading);
            let pixel = kernels::composite(color, clear).map(to_byte);
            image.put_pixel(x, height - 1 - y, Rgba(pixel));
        }
    }
    image
}

fn to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn capture_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("capture_{}.png", now.format("%Y%m%d_%H%M%S"))
}

pub fn save_capture(image: &RgbaImage, dir: &Path) -> FluidResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(capture_file_name(chrono::Local::now()));
    image.save(&path)?;
    log::info!("Saved capture to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Color;
    use chrono::TimeZone;

    fn uniform_dye(value: [f32; 4]) -> FieldData {
        FieldData { width: 2, height: 2, channels: 4, data: value.repeat(4) }
    }

    fn params(transparent: bool) -> DisplayParams {
        DisplayParams {
            surface: SurfaceSize::new(100, 100),
            shading: false,
            back_color: Color::new(1.0, 0.0, 0.0),
            transparent,
        }
    }

    #[test]
    fn empty_dye_shows_the_background() {
        let dye = uniform_dye([0.0; 4]);
        let opaque = compose_capture(&dye, (4, 3), &params(false));
        assert_eq!(opaque.dimensions(), (4, 3));
        assert_eq!(opaque.get_pixel(0, 0).0, [255, 0, 0, 255]);

        let clear = compose_capture(&dye, (4, 3), &params(true));
        assert_eq!(clear.get_pixel(3, 2).0, [0, 0, 0, 0]);
    }

    #[test]
    fn saturated_dye_covers_the_background() {
        let dye = uniform_dye([0.0, 0.0, 1.0, 1.0]);
        let image = compose_capture(&dye, (2, 2), &params(false));
        assert_eq!(image.get_pixel(1, 1).0, [0, 0, 255, 255]);
    }

    #[test]
    fn rows_are_flipped_top_down() {
        // Bottom row blue, top row black.
        let mut data = [0.0, 0.0, 1.0, 1.0].repeat(2);
        data.extend([0.0; 8]);
        let dye = FieldData { width: 2, height: 2, channels: 4, data };
        let image = compose_capture(&dye, (2, 2), &params(true));
        assert_eq!(image.get_pixel(0, 1).0[2], 255);
        assert_eq!(image.get_pixel(0, 0).0[2], 0);
    }

    #[test]
    fn file_name_is_timestamped() {
        let when = chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(capture_file_name(when), "capture_20240309_140507.png");
    }
}
