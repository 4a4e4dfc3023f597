//! Pointer and touch samples to normalized splats.
//!
//! Input only mutates pointer state. The driver drains it once per tick with
//! [`InputMapper::take_splats`], so any number of moves between two ticks
//! coalesce into one splat per pointer carrying the latest delta.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::Color;
use crate::field::SurfaceSize;

/// Id of the synthetic mouse pointer; touch ids are non-negative.
pub const MOUSE_POINTER_ID: i64 = -1;

pub const PALETTE: [Color; 2] = [
    Color::new(0.0, 0.38, 1.0), // blue
    Color::new(0.0, 1.0, 0.53), // green
];

#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    pub id: i64,
    pub texcoord: [f32; 2],
    pub prev_texcoord: [f32; 2],
    pub delta: [f32; 2],
    pub down: bool,
    pub moved: bool,
    pub color: Color,
}

impl Pointer {
    fn new(id: i64) -> Self {
        Self {
            id,
            texcoord: [0.0; 2],
            prev_texcoord: [0.0; 2],
            delta: [0.0; 2],
            down: false,
            moved: false,
            color: Color::BLACK,
        }
    }
}

/// Impulse and color to drop at one point of the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Splat {
    pub point: [f32; 2],
    pub impulse: [f32; 2],
    pub color: Color,
}

pub struct InputMapper {
    pointers: Vec<Pointer>,
    surface: SurfaceSize,
    rng: StdRng,
}

impl InputMapper {
    pub fn new(surface: SurfaceSize) -> Self {
        Self::with_rng(surface, StdRng::from_entropy())
    }

    /// Deterministic palette picks, for tests and replays.
    pub fn with_seed(surface: SurfaceSize, seed: u64) -> Self {
        Self::with_rng(surface, StdRng::seed_from_u64(seed))
    }

    fn with_rng(surface: SurfaceSize, rng: StdRng) -> Self {
        Self {
            // The mouse slot lives for the whole run.
            pointers: vec![Pointer::new(MOUSE_POINTER_ID)],
            surface: surface.sanitized(),
            rng,
        }
    }

    pub fn set_surface(&mut self, surface: SurfaceSize) {
        self.surface = surface.sanitized();
    }

    pub fn pointers(&self) -> &[Pointer] {
        &self.pointers
    }

    pub fn pointer(&self, id: i64) -> Option<&Pointer> {
        self.pointers.iter().find(|p| p.id == id)
    }

    /// Pixel position to texture coordinates, `y` flipped to point up.
    fn normalize(&self, x: f32, y: f32) -> [f32; 2] {
        [x / self.surface.width as f32, 1.0 - y / self.surface.height as f32]
    }

    fn slot(&mut self, id: i64) -> usize {
        match self.pointers.iter().position(|p| p.id == id) {
            Some(index) => index,
            None => {
                self.pointers.push(Pointer::new(id));
                self.pointers.len() - 1
            }
        }
    }

    fn random_color(&mut self) -> Color {
        *PALETTE.choose(&mut self.rng).unwrap_or(&PALETTE[0])
    }

    pub fn on_contact_start(&mut self, id: i64, x: f32, y: f32) {
        let texcoord = self.normalize(x, y);
        let color = self.random_color();
        let index = self.slot(id);
        let p = &mut self.pointers[index];
        p.down = true;
        p.moved = false;
        p.texcoord = texcoord;
        p.prev_texcoord = texcoord;
        p.delta = [0.0; 2];
        p.color = color;
    }

    pub fn on_contact_move(&mut self, id: i64, x: f32, y: f32, color: Option<Color>) {
        let started = self.pointer(id).map_or(false, |p| p.down);
        if !started {
            self.on_contact_start(id, x, y);
        }

        let texcoord = self.normalize(x, y);
        let aspect = self.surface.aspect_ratio();
        let index = self.slot(id);
        let p = &mut self.pointers[index];
        p.prev_texcoord = p.texcoord;
        p.texcoord = texcoord;
        p.delta = [
            (p.texcoord[0] - p.prev_texcoord[0]) * aspect.max(1.0),
            (p.texcoord[1] - p.prev_texcoord[1]) * (1.0 / aspect).max(1.0),
        ];
        p.moved = p.delta[0].abs() > 0.0 || p.delta[1].abs() > 0.0;
        if let Some(color) = color {
            p.color = color;
        }
    }

    /// Released pointers stop producing moves. A released touch keeps its
    /// slot until the next `take_splats`, so a final move still lands.
    pub fn on_contact_end(&mut self, id: i64) {
        if let Some(p) = self.pointers.iter_mut().find(|p| p.id == id) {
            p.down = false;
        }
    }

    /// One splat per moved pointer since the last call. Consumed deltas are
    /// reset so a stationary pointer never splats twice, and released touch
    /// slots are dropped.
    pub fn take_splats(&mut self, force: f32) -> Vec<Splat> {
        let splats = self
            .pointers
            .iter_mut()
            .filter(|p| p.moved)
            .map(|p| {
                let splat = Splat {
                    point: p.texcoord,
                    impulse: [p.delta[0] * force, p.delta[1] * force],
                    color: p.color,
                };
                p.moved = false;
                p.delta = [0.0; 2];
                splat
            })
            .collect();
        self.pointers.retain(|p| p.down || p.id == MOUSE_POINTER_ID);
        splats
    }
}
