//! Frame pacing: wall-clock deltas, pending resizes and the FPS counter.

use std::time::{Duration, Instant};

use crate::device::ShadingDevice;
use crate::error::FluidResult;
use crate::field::SurfaceSize;
use crate::sim::{FluidSim, TickOutcome};

/// Longest simulated step; slower frames run in slow motion instead of
/// destabilizing the solver.
pub const MAX_FRAME_DT: f32 = 1.0 / 60.0;

const STATS_INTERVAL: Duration = Duration::from_millis(500);

pub fn clamp_frame_dt(raw: f32) -> f32 {
    if raw.is_finite() {
        raw.clamp(0.0, MAX_FRAME_DT)
    } else {
        0.0
    }
}

pub struct FrameClock {
    last: Instant,
}

impl FrameClock {
    pub fn new(start: Instant) -> Self {
        Self { last: start }
    }

    /// Clamped seconds since the previous call.
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f32();
        self.last = now;
        clamp_frame_dt(elapsed)
    }

    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }
}

/// Frame rate and average frame time, refreshed twice a second.
pub struct FrameStats {
    frame_count: u32,
    frame_time_sum: f32,
    last_update: Instant,
}

impl FrameStats {
    pub fn new(start: Instant) -> Self {
        Self { frame_count: 0, frame_time_sum: 0.0, last_update: start }
    }

    pub fn record(&mut self, frame_time: f32) {
        self.frame_count += 1;
        self.frame_time_sum += frame_time;
    }

    /// `(fps, ms per frame)` once per interval, `None` in between.
    pub fn poll_at(&mut self, now: Instant) -> Option<(f32, f32)> {
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed < STATS_INTERVAL || self.frame_count == 0 {
            return None;
        }
        let fps = self.frame_count as f32 / elapsed.as_secs_f32();
        let avg_ms = self.frame_time_sum / self.frame_count as f32 * 1000.0;
        self.frame_count = 0;
        self.frame_time_sum = 0.0;
        self.last_update = now;
        Some((fps, avg_ms))
    }
}

/// Drives one [`FluidSim`] from the host's redraw callbacks.
pub struct FrameLoop<D: ShadingDevice> {
    sim: FluidSim<D>,
    clock: FrameClock,
    stats: FrameStats,
    pending_resize: Option<SurfaceSize>,
}

impl<D: ShadingDevice> FrameLoop<D> {
    pub fn new(sim: FluidSim<D>, start: Instant) -> Self {
        Self { sim, clock: FrameClock::new(start), stats: FrameStats::new(start), pending_resize: None }
    }

    /// Resizes are applied at the start of the next frame; only the latest
    /// one counts.
    pub fn request_resize(&mut self, size: SurfaceSize) {
        self.pending_resize = Some(size);
    }

    pub fn frame_at(&mut self, now: Instant) -> FluidResult<TickOutcome> {
        let raw = now.saturating_duration_since(self.clock.last).as_secs_f32();
        let dt = self.clock.tick_at(now);
        self.stats.record(raw);
        let resized = self.pending_resize.take();
        self.sim.tick(dt, resized)
    }

    pub fn frame(&mut self) -> FluidResult<TickOutcome> {
        self.frame_at(Instant::now())
    }

    pub fn poll_stats_at(&mut self, now: Instant) -> Option<(f32, f32)> {
        self.stats.poll_at(now)
    }

    pub fn sim(&self) -> &FluidSim<D> {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut FluidSim<D> {
        &mut self.sim
    }

    pub fn into_sim(self) -> FluidSim<D> {
        self.sim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dt_is_clamped_to_one_sixtieth() {
        assert_eq!(clamp_frame_dt(0.5), MAX_FRAME_DT);
        assert_eq!(clamp_frame_dt(0.01), 0.01);
        assert_eq!(clamp_frame_dt(-0.2), 0.0);
        assert_eq!(clamp_frame_dt(f32::NAN), 0.0);
        assert_eq!(clamp_frame_dt(f32::INFINITY), 0.0);
    }

    #[test]
    fn clock_measures_since_previous_tick() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);
        let dt = clock.tick_at(start + Duration::from_millis(10));
        assert!((dt - 0.010).abs() < 1e-6);
        assert_eq!(clock.tick_at(start + Duration::from_secs(2)), MAX_FRAME_DT);
        // Time never runs backwards.
        assert_eq!(clock.tick_at(start), 0.0);
    }

    #[test]
    fn stats_report_every_half_second() {
        let start = Instant::now();
        let mut stats = FrameStats::new(start);
        for _ in 0..30 {
            stats.record(0.016);
        }
        assert!(stats.poll_at(start + Duration::from_millis(100)).is_none());

        let (fps, ms) = stats.poll_at(start + Duration::from_millis(500)).unwrap();
        assert!((fps - 60.0).abs() < 1e-3);
        assert!((ms - 16.0).abs() < 1e-3);
        assert!(stats.poll_at(start + Duration::from_millis(1100)).is_none());
    }
}
