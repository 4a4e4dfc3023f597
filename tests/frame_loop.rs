use std::time::{Duration, Instant};

use fluid_cursor::frame::{clamp_frame_dt, FrameClock};
use fluid_cursor::{CpuDevice, FluidConfig, FluidSim, FrameLoop, SurfaceSize, TickOutcome, MAX_FRAME_DT};

fn frame_loop(start: Instant) -> FrameLoop<CpuDevice> {
    let config = FluidConfig { sim_resolution: 8, dye_resolution: 8, ..FluidConfig::default() };
    let mut sim = FluidSim::new(CpuDevice::new(), config);
    sim.initialize(SurfaceSize::new(16, 16)).unwrap();
    FrameLoop::new(sim, start)
}

#[test]
fn long_frames_clamp_to_exactly_one_sixtieth() {
    assert_eq!(MAX_FRAME_DT, 1.0 / 60.0);
    assert_eq!(clamp_frame_dt(0.25), MAX_FRAME_DT);

    let start = Instant::now();
    let mut clock = FrameClock::new(start);
    assert_eq!(clock.tick_at(start + Duration::from_millis(100)), MAX_FRAME_DT);
    let short = clock.tick_at(start + Duration::from_millis(105));
    assert!((short - 0.005).abs() < 1e-6);
}

#[test]
fn frames_advance_the_simulation() {
    let start = Instant::now();
    let mut frames = frame_loop(start);
    for i in 1..=3 {
        let outcome = frames.frame_at(start + Duration::from_millis(16 * i)).unwrap();
        assert_eq!(outcome, TickOutcome::Advanced);
    }
    assert!(frames.sim().device().passes_run() > 0);
}

#[test]
fn only_the_latest_resize_is_applied() {
    let start = Instant::now();
    let mut frames = frame_loop(start);
    frames.request_resize(SurfaceSize::new(64, 16));
    frames.request_resize(SurfaceSize::new(32, 16));
    frames.frame_at(start + Duration::from_millis(16)).unwrap();

    assert_eq!(frames.sim().surface(), Some(SurfaceSize::new(32, 16)));
    let velocity = frames.sim().fields().unwrap().velocity.desc();
    assert_eq!((velocity.width, velocity.height), (16, 8));
}

#[test]
fn stats_follow_recorded_frames() {
    let start = Instant::now();
    let mut frames = frame_loop(start);
    for i in 1..=10 {
        frames.frame_at(start + Duration::from_millis(50 * i)).unwrap();
    }
    let (fps, frame_ms) = frames.poll_stats_at(start + Duration::from_millis(500)).unwrap();
    assert!((fps - 20.0).abs() < 1e-3);
    assert!((frame_ms - 50.0).abs() < 1e-2);
}

#[test]
fn pausing_skips_the_solver() {
    let start = Instant::now();
    let mut frames = frame_loop(start);
    frames.sim_mut().set_paused(true);
    let outcome = frames.frame_at(start + Duration::from_millis(16)).unwrap();
    assert_eq!(outcome, TickOutcome::Paused);
    assert_eq!(frames.sim().device().passes_run(), 0);
}
