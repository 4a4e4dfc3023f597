use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use winit::{
    event::*,
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

use fluid_cursor::gpu::{GpuContext, GpuDevice};
use fluid_cursor::{
    DisplayParams, FluidConfig, FluidError, FluidSim, FrameLoop, SurfaceSize, TickOutcome, MOUSE_POINTER_ID,
};

enum Renderer {
    Fluid(FrameLoop<GpuDevice>),
    /// The adapter cannot run the solver; keep presenting the background.
    Static { context: GpuContext, color: [f32; 4] },
    /// No usable adapter at all.
    Unavailable,
}

impl Renderer {
    fn start(window: Arc<Window>, config: &FluidConfig) -> Self {
        let size = window.inner_size();
        let surface = SurfaceSize::new(size.width, size.height);

        let context = match GpuContext::new(window, config.transparent) {
            Ok(context) => context,
            Err(e) => {
                log::error!("GPU initialization failed: {}", e);
                return Renderer::Unavailable;
            }
        };
        let device = match GpuDevice::try_new(context) {
            Ok(device) => device,
            Err((context, e)) => {
                log::error!("Fluid pipelines unavailable: {}; showing the background only", e);
                let color = background(config, surface);
                return Renderer::Static { context, color };
            }
        };
        let mut sim = FluidSim::new(device, config.clone());
        if let Err(e) = sim.initialize(surface) {
            log::warn!("Initial field allocation failed, retrying next frame: {}", e);
        }
        Renderer::Fluid(FrameLoop::new(sim, Instant::now()))
    }

    fn sim_mut(&mut self) -> Option<&mut FluidSim<GpuDevice>> {
        match self {
            Renderer::Fluid(frames) => Some(frames.sim_mut()),
            _ => None,
        }
    }

    fn config(&self) -> Option<&FluidConfig> {
        match self {
            Renderer::Fluid(frames) => Some(frames.sim().config()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    Exit,
    TogglePause,
    ToggleShading,
    Capture,
}

/// Toggles fire once per press; held keys auto-repeat and are ignored.
fn key_action(key: KeyCode, state: ElementState, repeat: bool) -> Option<KeyAction> {
    if state != ElementState::Pressed || repeat {
        return None;
    }
    match key {
        KeyCode::Escape => Some(KeyAction::Exit),
        KeyCode::Space => Some(KeyAction::TogglePause),
        KeyCode::KeyH => Some(KeyAction::ToggleShading),
        KeyCode::KeyS => Some(KeyAction::Capture),
        _ => None,
    }
}

fn background(config: &FluidConfig, surface: SurfaceSize) -> [f32; 4] {
    DisplayParams {
        surface,
        shading: config.shading,
        back_color: config.back_color,
        transparent: config.transparent,
    }
    .clear_color()
}

fn load_config(path: &Path) -> FluidConfig {
    if !path.exists() {
        return FluidConfig::default();
    }
    match FluidConfig::load_from_disk(path) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("Failed to load fluid settings from {:?}: {}", path, err);
            FluidConfig::default()
        }
    }
}

fn capture_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let settings_path = FluidConfig::default_path();
    let config = load_config(&settings_path);

    let event_loop = EventLoop::new().context("creating event loop")?;
    let window = Arc::new(
        event_loop
            .create_window(
                winit::window::WindowAttributes::default()
                    .with_title("Fluid Cursor")
                    .with_transparent(config.transparent)
                    .with_inner_size(winit::dpi::LogicalSize::new(1280, 720)),
            )
            .context("creating window")?,
    );

    let mut renderer = Renderer::start(window.clone(), &config);
    let mut cursor_px = (0.0f32, 0.0f32);

    event_loop.run(move |event, target| match event {
        Event::WindowEvent { event, window_id } if window_id == window.id() => match event {
            WindowEvent::CloseRequested => {
                let current = renderer.config().unwrap_or(&config);
                if let Err(err) = current.save_to_disk(&settings_path) {
                    log::warn!("Failed to save fluid settings to {:?}: {}", settings_path, err);
                }
                target.exit();
            }
            WindowEvent::Resized(size) => match &mut renderer {
                Renderer::Fluid(frames) => frames.request_resize(SurfaceSize::new(size.width, size.height)),
                Renderer::Static { context, .. } => context.resize(SurfaceSize::new(size.width, size.height)),
                Renderer::Unavailable => {}
            },
            WindowEvent::KeyboardInput {
                event: KeyEvent { physical_key: PhysicalKey::Code(key), state, repeat, .. },
                ..
            } => {
                let Some(action) = key_action(key, state, repeat) else { return };
                if action == KeyAction::Exit {
                    target.exit();
                    return;
                }
                let Some(sim) = renderer.sim_mut() else { return };
                match action {
                    KeyAction::TogglePause => {
                        let paused = !sim.config().paused;
                        sim.set_paused(paused);
                        log::info!("Simulation {}", if paused { "paused" } else { "resumed" });
                    }
                    KeyAction::ToggleShading => {
                        let shading = !sim.config().shading;
                        sim.set_shading(shading);
                    }
                    KeyAction::Capture => match sim.capture(&capture_dir()) {
                        Ok(path) => log::info!("Capture written to {}", path.display()),
                        Err(e) => log::error!("Capture failed: {}", e),
                    },
                    KeyAction::Exit => {}
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                cursor_px = (position.x as f32, position.y as f32);
                if let Some(sim) = renderer.sim_mut() {
                    // Hovering paints too: a move without a press starts a stroke.
                    sim.notify_contact_move(MOUSE_POINTER_ID, cursor_px.0, cursor_px.1, None);
                }
            }
            WindowEvent::MouseInput { state, button: MouseButton::Left, .. } => {
                if let Some(sim) = renderer.sim_mut() {
                    match state {
                        ElementState::Pressed => sim.notify_contact_start(MOUSE_POINTER_ID, cursor_px.0, cursor_px.1),
                        ElementState::Released => sim.notify_contact_end(MOUSE_POINTER_ID),
                    }
                }
            }
            WindowEvent::Touch(touch) => {
                if let Some(sim) = renderer.sim_mut() {
                    let (id, x, y) = (touch.id as i64, touch.location.x as f32, touch.location.y as f32);
                    match touch.phase {
                        TouchPhase::Started => sim.notify_contact_start(id, x, y),
                        TouchPhase::Moved => sim.notify_contact_move(id, x, y, None),
                        TouchPhase::Ended | TouchPhase::Cancelled => sim.notify_contact_end(id),
                    }
                }
            }
            WindowEvent::RedrawRequested => match &mut renderer {
                Renderer::Fluid(frames) => {
                    match frames.frame() {
                        Ok(TickOutcome::Advanced) | Ok(TickOutcome::Paused) => {}
                        Err(FluidError::OutOfMemory) => {
                            log::error!("GPU out of memory");
                            target.exit();
                        }
                        Err(e) => log::warn!("Frame skipped: {}", e),
                    }
                    if let Some((fps, frame_time_ms)) = frames.poll_stats_at(Instant::now()) {
                        let paused = if frames.sim().config().paused { " | paused" } else { "" };
                        window.set_title(&format!(
                            "Fluid Cursor | {:.0} FPS | {:.2} ms/frame{}",
                            fps, frame_time_ms, paused
                        ));
                    }
                }
                Renderer::Static { context, color } => {
                    if let Err(e) = context.clear(*color) {
                        log::error!("Background clear failed: {}", e);
                        if matches!(e, FluidError::OutOfMemory) {
                            target.exit();
                        }
                    }
                }
                Renderer::Unavailable => {}
            },
            _ => {}
        },
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluid_cursor::Color;

    #[test]
    fn held_keys_do_not_retrigger() {
        assert_eq!(key_action(KeyCode::Space, ElementState::Pressed, false), Some(KeyAction::TogglePause));
        assert_eq!(key_action(KeyCode::Space, ElementState::Pressed, true), None);
        assert_eq!(key_action(KeyCode::KeyS, ElementState::Pressed, true), None);
        assert_eq!(key_action(KeyCode::KeyH, ElementState::Released, false), None);
        assert_eq!(key_action(KeyCode::KeyA, ElementState::Pressed, false), None);
    }

    #[test]
    fn static_fallback_clears_to_configured_background() {
        let surface = SurfaceSize::new(640, 480);
        let opaque = FluidConfig { transparent: false, back_color: Color::new(0.2, 0.4, 0.6), ..FluidConfig::default() };
        assert_eq!(background(&opaque, surface), [0.2, 0.4, 0.6, 1.0]);
        let clear = FluidConfig { transparent: true, ..opaque };
        assert_eq!(background(&clear, surface), [0.0, 0.0, 0.0, 0.0]);
    }
}
