use std::sync::Arc;

use winit::window::Window;

use crate::error::{FluidError, FluidResult};
use crate::field::SurfaceSize;

/// Window surface plus the device and queue it presents through.
pub struct GpuContext {
    pub surface: wgpu::Surface<'static>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub surface_config: wgpu::SurfaceConfiguration,
    pub adapter_name: String,
    downlevel: wgpu::DownlevelFlags,
}

impl GpuContext {
    pub fn new(window: Arc<Window>, transparent: bool) -> FluidResult<Self> {
        pollster::block_on(Self::new_async(window, transparent))
    }

    async fn new_async(window: Arc<Window>, transparent: bool) -> FluidResult<Self> {
        let size = SurfaceSize::new(window.inner_size().width, window.inner_size().height).sanitized();

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| FluidError::Surface(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| FluidError::Unsupported("no compatible adapter".to_string()))?;

        let downlevel = adapter.get_downlevel_capabilities().flags;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Device"),
                    required_features: wgpu::Features::empty(),
                    // Fine dye grids need the adapter's full storage binding size.
                    required_limits: adapter.limits(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| FluidError::Unsupported(e.to_string()))?;

        let surface_caps = surface.get_capabilities(&adapter);
        // The display shader writes linear values straight through.
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| FluidError::Surface("surface reports no formats".to_string()))?;

        let alpha_mode = if transparent
            && surface_caps.alpha_modes.contains(&wgpu::CompositeAlphaMode::PreMultiplied)
        {
            wgpu::CompositeAlphaMode::PreMultiplied
        } else {
            surface_caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto)
        };

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width,
            height: size.height,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        log::info!(
            "Using adapter '{}' ({:?}), surface {:?} {:?}",
            adapter.get_info().name,
            adapter.get_info().backend,
            surface_format,
            alpha_mode
        );

        let adapter_name = adapter.get_info().name;
        Ok(Self { surface, device, queue, surface_config, adapter_name, downlevel })
    }

    pub fn resize(&mut self, size: SurfaceSize) {
        if size.width > 0 && size.height > 0 {
            self.surface_config.width = size.width;
            self.surface_config.height = size.height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    pub fn reconfigure(&self) {
        self.surface.configure(&self.device, &self.surface_config);
    }

    /// The solver needs compute shaders and storage buffers readable from
    /// the display fragment shader.
    pub fn check_fluid_support(&self) -> FluidResult<()> {
        if !self.downlevel.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(FluidError::Unsupported(format!(
                "adapter '{}' has no compute shaders",
                self.adapter_name
            )));
        }
        if !self.downlevel.contains(wgpu::DownlevelFlags::FRAGMENT_STORAGE) {
            return Err(FluidError::Unsupported(format!(
                "adapter '{}' cannot read storage buffers in fragment shaders",
                self.adapter_name
            )));
        }
        Ok(())
    }

    /// Present one frame filled with `color`, for when the solver cannot run.
    pub fn clear(&self, color: [f32; 4]) -> FluidResult<()> {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost) | Err(wgpu::SurfaceError::Outdated) => {
                self.reconfigure();
                return Ok(());
            }
            Err(wgpu::SurfaceError::OutOfMemory) => return Err(FluidError::OutOfMemory),
            Err(e) => return Err(FluidError::Surface(format!("{:?}", e))),
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let [r, g, b, a] = color.map(f64::from);
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Background Clear"),
        });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Background Clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}
