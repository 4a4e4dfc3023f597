use std::collections::HashMap;

use super::context::GpuContext;
use super::params::{DisplayUniforms, PassParams};
use crate::device::{DeviceCapabilities, DisplayParams, FieldData, Kernel, Pass, ShadingDevice};
use crate::error::{FluidError, FluidResult};
use crate::field::{FieldDesc, FieldHandle, GridField, SurfaceSize};
use crate::variant::{DisplayKeywords, VariantCache};

const WORKGROUP_SIZE: u32 = 8;
const PASS_PARAMS_SIZE: u64 = std::mem::size_of::<PassParams>() as u64;

struct GpuField {
    buffer: wgpu::Buffer,
    desc: FieldDesc,
}

/// A kernel pass recorded by `run` and encoded at the next flush.
struct PendingPass {
    kernel: Kernel,
    params: PassParams,
    target: u64,
    sources: [Option<u64>; 2],
    groups: (u32, u32),
}

/// Compute-shader backend. Fields are storage buffers; passes are batched
/// into one submission per frame.
pub struct GpuDevice {
    context: GpuContext,
    kernels: HashMap<Kernel, wgpu::ComputePipeline>,
    kernel_layout: wgpu::BindGroupLayout,
    display_layout: wgpu::BindGroupLayout,
    display_pipeline_layout: wgpu::PipelineLayout,
    display_module: wgpu::ShaderModule,
    display_variants: VariantCache<DisplayKeywords, wgpu::RenderPipeline>,
    display_uniforms: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    params_stride: u64,
    placeholder: wgpu::Buffer,
    fields: HashMap<u64, GpuField>,
    next_id: u64,
    pending: Vec<PendingPass>,
}

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn create_params_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Pass Params"),
        size,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Everything `GpuDevice` builds up front from a context.
struct Pipelines {
    kernels: HashMap<Kernel, wgpu::ComputePipeline>,
    kernel_layout: wgpu::BindGroupLayout,
    display_layout: wgpu::BindGroupLayout,
    display_pipeline_layout: wgpu::PipelineLayout,
    display_module: wgpu::ShaderModule,
    display_uniforms: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    params_stride: u64,
    placeholder: wgpu::Buffer,
}

impl Pipelines {
    fn build(context: &GpuContext) -> FluidResult<Self> {
        context.check_fluid_support()?;
        let device = &context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let kernel_source = format!(
            "{}\n{}",
            include_str!("../../shaders/sampling.wgsl"),
            include_str!("../../shaders/fluid.wgsl")
        );
        let kernel_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Fluid Kernels"),
            source: wgpu::ShaderSource::Wgsl(kernel_source.into()),
        });

        let kernel_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Fluid Kernel Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: wgpu::BufferSize::new(PASS_PARAMS_SIZE),
                    },
                    count: None,
                },
                storage_entry(1, wgpu::ShaderStages::COMPUTE, true),
                storage_entry(2, wgpu::ShaderStages::COMPUTE, true),
                storage_entry(3, wgpu::ShaderStages::COMPUTE, false),
            ],
        });

        let kernel_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Fluid Kernel Pipeline Layout"),
            bind_group_layouts: &[&kernel_layout],
            push_constant_ranges: &[],
        });

        let kernels: HashMap<Kernel, wgpu::ComputePipeline> = Kernel::ALL
            .iter()
            .map(|&kernel| {
                let entry_point = format!("cs_{}", kernel.name());
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.name()),
                    layout: Some(&kernel_pipeline_layout),
                    module: &kernel_module,
                    entry_point: &entry_point,
                    compilation_options: Default::default(),
                    cache: None,
                });
                (kernel, pipeline)
            })
            .collect();

        let display_source = format!(
            "{}\n{}",
            include_str!("../../shaders/sampling.wgsl"),
            include_str!("../../shaders/display.wgsl")
        );
        let display_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Fluid Display"),
            source: wgpu::ShaderSource::Wgsl(display_source.into()),
        });

        let display_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Fluid Display Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, wgpu::ShaderStages::FRAGMENT, true),
            ],
        });

        let display_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Fluid Display Pipeline Layout"),
            bind_group_layouts: &[&display_layout],
            push_constant_ranges: &[],
        });

        let display_uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Display Uniforms"),
            size: std::mem::size_of::<DisplayUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let params_stride = wgpu::util::align_to(PASS_PARAMS_SIZE, alignment);
        // Room for one frame at the default solver settings.
        let params_buffer = create_params_buffer(device, params_stride * 64);

        let placeholder = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Unbound Field"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(FluidError::Unsupported(format!("pipeline creation failed: {}", error)));
        }
        log::debug!("Built {} kernel pipelines, params stride {}", Kernel::ALL.len(), params_stride);

        Ok(Self {
            kernels,
            kernel_layout,
            display_layout,
            display_pipeline_layout,
            display_module,
            display_uniforms,
            params_buffer,
            params_stride,
            placeholder,
        })
    }
}

impl GpuDevice {
    /// Builds every pipeline on `context`. On failure the context is handed
    /// back so the caller can keep presenting through it.
    pub fn try_new(context: GpuContext) -> Result<Self, (GpuContext, FluidError)> {
        let pipelines = match Pipelines::build(&context) {
            Ok(pipelines) => pipelines,
            Err(e) => return Err((context, e)),
        };
        let Pipelines {
            kernels,
            kernel_layout,
            display_layout,
            display_pipeline_layout,
            display_module,
            display_uniforms,
            params_buffer,
            params_stride,
            placeholder,
        } = pipelines;

        Ok(Self {
            context,
            kernels,
            kernel_layout,
            display_layout,
            display_pipeline_layout,
            display_module,
            display_variants: VariantCache::new(),
            display_uniforms,
            params_buffer,
            params_stride,
            placeholder,
            fields: HashMap::new(),
            next_id: 1,
            pending: Vec::new(),
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn buffer(&self, id: u64) -> FluidResult<&wgpu::Buffer> {
        self.fields.get(&id).map(|f| &f.buffer).ok_or(FluidError::UnknownField(id))
    }

    /// Encode and submit every recorded pass in order.
    pub fn flush(&mut self) -> FluidResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let needed = self.params_stride * self.pending.len() as u64;
        if needed > self.params_buffer.size() {
            self.params_buffer = create_params_buffer(&self.context.device, needed.next_power_of_two());
        }
        for (i, pass) in self.pending.iter().enumerate() {
            self.context.queue.write_buffer(
                &self.params_buffer,
                i as u64 * self.params_stride,
                bytemuck::bytes_of(&pass.params),
            );
        }

        let mut bind_groups = Vec::with_capacity(self.pending.len());
        for pass in &self.pending {
            let source = |slot: Option<u64>| match slot {
                Some(id) => self.buffer(id),
                None => Ok(&self.placeholder),
            };
            let (a, b) = (source(pass.sources[0])?, source(pass.sources[1])?);
            let dst = self.buffer(pass.target)?;
            bind_groups.push(self.context.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(pass.kernel.name()),
                layout: &self.kernel_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &self.params_buffer,
                            offset: 0,
                            size: wgpu::BufferSize::new(PASS_PARAMS_SIZE),
                        }),
                    },
                    wgpu::BindGroupEntry { binding: 1, resource: a.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: b.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 3, resource: dst.as_entire_binding() },
                ],
            }));
        }

        let mut encoder = self.context.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Fluid Step"),
        });
        for (i, (pass, bind_group)) in self.pending.iter().zip(&bind_groups).enumerate() {
            let pipeline = &self.kernels[&pass.kernel];
            let mut compute = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(pass.kernel.name()),
                timestamp_writes: None,
            });
            compute.set_pipeline(pipeline);
            compute.set_bind_group(0, bind_group, &[(i as u64 * self.params_stride) as u32]);
            compute.dispatch_workgroups(pass.groups.0, pass.groups.1, 1);
        }
        self.context.queue.submit(std::iter::once(encoder.finish()));

        log::trace!("Submitted {} fluid passes", self.pending.len());
        self.pending.clear();
        Ok(())
    }
}

/// Maps the error scope around a field's `create_buffer` to an allocation result.
fn allocation_outcome(desc: &FieldDesc, scope: Option<wgpu::Error>) -> FluidResult<()> {
    match scope {
        None => Ok(()),
        Some(error) => Err(FluidError::Allocation(format!(
            "{}x{} field: {}",
            desc.width, desc.height, error
        ))),
    }
}

fn build_display_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
    keywords: DisplayKeywords,
) -> wgpu::RenderPipeline {
    log::debug!("Building display variant {:?}", keywords);
    let constants = keywords.constants();
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("Fluid Display"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: "vs_main",
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

impl ShadingDevice for GpuDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        // Filtering is done in the shaders, so every adapter supports it.
        DeviceCapabilities { linear_filtering: true }
    }

    fn allocate(&mut self, desc: &FieldDesc) -> FluidResult<FieldHandle> {
        let size = desc.value_count() as u64 * std::mem::size_of::<f32>() as u64;
        let limits = self.context.device.limits();
        let max = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        if size == 0 || size > max {
            return Err(FluidError::Allocation(format!(
                "{}x{} field needs {} bytes, device allows {}",
                desc.width, desc.height, size, max
            )));
        }

        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fluid Field"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Err(e) = allocation_outcome(desc, pollster::block_on(device.pop_error_scope())) {
            buffer.destroy();
            return Err(e);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.fields.insert(id, GpuField { buffer, desc: *desc });
        Ok(FieldHandle::new(id))
    }

    fn release(&mut self, handle: FieldHandle) {
        // Recorded passes may still bind the buffer.
        if let Err(e) = self.flush() {
            log::warn!("Dropping recorded passes on release: {}", e);
            self.pending.clear();
        }
        match self.fields.remove(&handle.raw()) {
            Some(field) => field.buffer.destroy(),
            None => log::warn!("Released unknown field {}", handle.raw()),
        }
    }

    fn run(&mut self, pass: &Pass<'_>) -> FluidResult<()> {
        if let Some(field) = pass.aliased_field() {
            return Err(FluidError::AliasedPass { pass: pass.kernel().name(), field });
        }
        let target = pass.target();
        let [a, b] = pass.sources();
        let ids = [Some(target), a, b];
        for id in ids.into_iter().flatten().map(|f| f.handle().raw()) {
            if !self.fields.contains_key(&id) {
                return Err(FluidError::UnknownField(id));
            }
        }

        self.pending.push(PendingPass {
            kernel: pass.kernel(),
            params: PassParams::from_pass(pass),
            target: target.handle().raw(),
            sources: [a.map(|f| f.handle().raw()), b.map(|f| f.handle().raw())],
            groups: (
                (target.width() + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
                (target.height() + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
            ),
        });
        Ok(())
    }

    fn present(&mut self, dye: &GridField, display: &DisplayParams) -> FluidResult<()> {
        self.flush()?;

        let output = match self.context.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost) | Err(wgpu::SurfaceError::Outdated) => {
                self.context.reconfigure();
                return Ok(());
            }
            Err(wgpu::SurfaceError::OutOfMemory) => return Err(FluidError::OutOfMemory),
            Err(e) => {
                log::warn!("Skipping frame: {:?}", e);
                return Ok(());
            }
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let uniforms = DisplayUniforms::new(dye, display);
        self.context.queue.write_buffer(&self.display_uniforms, 0, bytemuck::bytes_of(&uniforms));

        let dye_id = dye.handle().raw();
        let dye_buffer = self.buffer(dye_id)?;
        let bind_group = self.context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Fluid Display"),
            layout: &self.display_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.display_uniforms.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: dye_buffer.as_entire_binding() },
            ],
        });

        let [r, g, b, a] = display.clear_color().map(f64::from);
        let keywords = DisplayKeywords { shading: display.shading };
        let format = self.context.surface_config.format;
        let (device, layout, module) = (&self.context.device, &self.display_pipeline_layout, &self.display_module);
        let pipeline = self
            .display_variants
            .get_or_build(keywords, |k| build_display_pipeline(device, layout, module, format, k));

        let mut encoder = self.context.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Fluid Display"),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Fluid Display"),
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
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1); // Full-screen triangle
        }
        self.context.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    fn read_field(&mut self, field: &GridField) -> FluidResult<FieldData> {
        self.flush()?;

        let id = field.handle().raw();
        let desc = self.fields.get(&id).map(|f| f.desc).ok_or(FluidError::UnknownField(id))?;
        let source = self.buffer(id)?;
        let size = source.size();

        let staging = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Field Read-back"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.context.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Field Read-back"),
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.context.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver only goes away if read-back was abandoned.
            let _ = sender.send(result);
        });
        self.context.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver.receive())
            .ok_or_else(|| FluidError::ReadBack("map callback dropped".to_string()))?
            .map_err(|e| FluidError::ReadBack(e.to_string()))?;

        let data = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&mapped).to_vec()
        };
        staging.unmap();

        Ok(FieldData { width: desc.width, height: desc.height, channels: desc.layout.channels(), data })
    }

    fn resize_surface(&mut self, size: SurfaceSize) {
        self.context.resize(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{ChannelLayout, FilterMode, Precision};

    #[test]
    fn out_of_memory_scope_becomes_allocation_error() {
        let desc = FieldDesc::new((4096, 4096), ChannelLayout::Rgba, Precision::Half, FilterMode::Linear);
        assert!(allocation_outcome(&desc, None).is_ok());

        let oom = wgpu::Error::OutOfMemory { source: Box::new(std::io::Error::other("heap exhausted")) };
        match allocation_outcome(&desc, Some(oom)) {
            Err(FluidError::Allocation(message)) => assert!(message.starts_with("4096x4096 field")),
            other => panic!("expected an allocation error, got {:?}", other),
        }
    }
}
