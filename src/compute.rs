use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use log::{debug, warn};

use crate::error::{CoreError, Result};
use crate::renderer::GpuContext;
use crate::shaders;

const WORKGROUP_SIZE: u32 = 256;
/// Bytes per particle in the storage buffers: two tightly packed vec4s.
const PARTICLE_STRIDE: u64 = 32;

fn workgroup_count(count: u32) -> u32 {
    count.div_ceil(WORKGROUP_SIZE)
}

/// CPU-side mirror of the WGSL `SimParams` uniform.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SimParamsUniform {
    radius: f32,
    max_life: f32,
    delta: f32,
    force_strength: f32,
    force: [f32; 3],
    _pad: f32,
}

/// Completion signal for the one-shot seed dispatch.
///
/// `step` is gated on this flag rather than on implicit scheduling order:
/// the seed pipeline is compiled and its dispatch submitted by
/// [`ParticleComputeEngine::begin_seed`], and the flag flips once the queue
/// reports that submission done.
pub struct SeedHandle {
    ready: Arc<AtomicBool>,
}

impl SeedHandle {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Blocks until the seed dispatch has completed on the device. Gives up
    /// if the device stops making progress; the readiness flag then stays
    /// down and `step` keeps no-opping.
    pub fn await_ready(&self, ctx: &GpuContext) {
        while !self.is_ready() {
            if ctx.device.poll(wgpu::PollType::Wait).is_err() {
                warn!("device poll failed while awaiting the seed dispatch");
                break;
            }
        }
    }
}

/// Owns the particle state store and the two compute programs over it.
///
/// The `init` buffer is written once by the seed kernel and read back only
/// as the respawn template; the `live` buffer is rewritten every frame and
/// read by the particle vertex stage as an instance-attribute source.
pub struct ParticleComputeEngine {
    count: u32,
    radius: f32,
    max_life: f32,
    init_buffer: wgpu::Buffer,
    live_buffer: Arc<wgpu::Buffer>,
    params_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    update_pipeline: wgpu::ComputePipeline,
    seed_pipeline: wgpu::ComputePipeline,
    seeded: Arc<AtomicBool>,
}

impl ParticleComputeEngine {
    pub fn new(ctx: &GpuContext, count: u32, radius: f32, max_life: f32) -> Result<Self> {
        if count == 0 {
            return Err(CoreError::Resource(
                "particle count must be greater than zero".into(),
            ));
        }
        let device = &ctx.device;
        let buffer_size = count as u64 * PARTICLE_STRIDE;

        let init_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles-init"),
            size: buffer_size,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        // The live buffer doubles as the instanced vertex buffer.
        let live_buffer = Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles-live"),
            size: buffer_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::VERTEX,
            mapped_at_creation: false,
        }));

        let params = SimParamsUniform {
            radius,
            max_life,
            delta: 1.0,
            force_strength: 0.0,
            force: [0.0; 3],
            _pad: 0.0,
        };
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles-params"),
            size: std::mem::size_of::<SimParamsUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        ctx.queue
            .write_buffer(&params_buffer, 0, bytemuck::bytes_of(&params));

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("particles-compute-layout"),
            entries: &[
                storage_entry(0),
                storage_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: std::num::NonZeroU64::new(std::mem::size_of::<
                            SimParamsUniform,
                        >() as u64),
                    },
                    count: None,
                },
            ],
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("particles-compute-bind-group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: init_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: live_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("particles-compute-shader"),
            source: wgpu::ShaderSource::Wgsl(shaders::particle_compute().into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("particles-compute-pipeline-layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let seed_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("particles-seed-pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("seed_particles"),
            compilation_options: Default::default(),
            cache: None,
        });
        let update_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("particles-update-pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("update_particles"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            count,
            radius,
            max_life,
            init_buffer,
            live_buffer,
            params_buffer,
            bind_group,
            update_pipeline,
            seed_pipeline,
            seeded: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Submits the one-shot seed dispatch and returns the readiness handle.
    ///
    /// Pipeline creation completed in `new`, so the dispatch is never
    /// submitted against an uncompiled pipeline; the handle resolves once
    /// the queue reports the submission finished. `step` stays a no-op until
    /// then.
    pub fn begin_seed(&self, ctx: &GpuContext) -> SeedHandle {
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("particles-seed-encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("particles-seed-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.seed_pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(workgroup_count(self.count), 1, 1);
        }
        ctx.queue.submit(std::iter::once(encoder.finish()));

        let flag = Arc::clone(&self.seeded);
        ctx.queue.on_submitted_work_done(move || {
            flag.store(true, Ordering::Release);
        });

        SeedHandle {
            ready: Arc::clone(&self.seeded),
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    /// Encodes one update dispatch. Returns `false` (and encodes nothing)
    /// while the seed dispatch has not completed.
    pub fn step(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        delta_frames: f32,
        force: Option<Vec3>,
        force_strength: f32,
    ) -> bool {
        if !self.is_seeded() {
            debug!("particle step skipped: seed dispatch not complete");
            return false;
        }

        let params = SimParamsUniform {
            radius: self.radius,
            max_life: self.max_life,
            delta: delta_frames,
            force_strength: if force.is_some() { force_strength } else { 0.0 },
            force: force.unwrap_or(Vec3::ZERO).to_array(),
            _pad: 0.0,
        };
        ctx.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&params));

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("particles-update-pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.update_pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.dispatch_workgroups(workgroup_count(self.count), 1, 1);
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn live_buffer(&self) -> Arc<wgpu::Buffer> {
        Arc::clone(&self.live_buffer)
    }

    /// Releases the GPU buffers. Safe to call once; the engine is unusable
    /// afterwards.
    pub fn destroy(&self) {
        self.init_buffer.destroy();
        self.live_buffer.destroy();
        self.params_buffer.destroy();
    }
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_uniform_matches_wgsl_layout() {
        // struct SimParams: four f32 scalars, then a 16-aligned vec3 + pad.
        assert_eq!(std::mem::size_of::<SimParamsUniform>(), 32);
    }

    #[test]
    fn workgroups_cover_every_particle() {
        assert_eq!(workgroup_count(1), 1);
        assert_eq!(workgroup_count(256), 1);
        assert_eq!(workgroup_count(257), 2);
        assert_eq!(workgroup_count(100_000), 391);
    }
}
