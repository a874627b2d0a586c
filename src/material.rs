use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use wgpu::util::DeviceExt;

use crate::renderer::GpuContext;

/// Uniform buffer plus the metadata needed to splice it into a bind group.
///
/// Bindings are shared between materials through `Arc` (the particle params
/// buffer, for instance, feeds both the depth and the color material).
pub struct UniformBinding {
    label: String,
    buffer: wgpu::Buffer,
    size: u64,
}

impl UniformBinding {
    pub fn new(ctx: &GpuContext, label: &str, contents: &[u8]) -> Self {
        let buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        Self {
            label: label.to_string(),
            buffer,
            size: contents.len() as u64,
        }
    }

    pub fn write(&self, ctx: &GpuContext, contents: &[u8]) {
        ctx.queue.write_buffer(&self.buffer, 0, contents);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    fn layout_entry(&self, binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(self.size),
            },
            count: None,
        }
    }
}

/// One vertex buffer and its attribute layout.
pub struct VertexStream {
    pub buffer: Arc<wgpu::Buffer>,
    pub stride: u64,
    pub step_mode: wgpu::VertexStepMode,
    pub attributes: Vec<wgpu::VertexAttribute>,
}

/// Vertex/index buffers plus instance count for a drawable mesh.
pub struct Geometry {
    pub streams: Vec<VertexStream>,
    index: Option<wgpu::Buffer>,
    index_count: u32,
    instance_count: u32,
}

impl Geometry {
    /// Unit quad (positions and UVs), two triangles.
    pub fn quad(ctx: &GpuContext) -> Self {
        Self::indexed(ctx, "quad", QUAD_VERTICES, QUAD_INDICES, QUAD_LAYOUT)
    }

    /// Unit box with per-face normals.
    pub fn cube(ctx: &GpuContext) -> Self {
        Self::indexed(ctx, "cube", CUBE_VERTICES, CUBE_INDICES, CUBE_LAYOUT)
    }

    fn indexed(
        ctx: &GpuContext,
        label: &str,
        vertices: &[f32],
        indices: &[u32],
        layout: &[wgpu::VertexFormat],
    ) -> Self {
        let vertex = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}-vertices")),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}-indices")),
                contents: bytemuck::cast_slice(indices),
                usage: wgpu::BufferUsages::INDEX,
            });

        let mut attributes = Vec::new();
        let mut offset = 0;
        for (location, format) in layout.iter().enumerate() {
            attributes.push(wgpu::VertexAttribute {
                format: *format,
                offset,
                shader_location: location as u32,
            });
            offset += format.size();
        }

        Self {
            streams: vec![VertexStream {
                buffer: Arc::new(vertex),
                stride: offset,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes,
            }],
            index: Some(index),
            index_count: indices.len() as u32,
            instance_count: 1,
        }
    }

    /// Adds an instance-stepped stream reading two `vec4` attributes per
    /// instance straight out of the live particle buffer. The stream starts
    /// at the shader location after the existing per-vertex attributes.
    pub fn with_particle_instances(mut self, buffer: Arc<wgpu::Buffer>, count: u32) -> Self {
        let base = self
            .streams
            .iter()
            .map(|stream| stream.attributes.len() as u32)
            .sum::<u32>();
        self.streams.push(VertexStream {
            buffer,
            stride: 32,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: vec![
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x4,
                    offset: 0,
                    shader_location: base,
                },
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x4,
                    offset: 16,
                    shader_location: base + 1,
                },
            ],
        });
        self.instance_count = count;
        self
    }

    fn vertex_layouts(&self) -> Vec<wgpu::VertexBufferLayout<'_>> {
        self.streams
            .iter()
            .map(|stream| wgpu::VertexBufferLayout {
                array_stride: stream.stride,
                step_mode: stream.step_mode,
                attributes: &stream.attributes,
            })
            .collect()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct TransformUniform {
    model: [[f32; 4]; 4],
    normal: [[f32; 4]; 4],
}

/// Model matrix binding shared by every material a mesh is drawn with.
pub struct ModelBinding {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl ModelBinding {
    fn new(ctx: &GpuContext, label: &str, model: Mat4) -> Self {
        let uniform = transform_uniform(model);
        let buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}-transform")),
                contents: bytemuck::bytes_of(&uniform),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{label}-transform-bind-group")),
            layout: &ctx.transform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });
        Self { buffer, bind_group }
    }

    fn write(&self, ctx: &GpuContext, model: Mat4) {
        let uniform = transform_uniform(model);
        ctx.queue
            .write_buffer(&self.buffer, 0, bytemuck::bytes_of(&uniform));
    }
}

fn transform_uniform(model: Mat4) -> TransformUniform {
    TransformUniform {
        model: model.to_cols_array_2d(),
        normal: model.inverse().transpose().to_cols_array_2d(),
    }
}

/// A drawable mesh: geometry, transform binding and a readiness flag checked
/// by the depth pass before issuing draws.
pub struct Mesh {
    label: String,
    geometry: Geometry,
    transform: Option<ModelBinding>,
    ready: AtomicBool,
}

impl Mesh {
    pub fn new(ctx: &GpuContext, label: &str, geometry: Geometry, model: Mat4) -> Self {
        Self {
            label: label.to_string(),
            transform: Some(ModelBinding::new(ctx, label, model)),
            geometry,
            ready: AtomicBool::new(true),
        }
    }

    /// Mesh with no transform binding; rejected by the shadow caster
    /// registration, which depends on it.
    pub fn without_transform(label: &str, geometry: Geometry) -> Self {
        Self {
            label: label.to_string(),
            geometry,
            transform: None,
            ready: AtomicBool::new(true),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    pub fn set_model(&self, ctx: &GpuContext, model: Mat4) {
        if let Some(transform) = &self.transform {
            transform.write(ctx, model);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Encodes the draw for this mesh. The pipeline, globals group and
    /// material resource group must already be bound.
    pub fn encode_draw(&self, pass: &mut wgpu::RenderPass<'_>) {
        let Some(transform) = &self.transform else {
            return;
        };
        pass.set_bind_group(1, &transform.bind_group, &[]);
        for (slot, stream) in self.geometry.streams.iter().enumerate() {
            pass.set_vertex_buffer(slot as u32, stream.buffer.slice(..));
        }
        match &self.geometry.index {
            Some(index) => {
                pass.set_index_buffer(index.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(
                    0..self.geometry.index_count,
                    0,
                    0..self.geometry.instance_count,
                );
            }
            None => pass.draw(0..self.geometry.index_count, 0..self.geometry.instance_count),
        }
    }
}

/// Everything needed to build a render material.
///
/// `bindings`, `textures` and `samplers` become group 2 in declaration
/// order: buffers first, then texture views, then samplers. The shadow map
/// manager appends its depth texture, comparison sampler and light binding
/// to these lists when a material is patched for shadow receiving.
pub struct MaterialParams {
    pub label: String,
    pub shader: String,
    pub vertex_entry: &'static str,
    pub fragment_entry: Option<&'static str>,
    pub color_format: Option<wgpu::TextureFormat>,
    pub depth_format: wgpu::TextureFormat,
    pub cull_mode: Option<wgpu::Face>,
    pub bindings: Vec<Arc<UniformBinding>>,
    pub textures: Vec<Arc<wgpu::TextureView>>,
    pub samplers: Vec<Arc<wgpu::Sampler>>,
}

impl MaterialParams {
    pub fn new(label: &str, shader: String) -> Self {
        Self {
            label: label.to_string(),
            shader,
            vertex_entry: "vs_main",
            fragment_entry: Some("fs_main"),
            color_format: Some(crate::renderer::COLOR_FORMAT),
            depth_format: crate::renderer::DEPTH_FORMAT,
            cull_mode: None,
            bindings: Vec::new(),
            textures: Vec::new(),
            samplers: Vec::new(),
        }
    }
}

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

/// Compiled render pipeline plus its resource bind group.
pub struct RenderMaterial {
    id: u64,
    label: String,
    pipeline: wgpu::RenderPipeline,
    resources: Option<wgpu::BindGroup>,
}

impl RenderMaterial {
    /// Builds the pipeline for `geometry` drawn with `params`, with group 0
    /// taken from `globals_layout` (the camera for color materials, the
    /// light for depth materials) and group 1 the shared transform layout.
    pub fn new(
        ctx: &GpuContext,
        globals_layout: &wgpu::BindGroupLayout,
        geometry: &Geometry,
        params: &MaterialParams,
    ) -> Self {
        let device = &ctx.device;
        let label = params.label.clone();

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("{label}-shader")),
            source: wgpu::ShaderSource::Wgsl(params.shader.as_str().into()),
        });

        let has_resources = !params.bindings.is_empty()
            || !params.textures.is_empty()
            || !params.samplers.is_empty();

        let resource_layout = has_resources.then(|| {
            let mut entries = Vec::new();
            let mut binding = 0;
            for uniform in &params.bindings {
                entries.push(uniform.layout_entry(binding));
                binding += 1;
            }
            for _ in &params.textures {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                });
                binding += 1;
            }
            for _ in &params.samplers {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                    count: None,
                });
                binding += 1;
            }
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{label}-resource-layout")),
                entries: &entries,
            })
        });

        let resources = resource_layout.as_ref().map(|layout| {
            let mut entries = Vec::new();
            let mut binding = 0;
            for uniform in &params.bindings {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: uniform.buffer.as_entire_binding(),
                });
                binding += 1;
            }
            for texture in &params.textures {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: wgpu::BindingResource::TextureView(texture),
                });
                binding += 1;
            }
            for sampler in &params.samplers {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
                binding += 1;
            }
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{label}-resources")),
                layout,
                entries: &entries,
            })
        });

        let mut group_layouts = vec![globals_layout, &ctx.transform_layout];
        if let Some(layout) = resource_layout.as_ref() {
            group_layouts.push(layout);
        }
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label}-pipeline-layout")),
            bind_group_layouts: &group_layouts,
            push_constant_ranges: &[],
        });

        let vertex_layouts = geometry.vertex_layouts();
        let targets = params
            .color_format
            .map(|format| {
                vec![Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })]
            })
            .unwrap_or_default();

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&label),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some(params.vertex_entry),
                compilation_options: Default::default(),
                buffers: &vertex_layouts,
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: params.cull_mode,
                polygon_mode: wgpu::PolygonMode::Fill,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: params.depth_format,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: Default::default(),
                bias: Default::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: params.fragment_entry.map(|entry_point| wgpu::FragmentState {
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                targets: &targets,
            }),
            multiview: None,
            cache: None,
        });

        Self {
            id: NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed),
            label,
            pipeline,
            resources,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pipeline(&self) -> &wgpu::RenderPipeline {
        &self.pipeline
    }

    pub fn resources(&self) -> Option<&wgpu::BindGroup> {
        self.resources.as_ref()
    }
}

const QUAD_LAYOUT: &[wgpu::VertexFormat] =
    &[wgpu::VertexFormat::Float32x3, wgpu::VertexFormat::Float32x2];

const QUAD_VERTICES: &[f32] = &[
    // positions      // uvs
    -1.0, -1.0, 0.0, 0.0, 1.0, //
    1.0, -1.0, 0.0, 1.0, 1.0, //
    1.0, 1.0, 0.0, 1.0, 0.0, //
    -1.0, 1.0, 0.0, 0.0, 0.0,
];

const QUAD_INDICES: &[u32] = &[0, 1, 2, 0, 2, 3];

const CUBE_LAYOUT: &[wgpu::VertexFormat] =
    &[wgpu::VertexFormat::Float32x3, wgpu::VertexFormat::Float32x3];

const CUBE_VERTICES: &[f32] = &[
    // positions        // normals
    -0.5, -0.5, 0.5, 0.0, 0.0, 1.0, 0.5, -0.5, 0.5, 0.0, 0.0, 1.0, 0.5, 0.5, 0.5, 0.0, 0.0, 1.0,
    -0.5, 0.5, 0.5, 0.0, 0.0, 1.0, -0.5, -0.5, -0.5, 0.0, 0.0, -1.0, 0.5, -0.5, -0.5, 0.0, 0.0,
    -1.0, 0.5, 0.5, -0.5, 0.0, 0.0, -1.0, -0.5, 0.5, -0.5, 0.0, 0.0, -1.0, -0.5, -0.5, -0.5, -1.0,
    0.0, 0.0, -0.5, -0.5, 0.5, -1.0, 0.0, 0.0, -0.5, 0.5, 0.5, -1.0, 0.0, 0.0, -0.5, 0.5, -0.5,
    -1.0, 0.0, 0.0, 0.5, -0.5, -0.5, 1.0, 0.0, 0.0, 0.5, -0.5, 0.5, 1.0, 0.0, 0.0, 0.5, 0.5, 0.5,
    1.0, 0.0, 0.0, 0.5, 0.5, -0.5, 1.0, 0.0, 0.0, -0.5, -0.5, -0.5, 0.0, -1.0, 0.0, 0.5, -0.5,
    -0.5, 0.0, -1.0, 0.0, 0.5, -0.5, 0.5, 0.0, -1.0, 0.0, -0.5, -0.5, 0.5, 0.0, -1.0, 0.0, -0.5,
    0.5, -0.5, 0.0, 1.0, 0.0, 0.5, 0.5, -0.5, 0.0, 1.0, 0.0, 0.5, 0.5, 0.5, 0.0, 1.0, 0.0, -0.5,
    0.5, 0.5, 0.0, 1.0, 0.0,
];

const CUBE_INDICES: &[u32] = &[
    0, 1, 2, 0, 2, 3, // front
    4, 6, 5, 4, 7, 6, // back
    8, 9, 10, 8, 10, 11, // left
    12, 14, 13, 12, 15, 14, // right
    16, 18, 17, 16, 19, 18, // bottom
    20, 21, 22, 20, 22, 23, // top
];
