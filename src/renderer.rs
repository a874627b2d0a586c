use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use log::info;

use crate::error::{CoreError, Result};
use crate::material::{Mesh, RenderMaterial};

pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24Plus;

/// GPU device handle plus the bind group layouts shared by every material.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Group 1 layout: the per-mesh transform uniform.
    pub transform_layout: wgpu::BindGroupLayout,
}

impl GpuContext {
    /// Acquires a headless GPU device. Failing to find an adapter is a
    /// resource error; callers degrade to "no particles / no shadows".
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| CoreError::Resource(format!("failed to acquire GPU adapter: {err}")))?;

        info!("using GPU adapter: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("glimmer-device"),
                ..Default::default()
            })
            .await
            .map_err(|err| CoreError::Resource(format!("failed to create GPU device: {err}")))?;

        let transform_layout = uniform_layout(&device, "transform-layout");

        Ok(Self {
            device,
            queue,
            transform_layout,
        })
    }
}

/// Bind group layout holding a single uniform buffer visible to both stages.
pub fn uniform_layout(device: &wgpu::Device, label: &str) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }],
    })
}

/// Perspective camera for the color pass.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub fov_degrees: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, Vec3::Y)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(
            self.fov_degrees.to_radians(),
            self.aspect.max(0.01),
            self.near,
            self.far,
        )
    }

    /// World-space width/height visible at the plane `z = depth`, used to
    /// scale the pointer force and the wrapping box.
    pub fn visible_size_at_depth(&self, depth: f32) -> Vec2 {
        let distance = (self.position.z - depth).abs();
        let height = 2.0 * (self.fov_degrees.to_radians() * 0.5).tan() * distance;
        Vec2::new(height * self.aspect, height)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 375.0),
            target: Vec3::ZERO,
            fov_degrees: 50.0,
            aspect: 1.0,
            near: 0.1,
            far: 1875.0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CameraUniform {
    view: [[f32; 4]; 4],
    projection: [[f32; 4]; 4],
    position: [f32; 4],
}

/// Tracks the pipeline currently bound on a render pass so redundant
/// `set_pipeline` calls are skipped.
///
/// This used to be process-wide mutable state; here it is an explicit context
/// object owned by the renderer and handed to every pass-encoding routine.
/// The depth pass must reset it before and after encoding so neither pass
/// inherits the other's selection.
#[derive(Debug, Default)]
pub struct PipelineCache {
    current: Option<u64>,
}

impl PipelineCache {
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }

    pub fn apply(&mut self, pass: &mut wgpu::RenderPass<'_>, material: &RenderMaterial) {
        if self.current != Some(material.id()) {
            pass.set_pipeline(material.pipeline());
            self.current = Some(material.id());
        }
    }
}

/// Identifies a registered before-scene hook so it can be removed exactly
/// once on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookToken(u64);

pub type BeforeRenderHook =
    Box<dyn FnMut(&GpuContext, &mut wgpu::CommandEncoder, &mut PipelineCache) + Send>;

pub type ResizeHook = Box<dyn FnMut(u32, u32, Vec2) + Send>;

/// The two per-frame encoding phases. Every tick starts in `DepthPass` and
/// transitions to `ColorPass` exactly once, after the before-scene hooks
/// have returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    DepthPass,
    ColorPass,
}

/// One entry of the color-pass draw list.
pub struct DrawItem {
    pub mesh: Arc<Mesh>,
    pub material: Arc<RenderMaterial>,
}

struct FrameTargets {
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
}

impl FrameTargets {
    fn create(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let size = wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        };
        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame-color"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame-depth"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        Self {
            color_view: color.create_view(&wgpu::TextureViewDescriptor::default()),
            depth_view: depth.create_view(&wgpu::TextureViewDescriptor::default()),
        }
    }
}

struct CameraBinding {
    layout: wgpu::BindGroupLayout,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl CameraBinding {
    fn new(ctx: &GpuContext) -> Self {
        let layout = uniform_layout(&ctx.device, "camera-layout");
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("camera-uniform"),
            size: std::mem::size_of::<CameraUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("camera-bind-group"),
            layout: &layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });
        Self {
            layout,
            buffer,
            bind_group,
        }
    }

    fn write(&self, ctx: &GpuContext, camera: &Camera) {
        let uniform = CameraUniform {
            view: camera.view().to_cols_array_2d(),
            projection: camera.projection().to_cols_array_2d(),
            position: camera.position.extend(1.0).into(),
        };
        ctx.queue
            .write_buffer(&self.buffer, 0, bytemuck::bytes_of(&uniform));
    }
}

/// Headless renderer: owns the frame targets, the camera, the ordered
/// before-scene hook list and the pipeline selection cache, and sequences
/// compute dispatch, depth pass and color pass within one submitted command
/// stream per frame.
pub struct Renderer {
    context: Option<GpuContext>,
    camera: Camera,
    camera_binding: Option<CameraBinding>,
    targets: Option<FrameTargets>,
    hooks: Vec<(HookToken, BeforeRenderHook)>,
    next_hook: u64,
    resize_hooks: Vec<ResizeHook>,
    pipeline_cache: PipelineCache,
    phase: FramePhase,
    size: (u32, u32),
}

impl Renderer {
    /// Builds a renderer over an optional device. `None` leaves the renderer
    /// in degraded mode: registrations still work, frames are no-ops.
    pub fn new(context: Option<GpuContext>, width: u32, height: u32, mut camera: Camera) -> Self {
        camera.aspect = width as f32 / height.max(1) as f32;
        let camera_binding = context.as_ref().map(CameraBinding::new);
        let targets = context
            .as_ref()
            .map(|ctx| FrameTargets::create(&ctx.device, width, height));
        Self {
            context,
            camera,
            camera_binding,
            targets,
            hooks: Vec::new(),
            next_hook: 0,
            resize_hooks: Vec::new(),
            pipeline_cache: PipelineCache::default(),
            phase: FramePhase::DepthPass,
            size: (width, height),
        }
    }

    pub fn context(&self) -> Option<&GpuContext> {
        self.context.as_ref()
    }

    pub fn require_context(&self) -> Result<&GpuContext> {
        self.context
            .as_ref()
            .ok_or_else(|| CoreError::Resource("GPU device unavailable".into()))
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Group 0 layout for color materials.
    pub fn globals_layout(&self) -> Result<&wgpu::BindGroupLayout> {
        self.camera_binding
            .as_ref()
            .map(|binding| &binding.layout)
            .ok_or_else(|| CoreError::Resource("GPU device unavailable".into()))
    }

    /// Registers a hook run before the scene's color pass each frame.
    pub fn on_before_render_scene(&mut self, hook: BeforeRenderHook) -> HookToken {
        let token = HookToken(self.next_hook);
        self.next_hook += 1;
        self.hooks.push((token, hook));
        token
    }

    /// Removes a previously registered hook; returns whether it was present.
    pub fn remove_before_render_scene(&mut self, token: HookToken) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(existing, _)| *existing != token);
        self.hooks.len() != before
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Registers a callback fired on resize with the new pixel size and the
    /// world-space size visible at the focal plane.
    pub fn on_resize(&mut self, hook: ResizeHook) {
        self.resize_hooks.push(hook);
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.size = (width, height);
        self.camera.aspect = width as f32 / height as f32;
        if let Some(ctx) = self.context.as_ref() {
            self.targets = Some(FrameTargets::create(&ctx.device, width, height));
        }
        let visible = self.camera.visible_size_at_depth(0.0);
        for hook in self.resize_hooks.iter_mut() {
            hook(width, height, visible);
        }
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Encodes and submits one frame: the compute work first, then every
    /// before-scene hook (the shadow depth pass), then the color pass over
    /// `draws`. All of it lands in a single command submission so the compute
    /// write to the live buffer is ordered before the vertex stage reads it.
    pub fn render_frame<F>(&mut self, encode_compute: F, draws: &[DrawItem]) -> Result<()>
    where
        F: FnOnce(&GpuContext, &mut wgpu::CommandEncoder),
    {
        let Self {
            context,
            camera,
            camera_binding,
            targets,
            hooks,
            pipeline_cache,
            phase,
            ..
        } = self;

        // Every frame encodes fresh render passes, so any pipeline selection
        // recorded last frame no longer holds.
        pipeline_cache.reset();

        // Degraded mode: no device, no frame.
        let Some(ctx) = context.as_ref() else {
            return Ok(());
        };
        let (Some(binding), Some(targets)) = (camera_binding.as_ref(), targets.as_ref()) else {
            return Ok(());
        };

        *phase = FramePhase::DepthPass;

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });

        encode_compute(ctx, &mut encoder);

        for (_, hook) in hooks.iter_mut() {
            hook(ctx, &mut encoder, pipeline_cache);
        }

        *phase = FramePhase::ColorPass;

        binding.write(ctx, camera);

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("color-pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &targets.color_view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: 0.03,
                        g: 0.03,
                        b: 0.05,
                        a: 1.0,
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &targets.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        pass.set_bind_group(0, &binding.bind_group, &[]);
        for item in draws {
            if !item.mesh.is_ready() {
                continue;
            }
            pipeline_cache.apply(&mut pass, &item.material);
            if let Some(resources) = item.material.resources() {
                pass.set_bind_group(2, resources, &[]);
            }
            item.mesh.encode_draw(&mut pass);
        }
        drop(pass);

        ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn degraded_renderer() -> Renderer {
        Renderer::new(None, 1280, 720, Camera::default())
    }

    #[test]
    fn hook_registry_add_then_remove_restores_length() {
        let mut renderer = degraded_renderer();
        let before = renderer.hook_count();
        let token = renderer.on_before_render_scene(Box::new(|_, _, _| {}));
        assert_eq!(renderer.hook_count(), before + 1);
        assert!(renderer.remove_before_render_scene(token));
        assert_eq!(renderer.hook_count(), before);
        // removing twice is a no-op
        assert!(!renderer.remove_before_render_scene(token));
    }

    #[test]
    fn hook_tokens_are_unique() {
        let mut renderer = degraded_renderer();
        let a = renderer.on_before_render_scene(Box::new(|_, _, _| {}));
        let b = renderer.on_before_render_scene(Box::new(|_, _, _| {}));
        assert_ne!(a, b);
        assert!(renderer.remove_before_render_scene(a));
        assert_eq!(renderer.hook_count(), 1);
    }

    #[test]
    fn degraded_frame_is_a_noop() {
        let mut renderer = degraded_renderer();
        let mut ran = false;
        renderer
            .render_frame(
                |_, _| {
                    ran = true;
                },
                &[],
            )
            .unwrap();
        assert!(!ran, "compute must not run without a device");
    }

    #[test]
    fn pipeline_cache_resets_to_empty() {
        let mut cache = PipelineCache::default();
        assert_eq!(cache.current(), None);
        cache.current = Some(7);
        cache.reset();
        assert_eq!(cache.current(), None);
    }

    #[test]
    fn render_frame_drops_last_frames_pipeline_selection() {
        // A selection surviving into the next frame would make `apply` skip
        // `set_pipeline` on a brand new pass.
        let mut renderer = degraded_renderer();
        renderer.pipeline_cache.current = Some(7);
        renderer.render_frame(|_, _| {}, &[]).unwrap();
        assert_eq!(renderer.pipeline_cache.current(), None);
    }

    #[test]
    fn resize_reports_visible_world_size() {
        let mut renderer = degraded_renderer();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec2::ZERO));
        let sink = std::sync::Arc::clone(&seen);
        renderer.on_resize(Box::new(move |_, _, visible| {
            *sink.lock() = visible;
        }));
        renderer.resize(1000, 500);
        let visible = *seen.lock();
        let expected = renderer.camera().visible_size_at_depth(0.0);
        assert_eq!(visible, expected);
        assert!((visible.x / visible.y - 2.0).abs() < 1e-4);
    }

    #[test]
    fn visible_size_grows_with_distance() {
        let camera = Camera::default();
        let near = camera.visible_size_at_depth(300.0);
        let far = camera.visible_size_at_depth(0.0);
        assert!(far.y > near.y);
        assert!(far.x > near.x);
    }
}
