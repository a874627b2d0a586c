use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::material::{MaterialParams, Mesh, RenderMaterial, UniformBinding};
use crate::renderer::{uniform_layout, GpuContext, HookToken, PipelineCache, Renderer};
use crate::shaders;

pub const DEFAULT_DEPTH_TEXTURE_SIZE: u32 = 1024;
pub const SHADOW_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24Plus;
/// Depth bias subtracted from the fragment's light-space depth before the
/// shadow comparison, against self-shadowing acne.
pub const SHADOW_BIAS: f32 = 0.001;

/// Orthographic directional light: a view frustum box looking from
/// `position` toward `target`, plus how dark its shadows may get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightConfig {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
    pub top: f32,
    pub near: f32,
    pub far: f32,
    /// Caps shadow darkness: 0 disables shadows, 1 allows full black.
    pub shadow_intensity: f32,
}

impl LightConfig {
    /// Light placement used by the demo scene, derived from the camera
    /// distance: offset above and beside the camera, frustum wide enough to
    /// cover the visible volume.
    pub fn for_camera_distance(distance: f32) -> Self {
        Self {
            position: Vec3::new(distance, distance * 0.5, distance),
            target: Vec3::ZERO,
            up: Vec3::Y,
            left: distance * -1.05,
            right: distance * 1.05,
            bottom: distance * -1.05,
            top: distance * 1.05,
            near: 0.1,
            far: distance * 5.0,
            shadow_intensity: 0.75,
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::orthographic_rh(
            self.left, self.right, self.bottom, self.top, self.near, self.far,
        )
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LightUniform {
    view: [[f32; 4]; 4],
    projection: [[f32; 4]; 4],
    position: [f32; 3],
    shadow_intensity: f32,
}

/// Maps a world position into shadow map space: XY into [0, 1] texture
/// coordinates (Y flipped, texture origin is top-left), Z the light-space
/// depth. CPU mirror of the WGSL `get_shadow_position`.
pub fn shadow_space_position(light_view_proj: Mat4, world: Vec3) -> Vec3 {
    let pos_from_light = light_view_proj * world.extend(1.0);
    Vec3::new(
        pos_from_light.x * 0.5 + 0.5,
        pos_from_light.y * -0.5 + 0.5,
        pos_from_light.z,
    )
}

/// Percentage-closer filtered visibility, CPU mirror of the WGSL
/// `pcf_shadow_visibility` plus the shadow intensity clamp.
///
/// Samples a 3x3 texel neighborhood through `depth_at` (the stored shadow
/// map depth at a texture coordinate), compares against the fragment depth
/// minus [`SHADOW_BIAS`] with less-or-equal semantics, averages the boolean
/// results, then clamps the average into `[1 - shadow_intensity, 1]`.
pub fn pcf_visibility<F>(
    shadow_position: Vec3,
    texture_size: f32,
    shadow_intensity: f32,
    depth_at: F,
) -> f32
where
    F: Fn(f32, f32) -> f32,
{
    let texel = 1.0 / texture_size;
    let mut visibility: f32 = 0.0;
    for y in -1i32..=1 {
        for x in -1i32..=1 {
            let u = shadow_position.x + x as f32 * texel;
            let v = shadow_position.y + y as f32 * texel;
            if shadow_position.z - SHADOW_BIAS <= depth_at(u, v) {
                visibility += 1.0;
            }
        }
    }
    visibility /= 9.0;
    visibility.clamp(1.0 - shadow_intensity, 1.0)
}

/// Which material a shadow caster is currently bound to. Outside the depth
/// pass window every caster must read `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveMaterial {
    Normal,
    Casting,
}

/// Registration record for one shadow casting mesh.
///
/// The caster keeps both materials and an explicit tag instead of mutating
/// the mesh's own material slot, so ownership of the swap stays with the
/// shadow map manager.
pub struct ShadowCaster {
    mesh: Arc<Mesh>,
    casting_material: RenderMaterial,
    normal_material: Arc<RenderMaterial>,
    active: ActiveMaterial,
}

impl ShadowCaster {
    /// Material matching the current tag: the depth material inside the
    /// shadow pass window, the mesh's own material everywhere else.
    fn current_material(&self) -> &RenderMaterial {
        match self.active {
            ActiveMaterial::Casting => &self.casting_material,
            ActiveMaterial::Normal => self.normal_material.as_ref(),
        }
    }
}

/// Optional overrides for a caster's depth material.
#[derive(Default)]
pub struct CasterParams {
    /// Replacement depth shader; `None` selects the default depth-only
    /// vertex stage (light projection x light view x model x position).
    pub shader: Option<DepthShaderOverride>,
    /// Extra uniform bindings for the depth material's resource group.
    pub bindings: Vec<Arc<UniformBinding>>,
}

pub struct DepthShaderOverride {
    pub source: String,
    pub vertex_entry: &'static str,
    pub fragment_entry: Option<&'static str>,
}

struct ShadowMapInner {
    texture: wgpu::Texture,
    depth_view: Arc<wgpu::TextureView>,
    comparison_sampler: Arc<wgpu::Sampler>,
    light_binding: Arc<UniformBinding>,
    light_layout: wgpu::BindGroupLayout,
    light_bind_group: wgpu::BindGroup,
    light_view: Mat4,
    light_projection: Mat4,
    config: LightConfig,
    texture_size: u32,
    casters: Mutex<Vec<ShadowCaster>>,
}

/// Owns the light, the depth-only render target and the caster registry,
/// and encodes the shadow depth pass from its before-scene hook.
pub struct ShadowMap {
    inner: Arc<ShadowMapInner>,
    hook: Option<HookToken>,
}

impl ShadowMap {
    /// Computes the light matrices, allocates the fixed-size depth texture
    /// and comparison sampler, and registers the per-frame depth pass hook.
    pub fn new(renderer: &mut Renderer, texture_size: u32, config: LightConfig) -> Result<Self> {
        let ctx = renderer.require_context()?;
        let device = &ctx.device;

        let light_view = config.view_matrix();
        let light_projection = config.projection_matrix();
        let uniform = LightUniform {
            view: light_view.to_cols_array_2d(),
            projection: light_projection.to_cols_array_2d(),
            position: config.position.to_array(),
            shadow_intensity: config.shadow_intensity.clamp(0.0, 1.0),
        };
        let light_binding = Arc::new(UniformBinding::new(
            ctx,
            "light",
            bytemuck::bytes_of(&uniform),
        ));

        let light_layout = uniform_layout(device, "light-layout");
        let light_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("light-bind-group"),
            layout: &light_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: light_binding.buffer().as_entire_binding(),
            }],
        });

        // Fixed resolution, independent of the viewport.
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("shadow-map-depth-texture"),
            size: wgpu::Extent3d {
                width: texture_size,
                height: texture_size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SHADOW_DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let depth_view = Arc::new(texture.create_view(&wgpu::TextureViewDescriptor::default()));

        // Shadow space is bounded, so clamp instead of wrapping.
        let comparison_sampler = Arc::new(device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("depth-comparison-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        }));

        let inner = Arc::new(ShadowMapInner {
            texture,
            depth_view,
            comparison_sampler,
            light_binding,
            light_layout,
            light_bind_group,
            light_view,
            light_projection,
            config,
            texture_size,
            casters: Mutex::new(Vec::new()),
        });

        let hook_inner = Arc::clone(&inner);
        let hook = renderer.on_before_render_scene(Box::new(move |_, encoder, cache| {
            hook_inner.encode_depth_pass(encoder, cache);
        }));

        Ok(Self {
            inner,
            hook: Some(hook),
        })
    }

    /// Builds the caster's depth material (empty color-target set, default
    /// depth vertex stage unless overridden) and appends it to the registry.
    pub fn add_shadow_casting_mesh(
        &self,
        ctx: &GpuContext,
        mesh: Arc<Mesh>,
        normal_material: Arc<RenderMaterial>,
        extra: CasterParams,
    ) -> Result<()> {
        if !mesh.has_transform() {
            return Err(CoreError::Configuration(format!(
                "mesh '{}' lacks the transform binding required by its depth material",
                mesh.label()
            )));
        }

        let (shader, vertex_entry, fragment_entry) = match extra.shader {
            Some(depth_shader) => (
                depth_shader.source,
                depth_shader.vertex_entry,
                depth_shader.fragment_entry,
            ),
            None => (shaders::caster_depth_default(), "vs_main", None),
        };

        let mut params = MaterialParams::new(
            &format!("{}-depth-material", mesh.label()),
            shader,
        );
        params.vertex_entry = vertex_entry;
        params.fragment_entry = fragment_entry;
        // depth-only: no color targets
        params.color_format = None;
        params.depth_format = SHADOW_DEPTH_FORMAT;
        params.bindings = extra.bindings;

        let casting_material =
            RenderMaterial::new(ctx, &self.inner.light_layout, mesh.geometry(), &params);

        self.inner.casters.lock().push(ShadowCaster {
            mesh,
            casting_material,
            normal_material,
            active: ActiveMaterial::Normal,
        });
        Ok(())
    }

    /// Appends the depth texture, the comparison sampler and the light
    /// uniform to a material's binding lists.
    ///
    /// Appends unconditionally: patching the same params twice duplicates
    /// the entries and shifts binding indices. Callers must patch a material
    /// exactly once unless duplication is intended.
    pub fn patch_shadow_receiving_parameters(&self, params: &mut MaterialParams) {
        params.textures.push(Arc::clone(&self.inner.depth_view));
        params.samplers.push(Arc::clone(&self.inner.comparison_sampler));
        params.bindings.push(Arc::clone(&self.inner.light_binding));
    }

    /// Combined light view-projection, for CPU-side shadow queries.
    pub fn light_view_projection(&self) -> Mat4 {
        self.inner.light_projection * self.inner.light_view
    }

    pub fn config(&self) -> &LightConfig {
        &self.inner.config
    }

    pub fn texture_size(&self) -> u32 {
        self.inner.texture_size
    }

    pub fn caster_count(&self) -> usize {
        self.inner.casters.lock().len()
    }

    /// Snapshot of each caster's active material tag, in registration order.
    pub fn caster_states(&self) -> Vec<ActiveMaterial> {
        self.inner.casters.lock().iter().map(|c| c.active).collect()
    }

    /// Encodes the depth pass immediately. Normally this runs from the
    /// registered before-scene hook; exposed for driving the pass directly
    /// in tests.
    pub fn encode_depth_pass(&self, encoder: &mut wgpu::CommandEncoder, cache: &mut PipelineCache) {
        self.inner.encode_depth_pass(encoder, cache);
    }

    /// Deregisters the hook and releases the depth target. The hook is
    /// removed at most once; calling `destroy` again is a no-op.
    pub fn destroy(&mut self, renderer: &mut Renderer) {
        if let Some(token) = self.hook.take() {
            renderer.remove_before_render_scene(token);
            self.inner.casters.lock().clear();
            self.inner.texture.destroy();
        }
    }
}

impl ShadowMapInner {
    fn encode_depth_pass(&self, encoder: &mut wgpu::CommandEncoder, cache: &mut PipelineCache) {
        let mut casters = self.casters.lock();
        if casters.is_empty() {
            return;
        }

        // Bind every caster to its depth material for the duration of the
        // pass, and drop any pipeline selection left over from the previous
        // frame's color pass.
        for caster in casters.iter_mut() {
            caster.active = ActiveMaterial::Casting;
        }
        cache.reset();

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("shadow-depth-pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_bind_group(0, &self.light_bind_group, &[]);
            for caster in casters.iter() {
                if !caster.mesh.is_ready() {
                    continue;
                }
                cache.apply(&mut pass, caster.current_material());
                if let Some(resources) = caster.current_material().resources() {
                    pass.set_bind_group(2, resources, &[]);
                }
                caster.mesh.encode_draw(&mut pass);
            }
        }

        // Symmetric un-swap, then reset the selection again so the color
        // pass does not inherit the depth pass's last bound pipeline.
        for caster in casters.iter_mut() {
            caster.active = ActiveMaterial::Normal;
        }
        cache.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_light() -> LightConfig {
        LightConfig::for_camera_distance(375.0)
    }

    #[test]
    fn light_view_maps_position_to_origin() {
        let light = test_light();
        let eye = light.view_matrix() * light.position.extend(1.0);
        assert!(eye.truncate().length() < 1e-3, "eye not at origin: {eye}");
    }

    #[test]
    fn light_projection_maps_frustum_center_inside_clip_space() {
        let light = test_light();
        let view_proj = light.projection_matrix() * light.view_matrix();
        let clip = view_proj * light.target.extend(1.0);
        assert!(clip.x.abs() <= 1.0);
        assert!(clip.y.abs() <= 1.0);
        assert!((0.0..=1.0).contains(&clip.z), "depth {} out of range", clip.z);
    }

    #[test]
    fn shadow_space_flips_y_and_rescales_xy() {
        // Identity "projection": clip coords pass through.
        let center = shadow_space_position(Mat4::IDENTITY, Vec3::new(0.0, 0.0, 0.25));
        assert_eq!(center, Vec3::new(0.5, 0.5, 0.25));
        let top_right = shadow_space_position(Mat4::IDENTITY, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(top_right, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn unoccluded_point_is_fully_lit() {
        let visibility = pcf_visibility(Vec3::new(0.5, 0.5, 0.4), 1024.0, 0.75, |_, _| 1.0);
        assert_eq!(visibility, 1.0);
    }

    #[test]
    fn fully_occluded_point_clamps_to_intensity_floor() {
        let visibility = pcf_visibility(Vec3::new(0.5, 0.5, 0.9), 1024.0, 0.75, |_, _| 0.1);
        assert!((visibility - 0.25).abs() < 1e-6);
    }

    #[test]
    fn zero_intensity_disables_shadowing() {
        let visibility = pcf_visibility(Vec3::new(0.5, 0.5, 0.9), 1024.0, 0.0, |_, _| 0.0);
        assert_eq!(visibility, 1.0);
    }

    #[test]
    fn visibility_is_monotonic_in_occluder_coverage() {
        // Occlude an increasing number of the nine samples.
        let mut previous = f32::INFINITY;
        for occluded in 0..=9 {
            let counter = std::cell::Cell::new(0);
            let visibility = pcf_visibility(Vec3::new(0.5, 0.5, 0.9), 3.0, 1.0, |_, _| {
                let index = counter.get();
                counter.set(index + 1);
                if index < occluded {
                    0.0
                } else {
                    1.0
                }
            });
            assert_eq!(counter.get(), 9);
            assert!(visibility <= previous);
            previous = visibility;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn bias_forgives_matching_depths() {
        // Stored depth exactly equals the fragment depth: the bias plus the
        // less-or-equal compare keep the surface lit.
        let depth = 0.631;
        let visibility = pcf_visibility(Vec3::new(0.5, 0.5, depth), 1024.0, 1.0, |_, _| depth);
        assert_eq!(visibility, 1.0);
    }
}
