use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::compute::ParticleComputeEngine;
use crate::error::{CoreError, Result};
use crate::material::{Geometry, MaterialParams, Mesh, RenderMaterial, UniformBinding};
use crate::renderer::{DrawItem, Renderer};
use crate::shaders;
use crate::shadow::{CasterParams, DepthShaderOverride, LightConfig, ShadowMap};

/// Scene tuning knobs, loadable from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub particle_count: u32,
    /// Spawn shell radius; seeded radii fall in `[radius / 2, radius]`.
    pub radius: f32,
    /// Upper bound of the seeded lifetime, in frames.
    pub max_life: f32,
    pub particle_size: f32,
    pub depth_texture_size: u32,
    pub shadow_intensity: f32,
    /// Pointer attraction strength fed to the update kernel while a pointer
    /// is active.
    pub force_strength: f32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            particle_count: 100_000,
            radius: 50.0,
            max_life: 60.0,
            particle_size: 0.7,
            depth_texture_size: 1024,
            shadow_intensity: 0.75,
            force_strength: 0.3,
        }
    }
}

/// Per-frame timing handed to [`ParticlesScene::on_render`]. A value of 1.0
/// means one nominal frame elapsed.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub delta_frames: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ParticleParamsUniform {
    size: f32,
    max_life: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ParticleShadingUniform {
    light_color: [f32; 3],
    _pad0: f32,
    dark_color: [f32; 3],
    _pad1: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BoxShadingUniform {
    color: [f32; 3],
    _pad: f32,
}

/// Model matrix for the wrapping box: a unit cube stretched to the visible
/// plane and pushed back so its open front face sits at `z = 0`.
fn wrapping_box_model(visible: Vec2, radius: f32) -> Mat4 {
    let depth = radius * 3.0;
    Mat4::from_translation(Vec3::new(0.0, 0.0, -depth * 0.5))
        * Mat4::from_scale(Vec3::new(visible.x, visible.y, depth))
}

struct SceneGpu {
    engine: ParticleComputeEngine,
    shadow_map: ShadowMap,
    particle_mesh: Arc<Mesh>,
    particle_material: Arc<RenderMaterial>,
    particle_params: Arc<UniformBinding>,
    box_mesh: Arc<Mesh>,
    box_material: Arc<RenderMaterial>,
    applied_visible: Vec2,
}

/// The shadowed particles scene: owns the compute engine, the shadow map and
/// the two drawables, and sequences them through the renderer each frame.
///
/// All GPU state lives behind an `Option`; without a device the scene accepts
/// every call and does nothing.
pub struct ParticlesScene {
    config: SceneConfig,
    visible: bool,
    pointer_target: Option<Vec3>,
    pointer_world: Vec3,
    visible_size: Arc<Mutex<Vec2>>,
    gpu: Option<SceneGpu>,
}

impl ParticlesScene {
    pub fn new(config: SceneConfig) -> Self {
        Self {
            config,
            visible: true,
            pointer_target: None,
            pointer_world: Vec3::ZERO,
            visible_size: Arc::new(Mutex::new(Vec2::ZERO)),
            gpu: None,
        }
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.gpu.is_some()
    }

    /// Builds every GPU resource: the compute engine (seeded and awaited),
    /// the shadow map, the instanced particle mesh with its color and depth
    /// materials, and the wrapping box.
    ///
    /// The whole setup runs inside a validation error scope; any shader or
    /// pipeline validation failure tears the partial state back down and
    /// surfaces as a compile error.
    pub async fn setup_webgpu(&mut self, renderer: &mut Renderer) -> Result<()> {
        if renderer.context().is_none() {
            warn!("no GPU device, scene runs degraded");
            return Ok(());
        }

        let device = renderer.require_context()?.device.clone();
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut light = LightConfig::for_camera_distance(renderer.camera().position.z);
        light.shadow_intensity = self.config.shadow_intensity;
        let shadow_map = ShadowMap::new(renderer, self.config.depth_texture_size, light)?;

        let visible = renderer.camera().visible_size_at_depth(0.0);
        *self.visible_size.lock() = visible;

        let gpu = {
            let ctx = renderer.require_context()?;
            let globals = renderer.globals_layout()?;

            let engine = ParticleComputeEngine::new(
                ctx,
                self.config.particle_count,
                self.config.radius,
                self.config.max_life,
            )?;
            let seed = engine.begin_seed(ctx);
            seed.await_ready(ctx);
            info!("seeded {} particles", engine.count());

            let geometry =
                Geometry::quad(ctx).with_particle_instances(engine.live_buffer(), engine.count());
            let particle_mesh = Arc::new(Mesh::new(ctx, "particles", geometry, Mat4::IDENTITY));

            // Shared between the color and the depth material.
            let particle_params = Arc::new(UniformBinding::new(
                ctx,
                "particle-params",
                bytemuck::bytes_of(&ParticleParamsUniform {
                    size: self.config.particle_size,
                    max_life: self.config.max_life,
                }),
            ));
            let particle_shading = Arc::new(UniformBinding::new(
                ctx,
                "particle-shading",
                bytemuck::bytes_of(&ParticleShadingUniform {
                    light_color: [0.95, 0.75, 0.45],
                    _pad0: 0.0,
                    dark_color: [0.08, 0.05, 0.2],
                    _pad1: 0.0,
                }),
            ));

            let mut color_params =
                MaterialParams::new("particles-color-material", shaders::particle_color());
            color_params.bindings =
                vec![Arc::clone(&particle_shading), Arc::clone(&particle_params)];
            shadow_map.patch_shadow_receiving_parameters(&mut color_params);
            let particle_material = Arc::new(RenderMaterial::new(
                ctx,
                globals,
                particle_mesh.geometry(),
                &color_params,
            ));

            // The particles cast shadows too, with their own billboarded
            // depth stage so the sprites stay round from the light's view.
            shadow_map.add_shadow_casting_mesh(
                ctx,
                Arc::clone(&particle_mesh),
                Arc::clone(&particle_material),
                CasterParams {
                    shader: Some(DepthShaderOverride {
                        source: shaders::particle_depth(),
                        vertex_entry: "shadow_map_vertex",
                        fragment_entry: Some("shadow_map_fragment"),
                    }),
                    bindings: vec![Arc::clone(&particle_params)],
                },
            )?;

            let box_mesh = Arc::new(Mesh::new(
                ctx,
                "wrapping-box",
                Geometry::cube(ctx),
                wrapping_box_model(visible, self.config.radius),
            ));
            let box_shading = Arc::new(UniformBinding::new(
                ctx,
                "box-shading",
                bytemuck::bytes_of(&BoxShadingUniform {
                    color: [0.18, 0.2, 0.35],
                    _pad: 0.0,
                }),
            ));
            let mut box_params =
                MaterialParams::new("wrapping-box-material", shaders::wrapping_box());
            // Seen from inside, so cull the faces pointing at the camera.
            box_params.cull_mode = Some(wgpu::Face::Front);
            box_params.bindings = vec![box_shading];
            shadow_map.patch_shadow_receiving_parameters(&mut box_params);
            let box_material = Arc::new(RenderMaterial::new(
                ctx,
                globals,
                box_mesh.geometry(),
                &box_params,
            ));

            SceneGpu {
                engine,
                shadow_map,
                particle_mesh,
                particle_material,
                particle_params,
                box_mesh,
                box_material,
                applied_visible: visible,
            }
        };

        if let Some(error) = device.pop_error_scope().await {
            let mut gpu = gpu;
            gpu.engine.destroy();
            gpu.shadow_map.destroy(renderer);
            return Err(CoreError::Compile(format!(
                "scene material validation failed: {error}"
            )));
        }

        let sink = Arc::clone(&self.visible_size);
        renderer.on_resize(Box::new(move |_, _, visible| {
            *sink.lock() = visible;
        }));

        self.gpu = Some(gpu);
        Ok(())
    }

    /// Releases every GPU resource and deregisters the shadow map hook.
    /// Calling this twice, or without a prior setup, is a no-op.
    pub fn destroy_webgpu(&mut self, renderer: &mut Renderer) {
        if let Some(mut gpu) = self.gpu.take() {
            gpu.shadow_map.destroy(renderer);
            gpu.engine.destroy();
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Sets the pointer attraction target from normalized screen coordinates
    /// in `[-0.5, 0.5]` on both axes, mapped onto the `z = 0` focal plane.
    pub fn set_pointer(&mut self, normalized: Vec2) {
        let visible = *self.visible_size.lock();
        self.pointer_target = Some(Vec3::new(
            normalized.x * visible.x,
            normalized.y * visible.y,
            0.0,
        ));
    }

    pub fn clear_pointer(&mut self) {
        self.pointer_target = None;
    }

    /// Updates the particle sprite size without rebuilding materials; the
    /// params buffer is shared by the color and depth pipelines.
    pub fn set_particle_size(&mut self, renderer: &Renderer, size: f32) {
        self.config.particle_size = size;
        if let (Some(gpu), Some(ctx)) = (self.gpu.as_ref(), renderer.context()) {
            gpu.particle_params.write(
                ctx,
                bytemuck::bytes_of(&ParticleParamsUniform {
                    size,
                    max_life: self.config.max_life,
                }),
            );
        }
    }

    /// Eases the tracked pointer halfway toward its target and returns the
    /// eased world position, or `None` while no pointer is active.
    fn eased_pointer(&mut self) -> Option<Vec3> {
        let target = self.pointer_target?;
        self.pointer_world = self.pointer_world.lerp(target, 0.5);
        Some(self.pointer_world)
    }

    /// Encodes and submits one frame: particle update dispatch, shadow depth
    /// pass (via the shadow map's registered hook) and the color pass drawing
    /// the particles and the wrapping box.
    pub fn on_render(&mut self, renderer: &mut Renderer, frame: FrameInfo) -> Result<()> {
        if !self.visible {
            return Ok(());
        }
        let force = self.eased_pointer();
        let Some(gpu) = self.gpu.as_mut() else {
            return Ok(());
        };

        // Track resizes: the wrapping box follows the visible plane.
        let visible = *self.visible_size.lock();
        if visible != gpu.applied_visible && visible != Vec2::ZERO {
            let ctx = renderer.require_context()?;
            gpu.box_mesh
                .set_model(ctx, wrapping_box_model(visible, self.config.radius));
            gpu.applied_visible = visible;
        }

        let draws = [
            DrawItem {
                mesh: Arc::clone(&gpu.particle_mesh),
                material: Arc::clone(&gpu.particle_material),
            },
            DrawItem {
                mesh: Arc::clone(&gpu.box_mesh),
                material: Arc::clone(&gpu.box_material),
            },
        ];

        let engine = &gpu.engine;
        let strength = self.config.force_strength;
        renderer.render_frame(
            |ctx, encoder| {
                engine.step(ctx, encoder, frame.delta_frames, force, strength);
            },
            &draws,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_demo_tuning() {
        let config = SceneConfig::default();
        assert_eq!(config.particle_count, 100_000);
        assert_eq!(config.radius, 50.0);
        assert_eq!(config.max_life, 60.0);
        assert_eq!(config.depth_texture_size, 1024);
        assert!((config.shadow_intensity - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn wrapping_box_front_face_sits_at_origin_plane() {
        let model = wrapping_box_model(Vec2::new(400.0, 300.0), 50.0);
        // Unit cube front face center is (0, 0, 0.5).
        let front = model * Vec3::new(0.0, 0.0, 0.5).extend(1.0);
        assert!(front.z.abs() < 1e-4, "front face at z = {}", front.z);
        // Horizontal extent matches the visible width.
        let right = model * Vec3::new(0.5, 0.0, 0.5).extend(1.0);
        assert!((right.x - 200.0).abs() < 1e-3);
        // Back face sits three radii behind the front.
        let back = model * Vec3::new(0.0, 0.0, -0.5).extend(1.0);
        assert!((back.z + 150.0).abs() < 1e-3);
    }

    #[test]
    fn pointer_eases_halfway_per_frame() {
        let mut scene = ParticlesScene::new(SceneConfig::default());
        *scene.visible_size.lock() = Vec2::new(100.0, 100.0);
        scene.set_pointer(Vec2::new(0.5, 0.0));
        assert_eq!(scene.eased_pointer(), Some(Vec3::new(25.0, 0.0, 0.0)));
        assert_eq!(scene.eased_pointer(), Some(Vec3::new(37.5, 0.0, 0.0)));
        scene.clear_pointer();
        assert_eq!(scene.eased_pointer(), None);
    }

    #[test]
    fn pointer_maps_normalized_coordinates_to_world() {
        let mut scene = ParticlesScene::new(SceneConfig::default());
        *scene.visible_size.lock() = Vec2::new(800.0, 600.0);
        scene.set_pointer(Vec2::new(-0.5, 0.5));
        assert_eq!(scene.pointer_target, Some(Vec3::new(-400.0, 300.0, 0.0)));
    }
}
