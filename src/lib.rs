//! GPU resident particle simulation with shadow mapped rendering.
//!
//! The crate exposes the building blocks of a shadowed particles scene: a
//! compute engine that seeds and advances one hundred thousand particles
//! entirely on the GPU, a shadow map manager that renders casters into a
//! depth-only target from an orthographic light, and a headless renderer
//! that sequences compute, depth pass and color pass inside a single
//! command submission per frame.  A CPU reference simulation mirrors the
//! compute kernels so the particle behavior stays testable without a GPU.

pub mod compute;
pub mod error;
pub mod material;
pub mod renderer;
pub mod scene;
pub mod shaders;
pub mod shadow;
pub mod sim;

pub use compute::{ParticleComputeEngine, SeedHandle};
pub use error::{CoreError, Result};
pub use material::{Geometry, MaterialParams, Mesh, RenderMaterial, UniformBinding};
pub use renderer::{Camera, DrawItem, FramePhase, GpuContext, HookToken, PipelineCache, Renderer};
pub use scene::{FrameInfo, ParticlesScene, SceneConfig};
pub use shadow::{ActiveMaterial, CasterParams, DepthShaderOverride, LightConfig, ShadowMap};
pub use sim::{Particle, ParticleSim};
