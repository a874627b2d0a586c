//! WGSL sources for the particle compute kernels and the demo materials.
//!
//! Shared struct declarations and the shadow sampling routines live in
//! chunks that the material shaders are assembled from, so the light uniform
//! layout and the PCF filter are written once.

/// Light uniform block shared by every shadow casting and receiving material.
const LIGHT_CHUNK: &str = r#"
struct Light {
    view_matrix: mat4x4<f32>,
    projection_matrix: mat4x4<f32>,
    position: vec3<f32>,
    shadow_intensity: f32,
}
"#;

/// Per-mesh transform block (model matrix plus its inverse-transpose).
const MATRICES_CHUNK: &str = r#"
struct Matrices {
    model: mat4x4<f32>,
    normal: mat4x4<f32>,
}
"#;

/// Camera uniform block written by the renderer each frame.
const CAMERA_CHUNK: &str = r#"
struct Camera {
    view: mat4x4<f32>,
    projection: mat4x4<f32>,
    position: vec3<f32>,
    _pad: f32,
}
"#;

/// Maps a world position into shadow map space: XY from light clip space to
/// [0, 1] texture space (Y flipped, texture origin is top-left), Z kept as
/// the light-space depth.
const SHADOW_POSITION_CHUNK: &str = r#"
fn get_shadow_position(light_view_proj: mat4x4<f32>, world_position: vec4<f32>) -> vec3<f32> {
    let pos_from_light = light_view_proj * world_position;
    return vec3(pos_from_light.xy * vec2(0.5, -0.5) + vec2(0.5), pos_from_light.z);
}
"#;

/// Percentage-closer filtering over a 3x3 neighborhood of the shadow map,
/// with a small bias against self-shadowing. Returns the raw average; the
/// shadow intensity clamp is applied by the caller.
const PCF_CHUNK: &str = r#"
fn pcf_shadow_visibility(shadow_position: vec3<f32>) -> f32 {
    var visibility = 0.0;
    let bias = 0.001;

    let size = f32(textureDimensions(shadow_map_depth_texture).y);
    let texel = 1.0 / size;
    for (var y = -1; y <= 1; y++) {
        for (var x = -1; x <= 1; x++) {
            let offset = vec2<f32>(vec2(x, y)) * texel;
            visibility += textureSampleCompare(
                shadow_map_depth_texture,
                depth_comparison_sampler,
                shadow_position.xy + offset,
                shadow_position.z - bias
            );
        }
    }

    return visibility / 9.0;
}
"#;

/// Compute kernels operating on the particle state store.
///
/// `seed_particles` runs once and writes the deterministic initial state into
/// both buffers; `update_particles` runs every frame, decrementing life and
/// restoring expired particles from the init template.
pub fn particle_compute() -> String {
    r#"
struct Particle {
    position: vec4<f32>,
    velocity: vec4<f32>,
}

struct SimParams {
    radius: f32,
    max_life: f32,
    delta: f32,
    force_strength: f32,
    force: vec3<f32>,
    _pad: f32,
}

@group(0) @binding(0) var<storage, read_write> init_particles: array<Particle>;
@group(0) @binding(1) var<storage, read_write> particles: array<Particle>;
@group(0) @binding(2) var<uniform> params: SimParams;

// On generating random numbers, with help of y = [(a+x)sin(bx)] mod 1,
// W.J.J. Rey, 22nd European Meeting of Statisticians 1998
fn rand11(n: f32) -> f32 { return fract(sin(n) * 43758.5453123); }

fn init_life(index: f32) -> f32 {
    return round(rand11(cos(index)) * params.max_life * 0.95) + params.max_life * 0.05;
}

const PI: f32 = 3.14159265359;

fn init_position(index: f32) -> vec3<f32> {
    // random radius in the [0.5 * params.radius, params.radius] range
    let r = (0.5 + rand11(cos(index)) * 0.5) * params.radius;
    let phi = (rand11(sin(index)) - 0.5) * PI;
    let theta = rand11(sin(cos(index) * PI)) * PI * 2.0;
    return vec3(r * cos(theta) * cos(phi), r * sin(phi), r * sin(theta) * cos(phi));
}

@compute @workgroup_size(256)
fn seed_particles(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = id.x;
    if (index >= arrayLength(&particles)) {
        return;
    }
    let fi = f32(index);
    let life = init_life(fi);
    let state = Particle(vec4(init_position(fi), life), vec4(vec3(0.0), life));
    init_particles[index] = state;
    particles[index] = state;
}

@compute @workgroup_size(256)
fn update_particles(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = id.x;
    if (index >= arrayLength(&particles)) {
        return;
    }
    let particle = particles[index];
    let life = particle.position.w - params.delta;

    if (life < 1.0) {
        // Expired: restore the seeded template for this index.
        let template = init_particles[index];
        particles[index] = Particle(template.position, vec4(vec3(0.0), template.position.w));
        return;
    }

    var velocity = particle.velocity.xyz;
    if (params.force_strength > 0.0) {
        velocity += (params.force - particle.position.xyz) * params.force_strength * params.delta;
    }
    let position = particle.position.xyz + velocity * params.delta;
    particles[index] = Particle(vec4(position, life), vec4(velocity, life));
}
"#
    .to_string()
}

/// Color material for the instanced particle quads: billboarded in view
/// space, round sprites, life-driven color mix, PCF shadow receiving.
pub fn particle_color() -> String {
    format!(
        r#"{CAMERA_CHUNK}{MATRICES_CHUNK}{LIGHT_CHUNK}
struct Shading {{
    light_color: vec3<f32>,
    dark_color: vec3<f32>,
}}

struct ParticleParams {{
    size: f32,
    max_life: f32,
}}

@group(0) @binding(0) var<uniform> camera: Camera;
@group(1) @binding(0) var<uniform> matrices: Matrices;
@group(2) @binding(0) var<uniform> shading: Shading;
@group(2) @binding(1) var<uniform> params: ParticleParams;
@group(2) @binding(2) var<uniform> light: Light;
@group(2) @binding(3) var shadow_map_depth_texture: texture_depth_2d;
@group(2) @binding(4) var depth_comparison_sampler: sampler_comparison;

{SHADOW_POSITION_CHUNK}{PCF_CHUNK}
struct VSOutput {{
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) life_fraction: f32,
    @location(2) shadow_position: vec3<f32>,
}}

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) particle_position: vec4<f32>,
    @location(3) particle_velocity: vec4<f32>,
) -> VSOutput {{
    var out: VSOutput;

    let world = matrices.model * vec4(particle_position.xyz, 1.0);

    // billboarding: offset the quad corner in view space
    var mv_position = camera.view * world;
    mv_position += vec4(position.xy * params.size, 0.0, 0.0);
    out.position = camera.projection * mv_position;

    out.uv = uv;
    out.life_fraction = clamp(particle_position.w / params.max_life, 0.0, 1.0);
    out.shadow_position =
        get_shadow_position(light.projection_matrix * light.view_matrix, world);
    return out;
}}

@fragment
fn fs_main(in: VSOutput) -> @location(0) vec4<f32> {{
    // round sprite
    if (distance(in.uv, vec2(0.5)) > 0.5) {{
        discard;
    }}

    var visibility = pcf_shadow_visibility(in.shadow_position);
    visibility = clamp(visibility, 1.0 - light.shadow_intensity, 1.0);

    let color = mix(shading.dark_color, shading.light_color, in.life_fraction);
    return vec4(color * visibility, 1.0);
}}
"#
    )
}

/// Depth-pass material for the particle quads, billboarded in light view
/// space so the sprites cast round shadows.
pub fn particle_depth() -> String {
    format!(
        r#"{LIGHT_CHUNK}{MATRICES_CHUNK}
struct ParticleParams {{
    size: f32,
    max_life: f32,
}}

@group(0) @binding(0) var<uniform> light: Light;
@group(1) @binding(0) var<uniform> matrices: Matrices;
@group(2) @binding(0) var<uniform> params: ParticleParams;

struct VSOutput {{
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}}

@vertex
fn shadow_map_vertex(
    @location(0) position: vec3<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) particle_position: vec4<f32>,
    @location(3) particle_velocity: vec4<f32>,
) -> VSOutput {{
    var out: VSOutput;
    let world = matrices.model * vec4(particle_position.xyz, 1.0);
    var light_view_position = light.view_matrix * world;
    light_view_position += vec4(position.xy * params.size, 0.0, 0.0);
    out.position = light.projection_matrix * light_view_position;
    out.uv = uv;
    return out;
}}

@fragment
fn shadow_map_fragment(in: VSOutput) {{
    if (distance(in.uv, vec2(0.5)) > 0.5) {{
        discard;
    }}
}}
"#
    )
}

/// Default depth vertex stage for shadow casters that do not override their
/// depth shaders: light projection times light view times model.
pub fn caster_depth_default() -> String {
    format!(
        r#"{LIGHT_CHUNK}{MATRICES_CHUNK}
@group(0) @binding(0) var<uniform> light: Light;
@group(1) @binding(0) var<uniform> matrices: Matrices;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {{
    return light.projection_matrix * light.view_matrix * matrices.model * vec4(position, 1.0);
}}
"#
    )
}

/// Shadow receiving wrapping box: front-face culled, Lambert shaded, dithered
/// to hide banding in the soft shadow gradient.
pub fn wrapping_box() -> String {
    format!(
        r#"{CAMERA_CHUNK}{MATRICES_CHUNK}{LIGHT_CHUNK}
struct Shading {{
    color: vec3<f32>,
}}

@group(0) @binding(0) var<uniform> camera: Camera;
@group(1) @binding(0) var<uniform> matrices: Matrices;
@group(2) @binding(0) var<uniform> shading: Shading;
@group(2) @binding(1) var<uniform> light: Light;
@group(2) @binding(2) var shadow_map_depth_texture: texture_depth_2d;
@group(2) @binding(3) var depth_comparison_sampler: sampler_comparison;

{SHADOW_POSITION_CHUNK}{PCF_CHUNK}
struct VSOutput {{
    @builtin(position) position: vec4<f32>,
    @location(0) normal: vec3<f32>,
    @location(1) world_position: vec3<f32>,
    @location(2) shadow_position: vec3<f32>,
}}

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
) -> VSOutput {{
    var out: VSOutput;
    let world = matrices.model * vec4(position, 1.0);
    out.position = camera.projection * camera.view * world;
    out.normal = normalize((matrices.normal * vec4(normal, 0.0)).xyz);
    out.world_position = world.xyz;
    out.shadow_position =
        get_shadow_position(light.projection_matrix * light.view_matrix, world);
    return out;
}}

fn apply_dithering(color: vec3<f32>, frag_coord: vec2<f32>) -> vec3<f32> {{
    let scale = 1.0 / 255.0;
    let noise = fract(sin(dot(frag_coord, vec2(12.9898, 78.233))) * 43758.5453);
    return color + vec3(noise * scale);
}}

@fragment
fn fs_main(
    in: VSOutput,
    @builtin(front_facing) front_facing: bool,
) -> @location(0) vec4<f32> {{
    // the box is rendered with front-face culling, so flip the normals
    let face_direction = select(-1.0, 1.0, front_facing);
    let normal = normalize(in.normal * face_direction);

    let light_dir = normalize(light.position - in.world_position);
    let diffuse = max(dot(normal, light_dir), 0.0);
    let ambient = 0.35;

    var visibility = pcf_shadow_visibility(in.shadow_position);
    visibility = clamp(visibility, 1.0 - light.shadow_intensity, 1.0);

    var color = (ambient + diffuse) * shading.color * visibility;
    color = apply_dithering(color, in.position.xy);
    return vec4(color, 1.0);
}}
"#
    )
}
