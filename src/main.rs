use std::env;

use anyhow::{anyhow, Context, Result};
use pollster::block_on;

use glimmer_runtime::{
    Camera, FrameInfo, GpuContext, ParticleSim, ParticlesScene, Renderer, SceneConfig,
};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = CliOptions::parse()?;
    let config = SceneConfig {
        particle_count: options.particles,
        radius: options.radius,
        max_life: options.max_life,
        ..SceneConfig::default()
    };

    if options.reference {
        run_reference(&config, options.frames)
    } else {
        run_gpu(config, options.frames)
    }
}

/// CPU reference mode: runs the simulation that mirrors the compute kernels
/// and prints a deterministic summary.
fn run_reference(config: &SceneConfig, frames: u32) -> Result<()> {
    println!(
        "Simulating {} particles for {} frames (reference mode)",
        config.particle_count, frames
    );

    let mut sim = ParticleSim::new(config.particle_count as usize, config.radius, config.max_life)
        .context("failed to build the reference simulation")?;
    sim.seed();

    let mut respawned = 0usize;
    for _ in 0..frames {
        respawned += sim.step(1.0, None, 0.0);
    }

    println!("Respawned {respawned} particles over {frames} frames");
    Ok(())
}

fn run_gpu(config: SceneConfig, frames: u32) -> Result<()> {
    let context = match block_on(GpuContext::new()) {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            eprintln!("{err}; running degraded (try --reference for the CPU simulation)");
            None
        }
    };
    let degraded = context.is_none();

    let mut renderer = Renderer::new(context, 1280, 720, Camera::default());
    let mut scene = ParticlesScene::new(config);
    block_on(scene.setup_webgpu(&mut renderer)).context("scene setup failed")?;

    for _ in 0..frames {
        scene.on_render(&mut renderer, FrameInfo { delta_frames: 1.0 })?;
    }
    scene.destroy_webgpu(&mut renderer);

    if degraded {
        println!("No GPU device; nothing was rendered");
    } else {
        println!("Rendered {frames} frames");
    }
    Ok(())
}

struct CliOptions {
    particles: u32,
    frames: u32,
    radius: f32,
    max_life: f32,
    reference: bool,
}

impl CliOptions {
    fn parse() -> Result<Self> {
        let defaults = SceneConfig::default();
        let mut options = Self {
            particles: defaults.particle_count,
            frames: 60,
            radius: defaults.radius,
            max_life: defaults.max_life,
            reference: false,
        };

        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--particles" => options.particles = parse_value(&mut args, "--particles")?,
                "--frames" => options.frames = parse_value(&mut args, "--frames")?,
                "--radius" => options.radius = parse_value(&mut args, "--radius")?,
                "--max-life" => options.max_life = parse_value(&mut args, "--max-life")?,
                "--reference" => options.reference = true,
                other => {
                    return Err(anyhow!(
                        "Unknown argument: {other}. Usage: glimmer-runtime \
                         [--particles N] [--frames N] [--radius R] [--max-life L] [--reference]"
                    ));
                }
            }
        }
        Ok(options)
    }
}

fn parse_value<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = args
        .next()
        .ok_or_else(|| anyhow!("{flag} expects a value"))?;
    value
        .parse()
        .with_context(|| format!("invalid value for {flag}: {value}"))
}
