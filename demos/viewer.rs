//! Scene viewer for the deferred engine
//!
//! Run with:
//!   cargo run --example viewer
//!   cargo run --example viewer -- --assets ./assets --mesh models/sponza.obj
//!   cargo run --example viewer -- --headless 120
//!
//! Two cameras orbit the scene; every few seconds the view blends from one
//! to the other.

use std::path::PathBuf;

use clap::Parser;
use deferred_engine::{
    resources::{Mesh, MeshPart},
    scene::{Camera, DirectionalLight, Interpolator, PointLight, Transform},
    window::{self, LoopAction},
    Engine, EngineConfig, EngineResult, Entity, FrameOutcome, HeadlessBackend,
};
use glam::{Quat, Vec3};

#[derive(Parser, Debug)]
#[command(about = "Render a scene through the deferred pipeline")]
struct Args {
    /// Directory asset paths are resolved against
    #[arg(long, default_value = "assets")]
    assets: PathBuf,

    /// JSON engine configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// OBJ mesh to show instead of the built-in shapes
    #[arg(long)]
    mesh: Option<String>,

    /// Material descriptors for the mesh parts
    #[arg(long)]
    material: Vec<String>,

    /// Render this many frames without a window and print frame stats
    #[arg(long)]
    headless: Option<u32>,

    #[arg(long)]
    no_ssao: bool,

    #[arg(long)]
    no_fxaa: bool,

    /// Seconds between camera switches
    #[arg(long, default_value_t = 4.0)]
    blend_every: f32,
}

struct Viewer {
    engine: Engine,
    cameras: [Entity; 2],
    active: usize,
    since_switch: f32,
    blend_every: f32,
    elapsed: f32,
}

impl Viewer {
    fn new(mut engine: Engine, args: &Args) -> EngineResult<Self> {
        setup_scene(&mut engine, args)?;

        let overview = engine.spawn_camera(Camera::new(Vec3::new(0.0, 6.0, 14.0), Vec3::ZERO));
        let close_up = engine.spawn_camera(Camera::new(Vec3::new(4.0, 2.0, 4.0), Vec3::new(0.0, 0.5, 0.0)));
        engine.set_main_camera(Some(overview));

        Ok(Self {
            engine,
            cameras: [overview, close_up],
            active: 0,
            since_switch: 0.0,
            blend_every: args.blend_every.max(0.5),
            elapsed: 0.0,
        })
    }

    fn frame(&mut self, dt: f32) -> EngineResult<FrameOutcome> {
        self.elapsed += dt;
        self.since_switch += dt;
        if self.since_switch >= self.blend_every {
            self.since_switch = 0.0;
            self.active = 1 - self.active;
            let target = self.cameras[self.active];
            self.engine
                .blend_to_camera(target, self.blend_every * 0.5, Interpolator::EaseInOut);
        }

        // Slow orbit of the overview camera
        let angle = self.elapsed * 0.2;
        if let Some(mut camera) = self.engine.world_mut().get_mut::<Camera>(self.cameras[0]) {
            camera.set_position(Vec3::new(angle.sin() * 14.0, 6.0, angle.cos() * 14.0));
            camera.look_at(Vec3::ZERO);
        }

        self.engine.render(dt)
    }
}

fn setup_scene(engine: &mut Engine, args: &Args) -> EngineResult<()> {
    let materials: Vec<&str> = args.material.iter().map(String::as_str).collect();

    if let Some(mesh) = &args.mesh {
        engine.spawn_renderable(mesh, &materials, Transform::default())?;
    } else {
        engine.add_mesh("shapes/cube", Mesh::from_parts("cube", vec![MeshPart::cube()]))?;
        engine.add_mesh("shapes/sphere", Mesh::from_parts("sphere", vec![MeshPart::sphere(32, 16)]))?;
        engine.add_mesh("shapes/ground", Mesh::from_parts("ground", vec![MeshPart::plane(20.0, 20.0, 1)]))?;

        engine.spawn_renderable("shapes/ground", &[], Transform::default())?;
        for i in 0..5 {
            let x = (i as f32 - 2.0) * 2.5;
            engine.spawn_renderable(
                "shapes/cube",
                &materials,
                Transform::from_position_rotation(
                    Vec3::new(x, 0.5, -2.0),
                    Quat::from_rotation_y(i as f32 * 0.4),
                ),
            )?;
            engine.spawn_renderable(
                "shapes/sphere",
                &["builtin://materials/glass.json"],
                Transform::from_position(Vec3::new(x, 0.75, 2.0)).with_scale(Vec3::splat(0.75)),
            )?;
        }
    }

    let world = engine.world_mut();
    world.spawn(DirectionalLight::new(Vec3::new(-0.4, -1.0, -0.3), Vec3::new(1.0, 0.96, 0.9), 3.0));
    for (i, color) in [Vec3::new(1.0, 0.3, 0.2), Vec3::new(0.2, 0.5, 1.0), Vec3::new(0.3, 1.0, 0.4)]
        .into_iter()
        .enumerate()
    {
        let angle = i as f32 * std::f32::consts::TAU / 3.0;
        world.spawn((
            PointLight::new(color, 8.0, 6.0),
            Transform::from_position(Vec3::new(angle.cos() * 4.0, 1.5, angle.sin() * 4.0)),
        ));
    }
    Ok(())
}

fn load_config(args: &Args) -> EngineResult<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|err| {
                deferred_engine::EngineError::configuration("Viewer", format!("{}: {err}", path.display()))
            })?;
            EngineConfig::from_json(&json)?
        }
        None => EngineConfig::default(),
    };
    config.title = "Deferred Engine Viewer".to_string();
    config.asset_root = args.assets.clone();
    if args.no_ssao {
        config.deferred.enable_ssao = false;
    }
    if args.no_fxaa {
        config.deferred.enable_fxaa = false;
    }
    Ok(config)
}

fn run_headless(config: EngineConfig, args: &Args, frames: u32) -> EngineResult<()> {
    let backend = HeadlessBackend::new(config.width, config.height);
    let mut viewer = Viewer::new(Engine::with_backend(Box::new(backend), config)?, args)?;

    let dt = 1.0 / 60.0;
    for _ in 0..frames {
        let outcome = viewer.frame(dt)?;
        let stats = viewer.engine.stats();
        println!(
            "frame {:4} {:?}: {} solid, {} transparent draws, exposure {:.3}",
            stats.frame_index, outcome, stats.solid.draw_calls, stats.transparent.draw_calls, stats.exposure
        );
    }
    viewer.engine.shutdown();
    Ok(())
}

fn main() {
    deferred_engine::init_logging();
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Some(frames) = args.headless {
        if let Err(err) = run_headless(config, &args, frames) {
            eprintln!("Headless run failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    let (title, width, height) = (config.title.clone(), config.width, config.height);
    window::run(
        &title,
        width,
        height,
        move |window| match Engine::new(window, config).and_then(|engine| Viewer::new(engine, &args)) {
            Ok(viewer) => Some(viewer),
            Err(err) => {
                eprintln!("Failed to create engine: {err}");
                None
            }
        },
        |viewer, window, dt| {
            let Some(viewer) = viewer else {
                return LoopAction::Exit;
            };
            if let Some((width, height)) = window.take_resize() {
                if let Err(err) = viewer.engine.resize(width, height) {
                    eprintln!("Resize failed: {err}");
                    return LoopAction::Exit;
                }
            }
            match viewer.frame(dt) {
                Ok(_) => LoopAction::Continue,
                Err(err) if err.is_fatal() => {
                    eprintln!("Fatal render error: {err}");
                    LoopAction::Exit
                }
                Err(err) => {
                    log::warn!("Frame failed: {err}");
                    LoopAction::Continue
                }
            }
        },
    );
}
