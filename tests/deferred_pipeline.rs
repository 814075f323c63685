mod common;

use common::memory_cache;
use deferred_engine::assets::{Handle, ResourceCache};
use deferred_engine::backend::headless::ResourceClass;
use deferred_engine::backend::{GraphicsBackend, HeadlessBackend};
use deferred_engine::draw::DrawRegistry;
use deferred_engine::pipeline::postprocess::{target_exposure, LuminanceRange, TonemapSettings};
use deferred_engine::pipeline::{DeferredConfig, DeferredPipeline, FrameInput, FrameOutcome, GLASS_MATERIAL_PATH};
use deferred_engine::resources::{Material, Mesh};
use deferred_engine::scene::Camera;
use deferred_engine::{EngineError, World};
use glam::{Mat4, Vec3};

struct Scene {
    cache: ResourceCache,
    backend: HeadlessBackend,
    pipeline: DeferredPipeline,
    registry: DrawRegistry,
    mesh: Handle<Mesh>,
    materials: Vec<Handle<Material>>,
}

impl Scene {
    fn new(config: DeferredConfig) -> Self {
        let (cache, _io) = memory_cache();
        let mut backend = HeadlessBackend::new(320, 180);
        let pipeline = pollster::block_on(DeferredPipeline::load(&cache, &mut backend, config)).unwrap();

        let mesh = pollster::block_on(cache.fetch::<Mesh>("cube.obj")).unwrap();
        let red = pollster::block_on(cache.fetch::<Material>("materials/red.json")).unwrap();
        let glass = pollster::block_on(cache.fetch::<Material>(GLASS_MATERIAL_PATH)).unwrap();

        let mut world = World::new();
        let mut registry = DrawRegistry::new();
        registry.submit(world.spawn_empty().id(), &mesh.share(), &red.share(), Mat4::IDENTITY);
        registry.submit(
            world.spawn_empty().id(),
            &mesh.share(),
            &glass.share(),
            Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0)),
        );

        Self {
            cache,
            backend,
            pipeline,
            registry,
            mesh,
            materials: vec![red, glass],
        }
    }

    fn frame(&mut self, camera: Option<Camera>, dt: f32) -> Result<FrameOutcome, EngineError> {
        self.pipeline.begin_frame(&mut self.backend)?;
        let generated = self.pipeline.generate_frame(
            &mut self.backend,
            &mut self.registry,
            FrameInput {
                camera,
                lights: &[],
                ambient: Vec3::splat(0.1),
                dt,
            },
        );
        let ended = self.pipeline.end_frame(&mut self.backend)?;
        generated.map(|_| ended)
    }

    fn teardown(self) -> (ResourceCache, HeadlessBackend) {
        let Scene {
            cache,
            mut backend,
            pipeline,
            mesh,
            materials,
            ..
        } = self;
        pipeline.release(&mut backend);
        cache.release(mesh);
        for material in materials {
            cache.release(material);
        }
        cache.flush_unloads(&mut backend);
        (cache, backend)
    }
}

fn camera() -> Option<Camera> {
    Some(Camera::new(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO))
}

#[test]
fn passes_run_in_pipeline_order() {
    common::init_logging();
    let mut scene = Scene::new(DeferredConfig::default());
    assert_eq!(scene.frame(camera(), 1.0 / 60.0).unwrap(), FrameOutcome::Complete);

    let downsample_levels = scene.pipeline.tonemap().pyramid().level_sizes().len() - 1;
    let mut expected: Vec<String> = ["G-Buffer", "Lighting", "Transparency", "Ambient Occlusion", "Luminance Extract"]
        .into_iter()
        .map(String::from)
        .collect();
    expected.extend(std::iter::repeat("Luminance Downsample".to_string()).take(downsample_levels));
    expected.extend(["Tonemapping".to_string(), "FXAA".to_string()]);
    assert_eq!(scene.backend.pass_labels(), expected);

    let stats = scene.pipeline.stats();
    assert_eq!(stats.solid.draw_calls, 2);
    assert_eq!(stats.transparent.draw_calls, 2);
    assert_eq!(scene.backend.pass("G-Buffer").unwrap().draw_count(), 2);
    assert_eq!(scene.backend.pass("Transparency").unwrap().draw_count(), 2);
    assert_eq!(scene.backend.frames_presented(), 1);
    assert_eq!(scene.pipeline.frame_index(), 1);
}

#[test]
fn missing_camera_abandons_the_frame() {
    let mut scene = Scene::new(DeferredConfig::default());
    assert_eq!(scene.frame(None, 1.0 / 60.0).unwrap(), FrameOutcome::Aborted);

    assert!(scene.backend.passes().is_empty());
    assert_eq!(scene.backend.frames_abandoned(), 1);
    assert_eq!(scene.backend.frames_presented(), 0);
    assert_eq!(scene.pipeline.frame_index(), 1);

    assert_eq!(scene.frame(camera(), 1.0 / 60.0).unwrap(), FrameOutcome::Complete);
}

#[test]
fn exposure_holds_until_the_first_readback_then_adapts() {
    let mut scene = Scene::new(DeferredConfig::default());
    let settings = TonemapSettings::default();
    let range = LuminanceRange {
        min_log: settings.min_log_luminance,
        max_log: settings.max_log_luminance,
    };
    let luminance = 0.05f32;
    scene
        .backend
        .script_texture_contents("Luminance Average", range.encode(luminance).to_le_bytes().to_vec());

    let dt = 0.5;
    let mut exposures = Vec::new();
    for _ in 0..20 {
        scene.frame(camera(), dt).unwrap();
        exposures.push(scene.pipeline.stats().exposure);
    }

    let latency = settings.readback_latency as usize;
    for exposure in &exposures[..latency] {
        assert_eq!(*exposure, settings.initial_exposure);
    }
    let target = target_exposure(luminance);
    assert!(exposures[latency] > settings.initial_exposure);
    assert!(exposures[latency] < target);
    assert!(exposures.windows(2).skip(latency).all(|w| w[1] >= w[0]));

    let last = *exposures.last().unwrap();
    assert!((last - target).abs() / target < 0.01, "exposure {last}, target {target}");
    let measured = scene.pipeline.stats().luminance.unwrap();
    assert!((measured - luminance).abs() / luminance < 0.01, "{measured}");
}

#[test]
fn disabled_ssao_still_clears_the_occlusion_target() {
    let mut scene = Scene::new(DeferredConfig {
        enable_ssao: false,
        ..Default::default()
    });
    scene.frame(camera(), 1.0 / 60.0).unwrap();
    assert_eq!(scene.backend.pass("Ambient Occlusion").unwrap().draw_count(), 0);

    scene.backend.take_passes();
    scene.pipeline.set_ssao_enabled(true);
    scene.frame(camera(), 1.0 / 60.0).unwrap();
    assert_eq!(scene.backend.pass("Ambient Occlusion").unwrap().draw_count(), 1);
}

#[test]
fn surface_resize_recreates_targets_on_the_next_frame() {
    let mut scene = Scene::new(DeferredConfig::default());
    assert_eq!(scene.pipeline.size(), (320, 180));

    scene.backend.resize(640, 360);
    scene.frame(camera(), 1.0 / 60.0).unwrap();
    assert_eq!(scene.pipeline.size(), (640, 360));

    let hdr = scene.backend.texture_descriptor(scene.pipeline.hdr().texture()).unwrap();
    assert_eq!((hdr.width, hdr.height), (640, 360));
    assert_eq!(scene.pipeline.tonemap().pyramid().level_sizes()[0], 256);
}

#[test]
fn pass_failure_abandons_the_frame() {
    let mut scene = Scene::new(DeferredConfig::default());
    scene.backend.fail_pipelines_labelled("builtin://techniques/tonemap.json");

    let err = scene.frame(camera(), 1.0 / 60.0).unwrap_err();
    assert!(matches!(err, EngineError::Configuration { stage: "Tonemapping", .. }));
    assert_eq!(scene.backend.frames_abandoned(), 1);
    assert_eq!(scene.backend.frames_presented(), 0);
    assert_eq!(scene.pipeline.frame_index(), 1);
}

#[test]
fn tonemap_settings_swap_keeps_the_readback_latency() {
    let mut scene = Scene::new(DeferredConfig::default());
    let settings = TonemapSettings {
        gamma: 2.4,
        readback_latency: 5,
        ..Default::default()
    };
    scene.pipeline.set_tonemap_settings(&mut scene.backend, settings);

    let applied = scene.pipeline.tonemap().settings();
    assert_eq!(applied.gamma, 2.4);
    assert_eq!(applied.readback_latency, TonemapSettings::default().readback_latency);
    assert_eq!(scene.frame(camera(), 1.0 / 60.0).unwrap(), FrameOutcome::Complete);
}

#[test]
fn release_leaves_nothing_alive() {
    let mut scene = Scene::new(DeferredConfig {
        msaa_samples: 4,
        ..Default::default()
    });
    for _ in 0..3 {
        scene.frame(camera(), 1.0 / 60.0).unwrap();
    }

    let (cache, backend) = scene.teardown();
    assert_eq!(cache.stats().cached, 0);
    for class in [
        ResourceClass::Buffer,
        ResourceClass::Texture,
        ResourceClass::TextureView,
        ResourceClass::Sampler,
        ResourceClass::BindGroup,
        ResourceClass::RenderPipeline,
    ] {
        assert_eq!(backend.live_count(class), 0, "{class:?} leaked");
    }
}
