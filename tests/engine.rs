mod common;

use common::memory_cache;
use deferred_engine::assets::ResourceCache;
use deferred_engine::pipeline::DEFAULT_MATERIAL_PATH;
use deferred_engine::resources::{Mesh, MeshPart};
use deferred_engine::scene::{Camera, Interpolator, PointLight, Transform};
use deferred_engine::{Engine, EngineConfig, EngineError, FrameOutcome, HeadlessBackend, Renderable};
use glam::Vec3;

const DT: f32 = 1.0 / 60.0;

fn engine() -> (Engine, ResourceCache) {
    let (cache, _io) = memory_cache();
    let config = EngineConfig {
        width: 320,
        height: 180,
        ..Default::default()
    };
    let engine = Engine::with_cache(Box::new(HeadlessBackend::new(320, 180)), cache.clone(), config).unwrap();
    (engine, cache)
}

fn with_camera(engine: &mut Engine) {
    let camera = engine.spawn_camera(Camera::new(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO));
    engine.set_main_camera(Some(camera));
}

#[test]
fn spawned_mesh_is_drawn_every_frame() {
    let (mut engine, cache) = engine();
    with_camera(&mut engine);
    engine
        .world_mut()
        .spawn((PointLight::new(Vec3::ONE, 4.0, 5.0), Transform::from_position(Vec3::Y * 2.0)));

    let entity = engine
        .spawn_renderable("cube.obj", &["materials/red.json"], Transform::default())
        .unwrap();
    assert_eq!(engine.registry().len(), 2);
    assert_eq!(cache.ref_count("cube.obj"), Some(1));

    for frame in 0..3 {
        assert_eq!(engine.render(DT).unwrap(), FrameOutcome::Complete);
        let stats = engine.stats();
        assert_eq!(stats.frame_index, frame);
        assert_eq!(stats.solid.draw_calls, 2);
        assert_eq!(stats.transparent.draw_calls, 0);
    }

    let renderable = engine.world().get::<Renderable>(entity).unwrap();
    assert_eq!(renderable.mesh().path(), "cube.obj");
    assert_eq!(renderable.materials().len(), 1);
}

#[test]
fn frames_without_a_camera_are_aborted() {
    let (mut engine, _cache) = engine();
    engine.spawn_renderable("cube.obj", &[], Transform::default()).unwrap();
    assert_eq!(engine.render(DT).unwrap(), FrameOutcome::Aborted);

    with_camera(&mut engine);
    assert_eq!(engine.render(DT).unwrap(), FrameOutcome::Complete);
}

#[test]
fn empty_material_list_uses_the_default_material() {
    let (mut engine, cache) = engine();
    let entity = engine.spawn_renderable("cube.obj", &[], Transform::default()).unwrap();

    let renderable = engine.world().get::<Renderable>(entity).unwrap();
    assert_eq!(renderable.materials()[0].path(), DEFAULT_MATERIAL_PATH);
    assert_eq!(cache.ref_count(DEFAULT_MATERIAL_PATH), Some(1));
}

#[test]
fn despawn_withdraws_draws_and_releases_resources() {
    let (mut engine, cache) = engine();
    with_camera(&mut engine);
    let first = engine
        .spawn_renderable("cube.obj", &["materials/red.json"], Transform::default())
        .unwrap();
    let second = engine
        .spawn_renderable(
            "cube.obj",
            &["materials/red.json", "materials/blue.json"],
            Transform::from_position(Vec3::X * 3.0),
        )
        .unwrap();
    assert_eq!(cache.ref_count("cube.obj"), Some(2));
    engine.render(DT).unwrap();
    assert_eq!(engine.stats().solid.draw_calls, 4);

    assert!(engine.despawn(first));
    assert_eq!(cache.ref_count("cube.obj"), Some(1));
    assert_eq!(cache.ref_count("materials/red.json"), Some(1));
    engine.render(DT).unwrap();
    assert_eq!(engine.stats().solid.draw_calls, 2);

    assert!(engine.despawn(second));
    assert!(!engine.despawn(second));
    engine.render(DT).unwrap();
    assert!(!cache.contains("cube.obj"));
    assert!(!cache.contains("materials/blue.json"));
    assert_eq!(cache.stats().pending_unloads, 0);
    assert!(engine.registry().is_empty());
}

#[test]
fn failed_spawn_is_reported_and_leaves_nothing_behind() {
    let (mut engine, cache) = engine();
    with_camera(&mut engine);

    let err = engine
        .spawn_renderable("cube.obj", &["materials/red.json", "materials/missing.json"], Transform::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::Asset(_)));
    assert!(!err.is_fatal());
    assert!(!cache.contains("cube.obj"));
    assert!(!cache.contains("materials/red.json"));
    assert!(engine.registry().is_empty());

    assert_eq!(engine.render(DT).unwrap(), FrameOutcome::Complete);
    assert_eq!(cache.stats().pending_unloads, 0);
}

#[test]
fn camera_blend_is_half_way_after_half_its_duration() {
    let (mut engine, _cache) = engine();
    let near = engine.spawn_camera(Camera::new(Vec3::new(0.0, 1.0, 4.0), Vec3::ZERO));
    let far = engine.spawn_camera(Camera::new(Vec3::new(0.0, 6.0, 16.0), Vec3::ZERO));
    engine.set_main_camera(Some(near));
    engine.blend_to_camera(far, 2.0, Interpolator::Linear);

    for _ in 0..4 {
        engine.render(0.25).unwrap();
    }
    let applied = engine.mixer().applied_weight(far).unwrap();
    assert!((applied - 0.5).abs() < 1e-4, "applied {applied}");

    for _ in 0..8 {
        engine.render(0.25).unwrap();
    }
    assert_eq!(engine.mixer().applied_weight(far), Some(1.0));
    assert_eq!(engine.mixer().default_weight(), 0.0);
}

#[test]
fn paused_blend_without_a_main_camera_aborts_the_frame() {
    let (mut engine, _cache) = engine();
    let shot = engine.spawn_camera(Camera::new(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO));
    engine.blend_to_camera(shot, 1.0, Interpolator::Linear);

    assert_eq!(engine.render(0.0).unwrap(), FrameOutcome::Aborted);
    assert_eq!(engine.render(0.5).unwrap(), FrameOutcome::Complete);
}

#[test]
fn despawning_the_main_camera_aborts_until_another_is_set() {
    let (mut engine, _cache) = engine();
    let camera = engine.spawn_camera(Camera::new(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO));
    engine.set_main_camera(Some(camera));
    assert_eq!(engine.render(DT).unwrap(), FrameOutcome::Complete);

    assert!(engine.despawn(camera));
    assert_eq!(engine.mixer().default_camera(), None);
    assert_eq!(engine.render(DT).unwrap(), FrameOutcome::Aborted);
}

#[test]
fn resize_reaches_the_pipeline() {
    let (mut engine, _cache) = engine();
    engine.resize(640, 480).unwrap();
    assert_eq!(engine.pipeline().size(), (640, 480));

    engine.resize(0, 0).unwrap();
    assert_eq!(engine.pipeline().size(), (640, 480));
}

#[test]
fn shutdown_unloads_everything() {
    let (mut engine, cache) = engine();
    with_camera(&mut engine);
    engine
        .add_mesh("shapes/sphere", Mesh::from_parts("sphere", vec![MeshPart::sphere(8, 6)]))
        .unwrap();
    engine.spawn_renderable("shapes/sphere", &[], Transform::default()).unwrap();
    engine
        .spawn_renderable("cube.obj", &["materials/blue.json"], Transform::default())
        .unwrap();
    engine.render(DT).unwrap();
    assert!(cache.stats().cached > 0);

    engine.shutdown();
    let stats = cache.stats();
    assert_eq!(stats.cached, 0);
    assert_eq!(stats.pending_unloads, 0);
    assert_eq!(stats.unloads_performed, stats.loads_started - stats.loads_failed + 2);
}
