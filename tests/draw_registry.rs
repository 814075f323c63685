mod common;

use std::sync::Arc;

use common::memory_cache;
use deferred_engine::assets::{Asset, ResourceCache};
use deferred_engine::backend::*;
use deferred_engine::draw::{DrawCategory, DrawContext, DrawKeyId, DrawRegistry, PassTargets};
use deferred_engine::pipeline::{CameraBinding, GpuLayouts, GLASS_MATERIAL_PATH};
use deferred_engine::resources::{Material, Mesh};
use deferred_engine::World;
use glam::{Mat4, Vec3};
use rstest::rstest;

fn at(z: f32) -> Mat4 {
    Mat4::from_translation(Vec3::new(0.0, 0.0, -z))
}

/// Uncounted pointer to a cached resource; the test never releases it.
fn fetch<A: Asset>(cache: &ResourceCache, path: &str) -> Arc<A> {
    pollster::block_on(cache.fetch::<A>(path)).unwrap().share()
}

#[rstest]
#[case(&[10.0, 1.0, 5.0], &[1, 2, 0])]
#[case(&[3.0, 2.0, 1.0], &[2, 1, 0])]
#[case(&[1.0, 2.0, 3.0], &[0, 1, 2])]
fn solid_keys_of_one_material_draw_nearest_first(#[case] distances: &[f32], #[case] expected: &[usize]) {
    let (cache, _io) = memory_cache();
    let mesh: Arc<Mesh> = fetch(&cache, "cube.obj");
    let red: Arc<Material> = fetch(&cache, "materials/red.json");

    let mut world = World::new();
    let mut registry = DrawRegistry::new();
    let ids: Vec<DrawKeyId> = distances
        .iter()
        .map(|&z| registry.submit_part(world.spawn_empty().id(), &mesh, 1, &red, at(z)))
        .collect();

    let order = registry.draw_order(DrawCategory::Solid, Vec3::ZERO);
    let expected: Vec<DrawKeyId> = expected.iter().map(|&i| ids[i]).collect();
    assert_eq!(order, expected);
}

#[test]
fn every_part_of_a_mesh_gets_its_own_key() {
    let (cache, _io) = memory_cache();
    let mesh: Arc<Mesh> = fetch(&cache, "cube.obj");
    let blue: Arc<Material> = fetch(&cache, "materials/blue.json");

    let mut world = World::new();
    let owner = world.spawn_empty().id();
    let mut registry = DrawRegistry::new();
    let ids = registry.submit(owner, &mesh, &blue, Mat4::IDENTITY);

    assert_eq!(ids.len(), 2);
    let parts: Vec<usize> = registry.keys_of(owner).map(|key| key.part()).collect();
    assert_eq!(parts, vec![0, 1]);
    assert!(registry.keys().iter().all(|key| key.category() == DrawCategory::Solid));
}

#[test]
fn glass_sorts_far_to_near_and_stays_out_of_the_solid_pass() {
    let (cache, _io) = memory_cache();
    let mesh: Arc<Mesh> = fetch(&cache, "cube.obj");
    let glass: Arc<Material> = fetch(&cache, GLASS_MATERIAL_PATH);
    let red: Arc<Material> = fetch(&cache, "materials/red.json");

    let mut world = World::new();
    let mut registry = DrawRegistry::new();
    let near = registry.submit_part(world.spawn_empty().id(), &mesh, 0, &glass, at(2.0));
    let far = registry.submit_part(world.spawn_empty().id(), &mesh, 0, &glass, at(9.0));
    let mid = registry.submit_part(world.spawn_empty().id(), &mesh, 0, &glass, at(4.0));
    let solid = registry.submit_part(world.spawn_empty().id(), &mesh, 0, &red, at(3.0));

    assert_eq!(registry.draw_order(DrawCategory::Transparent, Vec3::ZERO), vec![far, mid, near]);
    assert_eq!(registry.draw_order(DrawCategory::Solid, Vec3::ZERO), vec![solid]);
}

#[test]
fn repeated_renders_issue_the_same_commands() {
    let (cache, _io) = memory_cache();
    let mesh: Arc<Mesh> = fetch(&cache, "cube.obj");
    let red: Arc<Material> = fetch(&cache, "materials/red.json");
    let blue: Arc<Material> = fetch(&cache, "materials/blue.json");

    let mut backend = HeadlessBackend::default();
    let layouts = GpuLayouts::new(&mut backend).unwrap();
    let camera = CameraBinding::new(&mut backend, &layouts).unwrap();
    let targets = PassTargets {
        color_formats: vec![TextureFormat::Rgba8Unorm],
        depth_format: Some(TextureFormat::Depth24PlusStencil8),
        sample_count: 1,
    };

    let mut world = World::new();
    let mut registry = DrawRegistry::new();
    for (material, z) in [(&red, 4.0), (&blue, 1.0), (&red, 2.0), (&blue, 6.0)] {
        registry.submit(world.spawn_empty().id(), &mesh, material, at(z));
    }

    let mut frames = Vec::new();
    for frame_index in 0..3 {
        backend.begin_frame().unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Solid".into()),
            color_attachments: Vec::new(),
            depth_stencil_attachment: None,
        });
        let stats = registry.render_category(
            DrawCategory::Solid,
            &mut DrawContext {
                backend: &mut backend,
                layouts: &layouts,
                camera_bind_group: camera.bind_group,
                camera_position: Vec3::ZERO,
                targets: &targets,
                frame_index,
            },
        );
        backend.end_render_pass();
        backend.end_frame().unwrap();

        assert_eq!(stats.draw_calls, 8);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.material_binds, 2);
        frames.push(backend.take_passes());
    }

    let commands: Vec<_> = frames.iter().map(|passes| passes[0].commands.clone()).collect();
    assert_eq!(commands[0], commands[1]);
    assert_eq!(commands[1], commands[2]);
}

#[test]
fn released_material_drops_its_keys_from_the_frame() {
    let (cache, _io) = memory_cache();
    let mesh = pollster::block_on(cache.fetch::<Mesh>("cube.obj")).unwrap();
    let red = pollster::block_on(cache.fetch::<Material>("materials/red.json")).unwrap();

    let mut world = World::new();
    let mut registry = DrawRegistry::new();
    registry.submit(world.spawn_empty().id(), &mesh.share(), &red.share(), at(1.0));
    assert_eq!(registry.draw_order(DrawCategory::Solid, Vec3::ZERO).len(), 2);

    let mut backend = HeadlessBackend::default();
    cache.release(red);
    cache.flush_unloads(&mut backend);

    let layouts = GpuLayouts::new(&mut backend).unwrap();
    let camera = CameraBinding::new(&mut backend, &layouts).unwrap();
    let targets = PassTargets {
        color_formats: vec![TextureFormat::Rgba8Unorm],
        depth_format: None,
        sample_count: 1,
    };
    backend.begin_frame().unwrap();
    backend.begin_render_pass(&RenderPassDescriptor {
        label: Some("Solid".into()),
        color_attachments: Vec::new(),
        depth_stencil_attachment: None,
    });
    let stats = registry.render_category(
        DrawCategory::Solid,
        &mut DrawContext {
            backend: &mut backend,
            layouts: &layouts,
            camera_bind_group: camera.bind_group,
            camera_position: Vec3::ZERO,
            targets: &targets,
            frame_index: 0,
        },
    );
    assert_eq!(stats.draw_calls, 0);
    assert_eq!(stats.skipped, 2);
}
