mod common;

use common::memory_cache;
use deferred_engine::assets::{AssetError, Handle, ResourceKind};
use deferred_engine::backend::headless::ResourceClass;
use deferred_engine::backend::HeadlessBackend;
use deferred_engine::pipeline::{DEFAULT_MATERIAL_PATH, OPAQUE_TECHNIQUE_PATH};
use deferred_engine::resources::{Material, Mesh, Technique};
use rstest::rstest;

#[rstest]
#[case(1)]
#[case(2)]
#[case(7)]
fn fetches_before_release_share_one_instance(#[case] fetches: usize) {
    let (cache, io) = memory_cache();
    let handles: Vec<Handle<Mesh>> = (0..fetches)
        .map(|_| pollster::block_on(cache.fetch::<Mesh>("cube.obj")).unwrap())
        .collect();

    assert!(handles.iter().all(|handle| Handle::ptr_eq(handle, &handles[0])));
    assert_eq!(cache.ref_count("cube.obj"), Some(fetches));
    assert_eq!(cache.kind("cube.obj"), Some(ResourceKind::Mesh));
    assert_eq!(io.read_count("cube.obj"), 1);
}

#[test]
fn mesh_stays_loaded_until_its_last_release() {
    let (cache, _io) = memory_cache();
    let mut backend = HeadlessBackend::default();

    let first = pollster::block_on(cache.fetch::<Mesh>("cube.obj")).unwrap();
    let second = pollster::block_on(cache.fetch::<Mesh>("cube.obj")).unwrap();
    assert_eq!(first.part_count(), 2);
    first.ensure_uploaded(&mut backend).unwrap();
    assert_eq!(backend.live_count(ResourceClass::Buffer), 4);

    cache.release(first);
    assert_eq!(cache.flush_unloads(&mut backend), 0);
    assert_eq!(cache.ref_count("cube.obj"), Some(1));
    assert_eq!(cache.is_gpu_resident("cube.obj"), Some(true));

    cache.release(second);
    assert_eq!(cache.flush_unloads(&mut backend), 1);
    assert_eq!(cache.stats().unloads_performed, 1);
    assert!(!cache.contains("cube.obj"));
    assert_eq!(backend.live_count(ResourceClass::Buffer), 0);
}

#[test]
fn overlapping_fetches_load_once() {
    let (cache, io) = memory_cache();
    let gate = io.hold("cube.obj");

    let (a, b, ()) = pollster::block_on(async {
        futures::join!(cache.fetch::<Mesh>("cube.obj"), cache.fetch::<Mesh>("cube.obj"), async {
            let _ = gate.send(());
        })
    });
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Handle::ptr_eq(&a, &b));
    assert_eq!(io.read_count("cube.obj"), 1);
    assert_eq!(cache.stats().loads_started, 1);
    assert_eq!(cache.ref_count("cube.obj"), Some(2));
}

#[test]
fn material_owns_its_technique_and_shader() {
    let (cache, _io) = memory_cache();
    let mut backend = HeadlessBackend::default();

    let material = pollster::block_on(cache.fetch::<Material>(DEFAULT_MATERIAL_PATH)).unwrap();
    assert_eq!(cache.dependencies(DEFAULT_MATERIAL_PATH), vec![OPAQUE_TECHNIQUE_PATH.to_string()]);
    assert_eq!(
        cache.dependencies(OPAQUE_TECHNIQUE_PATH),
        vec!["builtin://shaders/gbuffer.wgsl".to_string()]
    );
    assert_eq!(cache.kind("builtin://shaders/gbuffer.wgsl"), Some(ResourceKind::Shader));

    cache.release(material);
    assert_eq!(cache.flush_unloads(&mut backend), 3);
    assert_eq!(cache.stats().cached, 0);
}

#[test]
fn concurrent_materials_share_one_technique_load() {
    let (cache, _io) = memory_cache();
    let mut backend = HeadlessBackend::default();

    let (red, blue) = pollster::block_on(async {
        futures::join!(
            cache.fetch::<Material>("materials/red.json"),
            cache.fetch::<Material>("materials/blue.json")
        )
    });
    let (red, blue) = (red.unwrap(), blue.unwrap());

    assert!(std::sync::Arc::ptr_eq(red.technique(), blue.technique()));
    assert_eq!(cache.ref_count(OPAQUE_TECHNIQUE_PATH), Some(2));
    assert_eq!(cache.stats().loads_started, 4);

    cache.release(red);
    assert_eq!(cache.flush_unloads(&mut backend), 1);
    assert!(cache.contains(OPAQUE_TECHNIQUE_PATH));

    cache.release(blue);
    assert_eq!(cache.flush_unloads(&mut backend), 3);
}

#[test]
fn a_technique_fetched_directly_is_shared_with_materials() {
    let (cache, _io) = memory_cache();
    let technique = pollster::block_on(cache.fetch::<Technique>(OPAQUE_TECHNIQUE_PATH)).unwrap();
    let material = pollster::block_on(cache.fetch::<Material>("materials/red.json")).unwrap();

    assert!(std::sync::Arc::ptr_eq(&technique.share(), material.technique()));
    assert_eq!(cache.ref_count(OPAQUE_TECHNIQUE_PATH), Some(2));
}

#[test]
fn broken_material_surfaces_decode_error_and_leaves_nothing_behind() {
    let (cache, io) = memory_cache();
    io.insert("materials/broken.json", r#"{ "technique": "builtin://techniques/opaque.json", "roughness": "#);
    io.insert("materials/orphan.json", r#"{ "technique": "../techniques/missing.json" }"#);

    let err = pollster::block_on(cache.fetch::<Material>("materials/broken.json")).unwrap_err();
    assert!(matches!(err, AssetError::Decode { .. }));

    let err = pollster::block_on(cache.fetch::<Material>("materials/orphan.json")).unwrap_err();
    assert_eq!(err, AssetError::NotFound("techniques/missing.json".into()));

    let stats = cache.stats();
    assert_eq!(stats.cached, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.loads_failed, 3);
}

#[test]
fn mesh_requested_as_material_is_a_kind_mismatch() {
    let (cache, _io) = memory_cache();
    let _mesh = pollster::block_on(cache.fetch::<Mesh>("cube.obj")).unwrap();
    let err = pollster::block_on(cache.fetch::<Material>("cube.obj")).unwrap_err();
    assert_eq!(
        err,
        AssetError::KindMismatch {
            path: "cube.obj".into(),
            expected: ResourceKind::Material,
            found: ResourceKind::Mesh,
        }
    );
    assert_eq!(cache.ref_count("cube.obj"), Some(1));
}
