#![allow(dead_code)]

use std::sync::Arc;

use deferred_engine::assets::{MemoryAssetIo, OverlayAssetIo, ResourceCache};
use deferred_engine::pipeline::builtin_files;

/// Unit cube as two OBJ objects: the top face and the rest.
pub const CUBE_OBJ: &str = "\
o top
v -0.5 0.5 -0.5
v 0.5 0.5 -0.5
v 0.5 0.5 0.5
v -0.5 0.5 0.5
f 1 3 2
f 1 4 3
o sides
v -0.5 -0.5 -0.5
v 0.5 -0.5 -0.5
v 0.5 -0.5 0.5
v -0.5 -0.5 0.5
v -0.5 0.5 -0.5
v 0.5 0.5 -0.5
v 0.5 0.5 0.5
v -0.5 0.5 0.5
f 5 6 7
f 5 7 8
f 5 9 10
f 5 10 6
f 6 10 11
f 6 11 7
f 7 11 12
f 7 12 8
f 8 12 9
f 8 9 5
";

pub const RED_MATERIAL: &str = r#"{
    "technique": "builtin://techniques/opaque.json",
    "base_color": [0.9, 0.1, 0.1, 1.0],
    "roughness": 0.4
}"#;

pub const BLUE_MATERIAL: &str = r#"{
    "technique": "builtin://techniques/opaque.json",
    "base_color": [0.1, 0.2, 0.9, 1.0],
    "metallic": 1.0
}"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Cache serving the built-in files plus whatever the test puts in `io`.
pub fn memory_cache() -> (ResourceCache, Arc<MemoryAssetIo>) {
    init_logging();
    let io = Arc::new(
        MemoryAssetIo::new()
            .with_file("cube.obj", CUBE_OBJ)
            .with_file("materials/red.json", RED_MATERIAL)
            .with_file("materials/blue.json", BLUE_MATERIAL),
    );
    let cache = ResourceCache::new(OverlayAssetIo::new(builtin_files(), io.clone()));
    (cache, io)
}
