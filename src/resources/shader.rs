//! Shader program source

use futures::future::{BoxFuture, FutureExt};

use crate::assets::{Asset, AssetError, AssetResult, LoadContext, ResourceKind};

/// WGSL source holding both a `vs_main` and an `fs_main` entry point.
/// Compilation happens when a technique builds a pipeline from it.
#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub name: String,
    pub source: String,
}

impl ShaderSource {
    pub fn new(name: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
        }
    }

    pub fn has_entry_point(&self, entry: &str) -> bool {
        self.source.contains(&format!("fn {entry}("))
    }
}

impl Asset for ShaderSource {
    const KIND: ResourceKind = ResourceKind::Shader;

    fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
        async move {
            let source = String::from_utf8(bytes).map_err(|e| AssetError::decode(ctx.path(), e))?;
            let shader = ShaderSource {
                name: ctx.path().to_string(),
                source,
            };
            if !shader.has_entry_point("vs_main") {
                return Err(AssetError::decode(ctx.path(), "missing vs_main entry point"));
            }
            Ok(shader)
        }
        .boxed()
    }
}
