//! Deferred Engine - the rendering core of a real-time 3D engine
//!
//! - Reference-counted, path-addressed resource cache with asynchronous loads
//!   shared between concurrent requesters
//! - Draw submission registry sorting and batching per-part draw keys
//! - Deferred pipeline: G-buffer, light accumulation with skybox, blended
//!   transparency, SSAO, tone mapping with automatic exposure, FXAA
//! - Camera blend mixer over Bevy ECS camera entities
//!
//! Two backends implement [`backend::GraphicsBackend`]: **wgpu** for real
//! windows and a **headless** recorder for offscreen runs and tests.

pub mod assets;
pub mod backend;
pub mod draw;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod window;

use std::path::PathBuf;

use serde::Deserialize;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use backend::headless::HeadlessBackend;
pub use backend::wgpu_backend::WgpuBackend;
pub use engine::{Engine, Renderable};
pub use error::{EngineError, EngineResult};
pub use pipeline::{DeferredConfig, FrameOutcome, FrameStats};
pub use window::Window;

/// Configuration for initializing the engine
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Directory relative asset paths are read from
    pub asset_root: PathBuf,
    pub deferred: DeferredConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Deferred Engine".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            asset_root: PathBuf::from("assets"),
            deferred: DeferredConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration; missing fields keep their defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| EngineError::configuration("Engine", format!("invalid configuration: {err}")))?;
        config.deferred.validate()?;
        Ok(config)
    }
}

/// Install `env_logger`, honouring `RUST_LOG` and defaulting to `info`.
/// Calling it more than once is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "title": "Viewer", "asset_root": "scenes/atrium", "deferred": { "enable_fxaa": false } }"#,
        )
        .unwrap();
        assert_eq!(config.title, "Viewer");
        assert_eq!(config.width, 1280);
        assert_eq!(config.asset_root, PathBuf::from("scenes/atrium"));
        assert!(!config.deferred.enable_fxaa);
        assert!(config.deferred.enable_ssao);
    }

    #[test]
    fn invalid_configuration_is_fatal() {
        let err = EngineConfig::from_json(r#"{ "deferred": { "msaa_samples": 6 } }"#).unwrap_err();
        assert!(err.is_fatal());

        let err = EngineConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, EngineError::Configuration { stage: "Engine", .. }));
    }
}
