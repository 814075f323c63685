//! Engine-level error taxonomy.
//!
//! Configuration and numeric blend errors are fatal for the frame loop; asset
//! errors surface to whoever requested the load. Transient per-draw problems
//! are never errors, see [`crate::draw::SkipReason`].

use thiserror::Error;

use crate::assets::AssetError;
use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A pass or stage is missing something it cannot run without.
    #[error("Configuration error in {stage}: {message}")]
    Configuration { stage: &'static str, message: String },

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The camera mixer produced a NaN blend ratio, usually a zero-length blend.
    #[error("Camera blend ratio for {camera:?} is not a number")]
    NonFiniteBlend { camera: bevy_ecs::entity::Entity },
}

impl EngineError {
    pub fn configuration(stage: &'static str, message: impl Into<String>) -> Self {
        EngineError::Configuration {
            stage,
            message: message.into(),
        }
    }

    /// Errors after which the frame loop must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Configuration { .. } | EngineError::NonFiniteBlend { .. } => true,
            EngineError::Backend(err) => matches!(err, BackendError::DeviceLost),
            EngineError::Asset(_) => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_fatal() {
        let err = EngineError::configuration("G-Buffer", "missing layout");
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Configuration error in G-Buffer: missing layout"
        );
    }

    #[test]
    fn asset_errors_are_not_fatal() {
        let err: EngineError = AssetError::NotFound("cube.obj".into()).into();
        assert!(!err.is_fatal());
    }
}
