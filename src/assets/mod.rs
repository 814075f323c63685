//! Reference-counted resource cache
//!
//! Every resource is addressed by a path and loaded at most once: concurrent
//! fetches of the same path share a single in-flight load, later fetches get
//! the cached instance and bump its reference count. Resources record the
//! paths they depend on; releasing the last reference of a resource releases
//! its dependencies and queues its GPU data for unloading on the render thread.

mod cache;
mod handle;
mod io;

pub use cache::{CacheStats, LoadContext, ResourceCache};
pub use handle::Handle;
pub use io::{AssetIo, FileAssetIo, MemoryAssetIo, OverlayAssetIo};

use futures::future::BoxFuture;
use thiserror::Error;

use crate::backend::{BackendResult, GraphicsBackend};

/// Kind tag of a cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Mesh,
    Material,
    Technique,
    Texture,
    Cubemap,
    Shader,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssetError {
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("Failed to decode {path}: {message}")]
    Decode { path: String, message: String },
    #[error("A different resource is already registered under {0}")]
    Conflict(String),
    #[error("{path} is cached as {found:?}, requested as {expected:?}")]
    KindMismatch {
        path: String,
        expected: ResourceKind,
        found: ResourceKind,
    },
    #[error("Dependency cycle through {0}")]
    DependencyCycle(String),
}

impl AssetError {
    pub fn decode(path: impl Into<String>, message: impl ToString) -> Self {
        AssetError::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type AssetResult<T> = Result<T, AssetError>;

/// A resource type the cache knows how to load.
pub trait Asset: Send + Sync + Sized + 'static {
    const KIND: ResourceKind;

    /// Decode the resource from its bytes. Dependencies are fetched through `ctx`,
    /// which records them against this resource.
    fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>>;

    /// Whether GPU objects have been created for this resource.
    fn is_gpu_resident(&self) -> bool {
        false
    }

    /// Free GPU objects. Called once, after the last reference is released.
    fn unload(&self, _backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        Ok(())
    }
}
