//! Backend abstraction layer
//!
//! Provides the opaque GPU capability the renderer is written against, with a
//! wgpu implementation for real devices and a headless one that records work.

pub mod headless;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use headless::HeadlessBackend;
pub use traits::*;
pub use types::*;
pub use wgpu_backend::WgpuBackend;
