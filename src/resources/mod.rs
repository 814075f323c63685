//! Typed resources
//!
//! Meshes, materials, techniques, textures, cubemaps and shaders, each loaded
//! through the resource cache and uploaded to the GPU on first use.

mod cubemap;
mod material;
mod mesh;
mod shader;
mod technique;
mod texture;

pub use cubemap::*;
pub use material::*;
pub use mesh::*;
pub use shader::*;
pub use technique::*;
pub use texture::*;
