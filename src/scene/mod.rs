//! Scene components and the camera blend mixer

mod camera;
mod camera_mixer;
mod curve;
mod light;
mod transform;

pub use camera::*;
pub use camera_mixer::*;
pub use curve::*;
pub use light::*;
pub use transform::*;
