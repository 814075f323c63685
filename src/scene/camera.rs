//! Camera component

use bevy_ecs::prelude::*;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Perspective camera, attached to an entity.
///
/// Stored as position, viewing direction and up vector so two cameras can be
/// blended component-wise.
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub front: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO)
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            front: (target - position).try_normalize().unwrap_or(Vec3::NEG_Z),
            up: Vec3::Y,
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            near: 0.1,
            far: 1000.0,
        }
    }

    pub fn with_fov_degrees(mut self, fov_y: f32) -> Self {
        self.fov_y = fov_y.to_radians();
        self
    }

    pub fn with_clip(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    pub fn look_at(&mut self, target: Vec3) {
        if let Some(front) = (target - self.position).try_normalize() {
            self.front = front;
        }
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn right(&self) -> Vec3 {
        self.front.cross(self.up).normalize()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.front, self.up)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self, aspect: f32) -> Mat4 {
        self.projection_matrix(aspect) * self.view_matrix()
    }

    /// Component-wise linear blend towards `other`.
    pub fn lerp(&self, other: &Camera, t: f32) -> Camera {
        let mix = |a: f32, b: f32| a + (b - a) * t;
        Camera {
            position: self.position.lerp(other.position, t),
            front: self.front.lerp(other.front, t),
            up: self.up.lerp(other.up, t),
            fov_y: mix(self.fov_y, other.fov_y),
            near: mix(self.near, other.near),
            far: mix(self.far, other.far),
        }
    }

    /// Uniform block for a viewport of `width` x `height` pixels.
    pub fn uniform_data(&self, width: u32, height: u32) -> CameraUniformData {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        let view = self.view_matrix();
        let proj = self.projection_matrix(aspect);

        CameraUniformData {
            view,
            proj,
            view_proj: proj * view,
            inv_view: view.inverse(),
            inv_proj: proj.inverse(),
            position: self.position.extend(1.0),
            near_far: Vec4::new(self.near, self.far, width as f32, height as f32),
        }
    }
}

/// Camera uniform data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniformData {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub inv_view: Mat4,
    pub inv_proj: Mat4,
    pub position: Vec4,
    /// x = near, y = far, zw = viewport size in pixels
    pub near_far: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_points_at_the_target() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        assert!((camera.front - Vec3::NEG_Z).length() < 1e-6);
        let in_view = camera.view_matrix().transform_point3(Vec3::ZERO);
        assert!((in_view - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-5);
    }

    #[test]
    fn lerp_blends_every_component() {
        let a = Camera::new(Vec3::ZERO, Vec3::NEG_Z).with_clip(0.1, 100.0);
        let b = Camera::new(Vec3::new(10.0, 0.0, 0.0), Vec3::new(10.0, 0.0, -1.0))
            .with_fov_degrees(90.0)
            .with_clip(0.3, 300.0);
        let mid = a.lerp(&b, 0.5);
        assert_eq!(mid.position, Vec3::new(5.0, 0.0, 0.0));
        assert!((mid.near - 0.2).abs() < 1e-6);
        assert!((mid.far - 200.0).abs() < 1e-3);
        assert!((mid.fov_y - (a.fov_y + b.fov_y) * 0.5).abs() < 1e-6);
        assert_eq!(a.lerp(&b, 0.0), a);
    }

    #[test]
    fn uniforms_carry_viewport_size() {
        let data = Camera::default().uniform_data(1280, 720);
        assert_eq!(data.near_far, Vec4::new(0.1, 1000.0, 1280.0, 720.0));
        let identity = data.view * data.inv_view;
        assert!(identity.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }
}
