//! Weighted camera blending for cinematic transitions
//!
//! Cameras are registered oldest first. Every update hands out weight from
//! the newest camera to the oldest: each claims its blended weight of whatever
//! headroom newer cameras left. What nobody claims stays with the default camera.

use bevy_ecs::entity::Entity;
use bevy_ecs::world::World;

use super::{Camera, Interpolator};
use crate::error::{EngineError, EngineResult};

/// One camera taking part in the blend.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedCamera {
    pub camera: Entity,
    /// Seconds to go from blended weight 0 to 1
    pub blend_duration: f32,
    pub curve: Interpolator,
    /// Progress of the blend in [0, 1]
    pub blended_weight: f32,
    /// Share of the final view after newer cameras took theirs
    pub applied_weight: f32,
    pub target_weight: f32,
}

impl MixedCamera {
    fn advance(&mut self, dt: f32, headroom: f32) {
        self.blended_weight = if self.blend_duration > 0.0 {
            (self.blended_weight + dt / self.blend_duration).clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.applied_weight = self.blended_weight * self.target_weight.min(headroom);
    }
}

#[derive(Debug, Default)]
pub struct CameraMixer {
    default_camera: Option<Entity>,
    cameras: Vec<MixedCamera>,
}

impl CameraMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Camera that receives all weight not claimed by blends.
    pub fn set_default_camera(&mut self, camera: Option<Entity>) {
        self.default_camera = camera;
    }

    pub fn default_camera(&self) -> Option<Entity> {
        self.default_camera
    }

    /// Start blending towards `camera` at full target weight.
    ///
    /// A camera already in the mix keeps its progress and becomes the newest.
    pub fn blend_to(&mut self, camera: Entity, duration: f32, curve: Interpolator) {
        let blended_weight = match self.cameras.iter().position(|c| c.camera == camera) {
            Some(index) => self.cameras.remove(index).blended_weight,
            None => 0.0,
        };
        self.cameras.push(MixedCamera {
            camera,
            blend_duration: duration,
            curve,
            blended_weight,
            applied_weight: 0.0,
            target_weight: 1.0,
        });
    }

    /// Change the share a camera aims for. Setting 0 fades it out and drops it.
    pub fn set_target_weight(&mut self, camera: Entity, weight: f32) -> bool {
        match self.cameras.iter_mut().find(|c| c.camera == camera) {
            Some(mixed) => {
                mixed.target_weight = weight.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    pub fn cameras(&self) -> &[MixedCamera] {
        &self.cameras
    }

    pub fn applied_weight(&self, camera: Entity) -> Option<f32> {
        self.cameras
            .iter()
            .find(|c| c.camera == camera)
            .map(|c| c.applied_weight)
    }

    /// Weight left to the default camera.
    pub fn default_weight(&self) -> f32 {
        1.0 - self.cameras.iter().map(|c| c.applied_weight).sum::<f32>()
    }

    /// Advance every blend by `dt` seconds and drop cameras left with no weight.
    pub fn update(&mut self, dt: f32) {
        let mut remaining = 1.0f32;
        let mut keep = vec![true; self.cameras.len()];
        for (index, mixed) in self.cameras.iter_mut().enumerate().rev() {
            let headroom = remaining.max(0.0);
            mixed.advance(dt, headroom);
            remaining -= mixed.applied_weight;

            // A blend that has not received any time yet is still starting.
            let starting = mixed.blended_weight == 0.0 && mixed.target_weight > 0.0 && headroom > 0.0;
            if mixed.applied_weight == 0.0 && !starting {
                keep[index] = false;
            }
        }

        let mut index = 0;
        self.cameras.retain(|mixed| {
            let kept = keep[index];
            index += 1;
            if !kept {
                log::debug!("Camera {:?} no longer contributes, leaving the mix", mixed.camera);
            }
            kept
        });
    }

    /// Blend the default camera with every active camera, oldest first.
    ///
    /// Returns `None` when there is nothing to look through. Cameras whose
    /// entity lost its `Camera` component are left out of the composite.
    pub fn compose(&self, world: &World) -> EngineResult<Option<Camera>> {
        let default = self
            .default_camera
            .and_then(|entity| world.get::<Camera>(entity).copied());
        let mut accumulated = if default.is_some() {
            self.default_weight().max(0.0)
        } else {
            0.0
        };
        let mut composite = default;

        for mixed in &self.cameras {
            // Still starting; nothing to contribute yet.
            if mixed.applied_weight == 0.0 {
                continue;
            }
            let Some(camera) = world.get::<Camera>(mixed.camera) else {
                log::warn!("Blended camera {:?} has no Camera component", mixed.camera);
                continue;
            };
            accumulated += mixed.applied_weight;
            let ratio = mixed.applied_weight / accumulated;
            if ratio.is_nan() {
                return Err(EngineError::NonFiniteBlend {
                    camera: mixed.camera,
                });
            }
            let t = mixed.curve.blend(0.0, 1.0, ratio);
            composite = Some(match composite {
                Some(current) => current.lerp(camera, t),
                None => *camera,
            });
        }
        Ok(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn camera_at(world: &mut World, x: f32) -> Entity {
        world
            .spawn(Camera::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x, 0.0, -1.0)))
            .id()
    }

    #[test]
    fn blend_reaches_half_weight_halfway() {
        let mut world = World::new();
        let camera = camera_at(&mut world, 10.0);
        let mut mixer = CameraMixer::new();
        mixer.blend_to(camera, 2.0, Interpolator::Linear);

        for _ in 0..10 {
            mixer.update(0.1);
        }
        let applied = mixer.applied_weight(camera).unwrap();
        assert!((applied - 0.5).abs() < 1e-4, "applied {applied}");
        assert!((mixer.default_weight() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn newer_camera_claims_headroom_first() {
        let mut world = World::new();
        let older = camera_at(&mut world, 1.0);
        let newer = camera_at(&mut world, 2.0);
        let mut mixer = CameraMixer::new();
        mixer.blend_to(older, 0.0, Interpolator::Linear);
        mixer.blend_to(newer, 0.0, Interpolator::Linear);

        mixer.update(0.016);
        assert_eq!(mixer.applied_weight(newer), Some(1.0));
        // Fully covered by the newer camera.
        assert_eq!(mixer.applied_weight(older), None);
        assert!(mixer.default_weight().abs() < 1e-6);
    }

    #[test]
    fn fresh_blends_survive_a_zero_length_step() {
        let mut world = World::new();
        let camera = camera_at(&mut world, 1.0);
        let mut mixer = CameraMixer::new();
        mixer.blend_to(camera, 1.0, Interpolator::Linear);
        mixer.update(0.0);
        assert_eq!(mixer.applied_weight(camera), Some(0.0));
        mixer.update(0.5);
        assert_eq!(mixer.applied_weight(camera), Some(0.5));
    }

    #[test]
    fn zero_target_fades_out_and_leaves() {
        let mut world = World::new();
        let camera = camera_at(&mut world, 1.0);
        let mut mixer = CameraMixer::new();
        mixer.blend_to(camera, 1.0, Interpolator::Linear);
        mixer.update(1.0);
        assert!(mixer.set_target_weight(camera, 0.0));
        mixer.update(0.1);
        assert!(mixer.cameras().is_empty());
    }

    #[test]
    fn composite_interpolates_from_the_default_camera() {
        let mut world = World::new();
        let base = camera_at(&mut world, 0.0);
        let shot = camera_at(&mut world, 10.0);
        let mut mixer = CameraMixer::new();
        mixer.set_default_camera(Some(base));
        mixer.blend_to(shot, 4.0, Interpolator::Linear);
        mixer.update(1.0);

        let composite = mixer.compose(&world).unwrap().unwrap();
        assert!((composite.position.x - 2.5).abs() < 1e-4);
    }

    #[test]
    fn no_cameras_means_no_view() {
        let world = World::new();
        let mixer = CameraMixer::new();
        assert_eq!(mixer.compose(&world).unwrap(), None);
    }

    #[test]
    fn starting_blend_without_a_default_camera_has_no_view() {
        let mut world = World::new();
        let camera = camera_at(&mut world, 1.0);
        let mut mixer = CameraMixer::new();
        mixer.blend_to(camera, 1.0, Interpolator::Linear);
        mixer.update(0.0);

        assert_eq!(mixer.applied_weight(camera), Some(0.0));
        assert_eq!(mixer.compose(&world).unwrap(), None);

        mixer.update(0.25);
        let composite = mixer.compose(&world).unwrap().unwrap();
        assert_eq!(composite.position.x, 1.0);
    }

    #[test]
    fn starting_blend_leaves_the_default_view_untouched() {
        let mut world = World::new();
        let base = camera_at(&mut world, 0.0);
        let shot = camera_at(&mut world, 10.0);
        let mut mixer = CameraMixer::new();
        mixer.set_default_camera(Some(base));
        mixer.blend_to(shot, 1.0, Interpolator::Linear);
        mixer.update(0.0);

        let composite = mixer.compose(&world).unwrap().unwrap();
        assert_eq!(composite.position.x, 0.0);
    }

    #[test]
    fn nan_ratio_is_a_fatal_error() {
        let mut world = World::new();
        let camera = camera_at(&mut world, 1.0);
        let mut mixer = CameraMixer::new();
        mixer.blend_to(camera, 1.0, Interpolator::Linear);
        mixer.update(f32::NAN);

        let err = mixer.compose(&world).unwrap_err();
        assert!(matches!(err, EngineError::NonFiniteBlend { camera: c } if c == camera));
        assert!(err.is_fatal());
    }
}
