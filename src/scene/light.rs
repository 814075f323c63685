//! Light types for the scene

use bevy_ecs::prelude::*;
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use super::Transform;

/// Lights beyond this count are dropped from the frame.
pub const MAX_LIGHTS: usize = 64;

/// Point light component
/// Position comes from the Transform component on the same entity
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            intensity: 1.0,
            radius: 10.0,
        }
    }
}

impl PointLight {
    pub fn new(color: Vec3, intensity: f32, radius: f32) -> Self {
        Self { color, intensity, radius }
    }

    pub fn to_gpu_data(&self, position: Vec3) -> GpuLightData {
        GpuLightData {
            position: position.extend(self.radius),
            color_intensity: self.color.extend(self.intensity),
            direction_type: Vec4::new(0.0, 0.0, 0.0, LightKind::Point.gpu_tag()),
            spot_params: Vec4::ZERO,
        }
    }
}

/// Spot light component
/// Position comes from the Transform component on the same entity
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct SpotLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
    pub inner_angle: f32, // radians
    pub outer_angle: f32, // radians
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            direction: -Vec3::Y,
            color: Vec3::ONE,
            intensity: 1.0,
            radius: 10.0,
            inner_angle: 0.3,
            outer_angle: 0.5,
        }
    }
}

impl SpotLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32, radius: f32, inner_angle: f32, outer_angle: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero(),
            color,
            intensity,
            radius,
            inner_angle,
            outer_angle,
        }
    }

    pub fn to_gpu_data(&self, position: Vec3) -> GpuLightData {
        GpuLightData {
            position: position.extend(self.radius),
            color_intensity: self.color.extend(self.intensity),
            direction_type: self.direction.extend(LightKind::Spot.gpu_tag()),
            spot_params: Vec4::new(self.inner_angle.cos(), self.outer_angle.cos(), 0.0, 0.0),
        }
    }
}

/// Directional light component (like the sun)
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero(),
            color,
            intensity,
        }
    }

    pub fn to_gpu_data(&self) -> GpuLightData {
        GpuLightData {
            // Radius 0 marks "unbounded" for the lighting shader.
            position: Vec4::ZERO,
            color_intensity: self.color.extend(self.intensity),
            direction_type: self.direction.extend(LightKind::Directional.gpu_tag()),
            spot_params: Vec4::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Point,
    Spot,
    Directional,
}

impl LightKind {
    fn gpu_tag(self) -> f32 {
        match self {
            LightKind::Point => 0.0,
            LightKind::Spot => 1.0,
            LightKind::Directional => 2.0,
        }
    }
}

/// Any light, for callers that build light lists without an ECS world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Light {
    Point { position: Vec3, light: PointLight },
    Spot { position: Vec3, light: SpotLight },
    Directional(DirectionalLight),
}

impl Light {
    pub fn kind(&self) -> LightKind {
        match self {
            Light::Point { .. } => LightKind::Point,
            Light::Spot { .. } => LightKind::Spot,
            Light::Directional(_) => LightKind::Directional,
        }
    }

    pub fn to_gpu_data(&self) -> GpuLightData {
        match self {
            Light::Point { position, light } => light.to_gpu_data(*position),
            Light::Spot { position, light } => light.to_gpu_data(*position),
            Light::Directional(light) => light.to_gpu_data(),
        }
    }
}

/// GPU-friendly light data structure
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuLightData {
    /// xyz = position, w = radius
    pub position: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// xyz = direction, w = light type (0=point, 1=spot, 2=directional)
    pub direction_type: Vec4,
    /// x = cos(inner_angle), y = cos(outer_angle), zw = unused
    pub spot_params: Vec4,
}

/// Uniform block read by the lighting pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightBlock {
    /// rgb = ambient color
    pub ambient: Vec4,
    /// x = light count
    pub counts: [u32; 4],
    pub lights: [GpuLightData; MAX_LIGHTS],
}

impl LightBlock {
    pub fn new(ambient: Vec3, lights: &[GpuLightData]) -> Self {
        if lights.len() > MAX_LIGHTS {
            log::warn!("{} lights submitted, only the first {} are shaded", lights.len(), MAX_LIGHTS);
        }
        let mut block = Self::zeroed();
        let count = lights.len().min(MAX_LIGHTS);
        block.ambient = ambient.extend(1.0);
        block.counts[0] = count as u32;
        block.lights[..count].copy_from_slice(&lights[..count]);
        block
    }

    pub fn light_count(&self) -> usize {
        self.counts[0] as usize
    }
}

/// Gather every light in the world, directional lights first.
///
/// Point and spot lights without a `Transform` are ignored.
pub fn collect_lights(world: &mut World) -> Vec<GpuLightData> {
    let mut lights = Vec::new();

    let mut directional = world.query::<&DirectionalLight>();
    lights.extend(directional.iter(world).map(|light| light.to_gpu_data()));

    let mut points = world.query::<(&PointLight, &Transform)>();
    lights.extend(
        points
            .iter(world)
            .map(|(light, transform)| light.to_gpu_data(transform.position)),
    );

    let mut spots = world.query::<(&SpotLight, &Transform)>();
    lights.extend(spots.iter(world).map(|(light, transform)| {
        let mut data = light.to_gpu_data(transform.position);
        // Spot direction is local to the entity.
        let direction = (transform.rotation * light.direction).normalize_or_zero();
        data.direction_type = direction.extend(data.direction_type.w);
        data
    }));

    lights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_block_layout_matches_the_shader() {
        assert_eq!(std::mem::size_of::<GpuLightData>(), 64);
        assert_eq!(std::mem::size_of::<LightBlock>(), 32 + 64 * MAX_LIGHTS);
    }

    #[test]
    fn light_block_truncates_to_capacity() {
        let lights = vec![PointLight::default().to_gpu_data(Vec3::ZERO); MAX_LIGHTS + 3];
        let block = LightBlock::new(Vec3::splat(0.1), &lights);
        assert_eq!(block.light_count(), MAX_LIGHTS);
        assert_eq!(block.ambient, Vec4::new(0.1, 0.1, 0.1, 1.0));
    }

    #[test]
    fn collect_lights_reads_components() {
        let mut world = World::new();
        world.spawn(DirectionalLight::default());
        world.spawn((PointLight::default(), Transform::from_position(Vec3::new(1.0, 2.0, 3.0))));
        // No transform, not collected
        world.spawn(PointLight::default());
        world.spawn((SpotLight::default(), Transform::default()));

        let lights = collect_lights(&mut world);
        assert_eq!(lights.len(), 3);
        assert_eq!(lights[0].direction_type.w, 2.0);
        assert_eq!(lights[1].position, Vec4::new(1.0, 2.0, 3.0, 10.0));
        assert_eq!(lights[2].direction_type.w, 1.0);
    }

    #[test]
    fn light_enum_dispatches_to_components() {
        let light = Light::Spot {
            position: Vec3::Y,
            light: SpotLight::default(),
        };
        assert_eq!(light.kind(), LightKind::Spot);
        assert_eq!(light.to_gpu_data().position.truncate(), Vec3::Y);
    }
}
