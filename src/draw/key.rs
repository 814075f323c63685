use std::sync::{Arc, Weak};

use bevy_ecs::entity::Entity;
use glam::{Mat4, Vec3};

use super::DrawCategory;
use crate::resources::{Material, Mesh};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawKeyId(pub(crate) u64);

/// One drawable mesh part of one entity.
///
/// Keys hold weak references: the entity's resource handles own the mesh and
/// material, so a key whose resources were released is skipped rather than
/// keeping them alive.
#[derive(Debug, Clone)]
pub struct DrawKey {
    pub(crate) id: DrawKeyId,
    pub(crate) owner: Entity,
    pub(crate) mesh: Weak<Mesh>,
    pub(crate) part: usize,
    pub(crate) material: Weak<Material>,
    pub(crate) transform: Option<Mat4>,
    pub(crate) visible: bool,
    pub(crate) instance_group: Option<u32>,

    // Captured at submission so sorting never touches the resources.
    pub(crate) category: DrawCategory,
    pub(crate) priority: i32,
    pub(crate) material_id: u64,
    pub(crate) local_center: Vec3,
}

impl DrawKey {
    pub(crate) fn new(
        id: DrawKeyId,
        owner: Entity,
        mesh: &Arc<Mesh>,
        part: usize,
        material: &Arc<Material>,
        transform: Mat4,
    ) -> Self {
        let local_center = mesh
            .parts()
            .get(part)
            .map_or(Vec3::ZERO, |p| p.bounds.center());
        Self {
            id,
            owner,
            mesh: Arc::downgrade(mesh),
            part,
            material: Arc::downgrade(material),
            transform: Some(transform),
            visible: true,
            instance_group: None,
            category: material.category(),
            priority: material.priority(),
            material_id: material.id(),
            local_center,
        }
    }

    pub fn id(&self) -> DrawKeyId {
        self.id
    }

    pub fn owner(&self) -> Entity {
        self.owner
    }

    pub fn part(&self) -> usize {
        self.part
    }

    pub fn category(&self) -> DrawCategory {
        self.category
    }

    pub fn transform(&self) -> Option<Mat4> {
        self.transform
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn instance_group(&self) -> Option<u32> {
        self.instance_group
    }

    /// Squared distance from the camera to the part's world-space center.
    /// Keys without a transform sort as infinitely far away.
    pub fn distance_squared(&self, camera: Vec3) -> f32 {
        self.transform.map_or(f32::INFINITY, |m| {
            m.transform_point3(self.local_center).distance_squared(camera)
        })
    }
}
