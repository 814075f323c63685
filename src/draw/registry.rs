use std::collections::HashMap;
use std::sync::Arc;

use bevy_ecs::entity::Entity;
use bevy_ecs::world::World;
use glam::{Mat4, Vec3};

use super::{DrawCategory, DrawContext, DrawKey, DrawKeyId, DrawStats, SkipReason};
use crate::backend::{ObjectUniform, RenderPipelineHandle};
use crate::resources::{Material, Mesh, PipelineKey};
use crate::scene::Transform;

#[derive(Default)]
struct BindState {
    pipeline: Option<RenderPipelineHandle>,
    material: Option<u64>,
}

/// Live draw keys of every renderable entity.
#[derive(Default)]
pub struct DrawRegistry {
    keys: Vec<DrawKey>,
    next_id: u64,
    last_stats: HashMap<DrawCategory, DrawStats>,
}

impl DrawRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one key per part of `mesh`, all drawn with `material`.
    pub fn submit(
        &mut self,
        owner: Entity,
        mesh: &Arc<Mesh>,
        material: &Arc<Material>,
        transform: Mat4,
    ) -> Vec<DrawKeyId> {
        (0..mesh.part_count())
            .map(|part| self.submit_part(owner, mesh, part, material, transform))
            .collect()
    }

    /// Add a key for a single mesh part.
    pub fn submit_part(
        &mut self,
        owner: Entity,
        mesh: &Arc<Mesh>,
        part: usize,
        material: &Arc<Material>,
        transform: Mat4,
    ) -> DrawKeyId {
        let id = DrawKeyId(self.next_id);
        self.next_id += 1;
        self.keys
            .push(DrawKey::new(id, owner, mesh, part, material, transform));
        id
    }

    /// Remove every key of `owner`. Returns how many were removed.
    pub fn withdraw(&mut self, owner: Entity) -> usize {
        let before = self.keys.len();
        self.keys.retain(|key| key.owner != owner);
        let removed = before - self.keys.len();
        if removed > 0 {
            log::debug!("Withdrew {removed} draw keys of {owner:?}");
        }
        removed
    }

    pub fn set_visible(&mut self, owner: Entity, visible: bool) {
        for key in self.keys_of_mut(owner) {
            key.visible = visible;
        }
    }

    pub fn set_transform(&mut self, owner: Entity, transform: Mat4) {
        for key in self.keys_of_mut(owner) {
            key.transform = Some(transform);
        }
    }

    /// Keys sharing a group are sorted next to each other within a material.
    pub fn set_instance_group(&mut self, owner: Entity, group: Option<u32>) {
        for key in self.keys_of_mut(owner) {
            key.instance_group = group;
        }
    }

    /// Refresh transforms from `Transform` components. Owners that no longer
    /// exist lose their transform; owners without the component keep theirs.
    pub fn sync_transforms(&mut self, world: &World) {
        for key in &mut self.keys {
            if !world.entities().contains(key.owner) {
                key.transform = None;
            } else if let Some(transform) = world.get::<Transform>(key.owner) {
                key.transform = Some(transform.matrix());
            }
        }
    }

    fn keys_of_mut(&mut self, owner: Entity) -> impl Iterator<Item = &mut DrawKey> {
        self.keys.iter_mut().filter(move |key| key.owner == owner)
    }

    pub fn keys(&self) -> &[DrawKey] {
        &self.keys
    }

    pub fn keys_of(&self, owner: Entity) -> impl Iterator<Item = &DrawKey> {
        self.keys.iter().filter(move |key| key.owner == owner)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Indices of the visible keys of `category` in draw order.
    ///
    /// The sort is stable over submission order. Opaque categories sort by
    /// priority, material, instance group and then front to back. Transparent
    /// keys sort by priority and then back to front, with material as a tie
    /// breaker, so blending composes correctly across materials.
    fn sorted_indices(&self, category: DrawCategory, camera: Vec3) -> Vec<usize> {
        let mut entries: Vec<(usize, f32)> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.visible && key.category == category)
            .map(|(index, key)| (index, key.distance_squared(camera)))
            .collect();

        let keys = &self.keys;
        if category.sorts_back_to_front() {
            entries.sort_by(|(a, da), (b, db)| {
                let (a, b) = (&keys[*a], &keys[*b]);
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| db.total_cmp(da))
                    .then(a.material_id.cmp(&b.material_id))
                    .then(a.instance_group.cmp(&b.instance_group))
            });
        } else {
            entries.sort_by(|(a, da), (b, db)| {
                let (a, b) = (&keys[*a], &keys[*b]);
                a.priority
                    .cmp(&b.priority)
                    .then(a.material_id.cmp(&b.material_id))
                    .then(a.instance_group.cmp(&b.instance_group))
                    .then_with(|| da.total_cmp(db))
            });
        }
        entries.into_iter().map(|(index, _)| index).collect()
    }

    /// Draw order of a category as seen from `camera`.
    pub fn draw_order(&self, category: DrawCategory, camera: Vec3) -> Vec<DrawKeyId> {
        self.sorted_indices(category, camera)
            .into_iter()
            .map(|index| self.keys[index].id)
            .collect()
    }

    /// Record the draws of one category into the current render pass.
    pub fn render_category(
        &mut self,
        category: DrawCategory,
        ctx: &mut DrawContext<'_>,
    ) -> DrawStats {
        let order = self.sorted_indices(category, ctx.camera_position);
        let mut stats = DrawStats::default();

        if !order.is_empty() {
            let pipeline_key = ctx.targets.pipeline_key(ctx.layouts);
            let mut bound = BindState::default();
            ctx.backend.set_bind_group(0, ctx.camera_bind_group, &[]);

            for index in order {
                let key = &self.keys[index];
                match draw_key(key, ctx, &pipeline_key, &mut bound, &mut stats) {
                    Ok(()) => stats.draw_calls += 1,
                    Err(reason) => {
                        stats.skipped += 1;
                        log::warn!(
                            "Skipping draw key {:?} of {:?} (part {}): {:?}",
                            key.id,
                            key.owner,
                            key.part,
                            reason
                        );
                    }
                }
            }
        }

        log::trace!("{category:?}: {stats:?}");
        self.last_stats.insert(category, stats);
        stats
    }

    /// Counters of the last `render_category` call for `category`.
    pub fn stats(&self, category: DrawCategory) -> DrawStats {
        self.last_stats.get(&category).copied().unwrap_or_default()
    }

    pub fn draw_calls(&self, category: DrawCategory) -> usize {
        self.stats(category).draw_calls
    }
}

fn draw_key(
    key: &DrawKey,
    ctx: &mut DrawContext<'_>,
    pipeline_key: &PipelineKey,
    bound: &mut BindState,
    stats: &mut DrawStats,
) -> Result<(), SkipReason> {
    let mesh = key.mesh.upgrade().ok_or(SkipReason::MissingMesh)?;
    let material = key.material.upgrade().ok_or(SkipReason::MissingMaterial)?;
    let transform = key.transform.ok_or(SkipReason::MissingTransform)?;
    if key.part >= mesh.part_count() {
        return Err(SkipReason::MissingPart);
    }
    let technique = material.technique();

    if bound.material != Some(key.material_id) {
        let pipeline = technique
            .pipeline(ctx.backend, pipeline_key)
            .map_err(|err| {
                log::warn!("Technique {} has no pipeline: {err}", technique.name());
                SkipReason::PipelineUnavailable
            })?;
        if bound.pipeline != Some(pipeline) {
            ctx.backend.set_render_pipeline(pipeline);
            bound.pipeline = Some(pipeline);
            stats.pipeline_binds += 1;
        }

        let material_group = material
            .bind_group(ctx.backend, ctx.layouts)
            .map_err(|_| SkipReason::BindFailed)?;
        ctx.backend.set_bind_group(2, material_group, &[]);
        bound.material = Some(key.material_id);
        stats.material_binds += 1;
    }

    let (object_group, offset) = technique
        .push_object(
            ctx.backend,
            ctx.layouts.object,
            ctx.frame_index,
            &ObjectUniform::from_model(transform),
        )
        .map_err(|_| SkipReason::BindFailed)?;
    ctx.backend.set_bind_group(1, object_group, &[offset]);

    mesh.draw_part(ctx.backend, key.part)
        .map_err(|_| SkipReason::MissingPart)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::RecordedCommand;
    use crate::backend::*;
    use crate::draw::PassTargets;
    use crate::pipeline::{CameraBinding, GpuLayouts};
    use crate::resources::{MaterialParams, MeshPart, RenderState, ShaderSource, Technique};

    fn technique(name: &str, state: RenderState) -> Arc<Technique> {
        let shader = Arc::new(ShaderSource::new(name, "fn vs_main() {}"));
        Arc::new(Technique::new(name, shader, state))
    }

    fn material(technique: &Arc<Technique>) -> Arc<Material> {
        Arc::new(Material::new(MaterialParams::default(), technique.clone()))
    }

    fn cube() -> Arc<Mesh> {
        Arc::new(Mesh::from_parts("cube", vec![MeshPart::cube()]))
    }

    fn at(z: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(0.0, 0.0, -z))
    }

    fn solid_targets() -> PassTargets {
        PassTargets {
            color_formats: vec![TextureFormat::Rgba8Unorm],
            depth_format: Some(TextureFormat::Depth24PlusStencil8),
            sample_count: 1,
        }
    }

    #[test]
    fn submit_adds_a_key_per_part_and_withdraw_is_idempotent() {
        let mut world = World::new();
        let owner = world.spawn_empty().id();
        let mesh = Arc::new(Mesh::from_parts(
            "two",
            vec![MeshPart::cube(), MeshPart::sphere(4, 4)],
        ));
        let material = material(&technique("solid", RenderState::solid()));

        let mut registry = DrawRegistry::new();
        let ids = registry.submit(owner, &mesh, &material, Mat4::IDENTITY);
        assert_eq!(ids.len(), 2);
        assert_eq!(registry.keys_of(owner).count(), 2);

        assert_eq!(registry.withdraw(owner), 2);
        assert_eq!(registry.withdraw(owner), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn opaque_keys_sort_front_to_back() {
        let mut world = World::new();
        let material = material(&technique("solid", RenderState::solid()));
        let mesh = cube();
        let mut registry = DrawRegistry::new();
        let ids: Vec<DrawKeyId> = [10.0, 1.0, 5.0]
            .into_iter()
            .map(|z| registry.submit(world.spawn_empty().id(), &mesh, &material, at(z))[0])
            .collect();

        let order = registry.draw_order(DrawCategory::Solid, Vec3::ZERO);
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn transparent_keys_sort_back_to_front_across_materials() {
        let mut world = World::new();
        let glass = technique("glass", RenderState::transparent());
        let a = material(&glass);
        let b = material(&glass);
        let mesh = cube();
        let mut registry = DrawRegistry::new();
        let near = registry.submit(world.spawn_empty().id(), &mesh, &a, at(2.0))[0];
        let far = registry.submit(world.spawn_empty().id(), &mesh, &b, at(8.0))[0];
        let mid = registry.submit(world.spawn_empty().id(), &mesh, &a, at(4.0))[0];

        let order = registry.draw_order(DrawCategory::Transparent, Vec3::ZERO);
        assert_eq!(order, vec![far, mid, near]);
        assert!(registry.draw_order(DrawCategory::Solid, Vec3::ZERO).is_empty());
    }

    #[test]
    fn invisible_keys_are_not_drawn() {
        let mut world = World::new();
        let owner = world.spawn_empty().id();
        let material = material(&technique("solid", RenderState::solid()));
        let mut registry = DrawRegistry::new();
        registry.submit(owner, &cube(), &material, Mat4::IDENTITY);
        registry.set_visible(owner, false);
        assert!(registry.draw_order(DrawCategory::Solid, Vec3::ZERO).is_empty());
    }

    #[test]
    fn sync_clears_transforms_of_despawned_owners() {
        let mut world = World::new();
        let kept = world.spawn(Transform::from_position(Vec3::X)).id();
        let bare = world.spawn_empty().id();
        let gone = world.spawn_empty().id();
        let material = material(&technique("solid", RenderState::solid()));
        let mesh = cube();
        let mut registry = DrawRegistry::new();
        for owner in [kept, bare, gone] {
            registry.submit(owner, &mesh, &material, at(3.0));
        }
        world.despawn(gone);

        registry.sync_transforms(&world);
        let transform_of = |owner| registry.keys_of(owner).next().and_then(DrawKey::transform);
        assert_eq!(transform_of(kept), Some(Mat4::from_translation(Vec3::X)));
        assert_eq!(transform_of(bare), Some(at(3.0)));
        assert_eq!(transform_of(gone), None);
    }

    #[test]
    fn consecutive_keys_share_pipeline_and_material_binds() {
        let mut backend = HeadlessBackend::default();
        let layouts = GpuLayouts::new(&mut backend).unwrap();
        let camera = CameraBinding::new(&mut backend, &layouts).unwrap();
        let targets = solid_targets();

        let mut world = World::new();
        let solid = technique("solid", RenderState::solid());
        let red = material(&solid);
        let blue = material(&solid);
        let mesh = cube();
        let mut registry = DrawRegistry::new();
        for (material, z) in [(&red, 1.0), (&blue, 2.0), (&red, 3.0)] {
            registry.submit(world.spawn_empty().id(), &mesh, material, at(z));
        }

        backend.begin_frame().unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Solid".into()),
            color_attachments: Vec::new(),
            depth_stencil_attachment: None,
        });
        let stats = registry.render_category(
            DrawCategory::Solid,
            &mut DrawContext {
                backend: &mut backend,
                layouts: &layouts,
                camera_bind_group: camera.bind_group,
                camera_position: Vec3::ZERO,
                targets: &targets,
                frame_index: 0,
            },
        );
        backend.end_render_pass();

        assert_eq!(stats.draw_calls, 3);
        assert_eq!(stats.pipeline_binds, 1);
        assert_eq!(stats.material_binds, 2);
        assert_eq!(registry.draw_calls(DrawCategory::Solid), 3);

        let pass = backend.pass("Solid").unwrap();
        assert_eq!(pass.draw_count(), 3);
        assert_eq!(pass.pipeline_binds(), 1);
        let object_offsets: Vec<u32> = pass
            .commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::SetBindGroup { index: 1, offsets, .. } => offsets.first().copied(),
                _ => None,
            })
            .collect();
        assert_eq!(object_offsets, vec![0, 256, 512]);
    }

    #[test]
    fn broken_keys_are_skipped_not_fatal() {
        let mut backend = HeadlessBackend::default();
        let layouts = GpuLayouts::new(&mut backend).unwrap();
        let camera = CameraBinding::new(&mut backend, &layouts).unwrap();
        let targets = solid_targets();

        let mut world = World::new();
        let solid = technique("solid", RenderState::solid());
        let broken = technique("broken", RenderState::solid());
        backend.fail_pipelines_labelled("broken");
        let good = material(&solid);
        let bad = material(&broken);

        let mut registry = DrawRegistry::new();
        let dropped_mesh = cube();
        registry.submit(world.spawn_empty().id(), &dropped_mesh, &good, at(1.0));
        drop(dropped_mesh);
        let mesh = cube();
        registry.submit(world.spawn_empty().id(), &mesh, &bad, at(2.0));
        registry.submit(world.spawn_empty().id(), &mesh, &good, at(3.0));

        backend.begin_frame().unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Solid".into()),
            color_attachments: Vec::new(),
            depth_stencil_attachment: None,
        });
        let stats = registry.render_category(
            DrawCategory::Solid,
            &mut DrawContext {
                backend: &mut backend,
                layouts: &layouts,
                camera_bind_group: camera.bind_group,
                camera_position: Vec3::ZERO,
                targets: &targets,
                frame_index: 0,
            },
        );

        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.skipped, 2);
    }
}
