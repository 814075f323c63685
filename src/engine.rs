//! Main engine orchestrator
//!
//! Owns the backend, the ECS world, the resource cache, the draw registry,
//! the deferred pipeline and the camera mixer, and drives one frame per
//! `render` call.

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::Vec3;

use crate::assets::{FileAssetIo, Handle, OverlayAssetIo, ResourceCache};
use crate::backend::wgpu_backend::WgpuBackend;
use crate::backend::{BackendError, GraphicsBackend};
use crate::draw::DrawRegistry;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{builtin_files, DeferredPipeline, FrameInput, FrameOutcome, FrameStats, DEFAULT_MATERIAL_PATH};
use crate::resources::{Material, Mesh};
use crate::scene::{collect_lights, Camera, CameraMixer, Interpolator, Transform};
use crate::window::Window;
use crate::EngineConfig;

/// Mesh and materials an entity draws with. Part `i` of the mesh uses
/// material `i`, or the last material when there are fewer materials than parts.
#[derive(Component)]
pub struct Renderable {
    mesh: Handle<Mesh>,
    materials: Vec<Handle<Material>>,
}

impl Renderable {
    pub fn mesh(&self) -> &Handle<Mesh> {
        &self.mesh
    }

    pub fn materials(&self) -> &[Handle<Material>] {
        &self.materials
    }

    fn release(self, cache: &ResourceCache) {
        cache.release(self.mesh);
        for material in self.materials {
            cache.release(material);
        }
    }
}

/// The main graphics engine
pub struct Engine {
    backend: Box<dyn GraphicsBackend>,
    world: World,
    cache: ResourceCache,
    registry: DrawRegistry,
    pipeline: DeferredPipeline,
    mixer: CameraMixer,
    /// Meshes registered through `add_mesh`, kept alive until shutdown
    registered: Vec<Handle<Mesh>>,
    ambient: Vec3,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine drawing into `window` through wgpu.
    pub fn new(window: &Window, config: EngineConfig) -> EngineResult<Self> {
        let backend = WgpuBackend::new(window.window_arc(), config.vsync)?;
        Self::with_backend(Box::new(backend), config)
    }

    /// Create an engine on an existing backend. Assets are read from
    /// `config.asset_root`, built-in shaders and techniques from memory.
    pub fn with_backend(backend: Box<dyn GraphicsBackend>, config: EngineConfig) -> EngineResult<Self> {
        let files = Arc::new(FileAssetIo::new(&config.asset_root));
        let cache = ResourceCache::new(OverlayAssetIo::new(builtin_files(), files));
        Self::with_cache(backend, cache, config)
    }

    /// Create an engine loading through `cache`. The cache must serve the
    /// built-in files, see [`builtin_files`].
    pub fn with_cache(
        mut backend: Box<dyn GraphicsBackend>,
        cache: ResourceCache,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let pipeline = pollster::block_on(DeferredPipeline::load(
            &cache,
            backend.as_mut(),
            config.deferred.clone(),
        ))?;
        log::info!("Engine initialized with {} backend", backend.name());

        Ok(Self {
            backend,
            world: World::new(),
            cache,
            registry: DrawRegistry::new(),
            pipeline,
            mixer: CameraMixer::new(),
            registered: Vec::new(),
            ambient: Vec3::from(config.deferred.ambient),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn registry(&self) -> &DrawRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DrawRegistry {
        &mut self.registry
    }

    pub fn pipeline(&self) -> &DeferredPipeline {
        &self.pipeline
    }

    pub fn set_ssao_enabled(&mut self, enabled: bool) {
        self.pipeline.set_ssao_enabled(enabled);
    }

    pub fn set_fxaa_enabled(&mut self, enabled: bool) {
        self.pipeline.set_fxaa_enabled(self.backend.as_mut(), enabled);
    }

    pub fn backend(&self) -> &dyn GraphicsBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GraphicsBackend {
        self.backend.as_mut()
    }

    pub fn mixer(&self) -> &CameraMixer {
        &self.mixer
    }

    pub fn mixer_mut(&mut self) -> &mut CameraMixer {
        &mut self.mixer
    }

    pub fn set_ambient(&mut self, ambient: Vec3) {
        self.ambient = ambient;
    }

    /// Register a procedurally built mesh under `path` so entities can draw it.
    pub fn add_mesh(&mut self, path: &str, mesh: Mesh) -> EngineResult<()> {
        let handle = self.cache.register(path, Arc::new(mesh))?;
        self.registered.push(handle);
        Ok(())
    }

    /// Spawn an entity drawing `mesh_path` with `material_paths`. An empty
    /// material list draws every part with the default material.
    pub fn spawn_renderable(
        &mut self,
        mesh_path: &str,
        material_paths: &[&str],
        transform: Transform,
    ) -> EngineResult<Entity> {
        let material_paths = if material_paths.is_empty() {
            &[DEFAULT_MATERIAL_PATH][..]
        } else {
            material_paths
        };

        let (mesh, materials) = pollster::block_on(async {
            futures::join!(
                self.cache.fetch::<Mesh>(mesh_path),
                futures::future::join_all(material_paths.iter().map(|path| self.cache.fetch::<Material>(path))),
            )
        });

        let mut loaded = Vec::with_capacity(materials.len());
        let mut failure = None;
        for result in materials {
            match result {
                Ok(material) => loaded.push(material),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        let err = match (mesh, failure) {
            (Ok(mesh), None) => return Ok(self.insert_renderable(mesh_path, mesh, loaded, transform)),
            (Ok(mesh), Some(err)) => {
                self.cache.release(mesh);
                err
            }
            (Err(err), _) => err,
        };
        for material in loaded {
            self.cache.release(material);
        }
        log::warn!("Could not spawn {mesh_path}: {err}");
        Err(err.into())
    }

    fn insert_renderable(
        &mut self,
        mesh_path: &str,
        mesh: Handle<Mesh>,
        materials: Vec<Handle<Material>>,
        transform: Transform,
    ) -> Entity {
        let entity = self.world.spawn(transform).id();
        let shared_mesh = mesh.share();
        for part in 0..shared_mesh.part_count() {
            let material = &materials[part.min(materials.len() - 1)];
            self.registry
                .submit_part(entity, &shared_mesh, part, &material.share(), transform.matrix());
        }
        log::debug!(
            "Spawned {entity:?} drawing {mesh_path} ({} parts)",
            shared_mesh.part_count()
        );
        self.world.entity_mut(entity).insert(Renderable { mesh, materials });
        entity
    }

    /// Remove an entity, withdrawing its draws and releasing its resources.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        self.registry.withdraw(entity);
        if self.mixer.default_camera() == Some(entity) {
            self.mixer.set_default_camera(None);
        }
        if !self.world.entities().contains(entity) {
            return false;
        }
        if let Some(renderable) = self.world.entity_mut(entity).take::<Renderable>() {
            renderable.release(&self.cache);
        }
        self.world.despawn(entity)
    }

    /// Spawn a camera entity. It contributes to the frame once it is the main
    /// camera or blended in.
    pub fn spawn_camera(&mut self, camera: Camera) -> Entity {
        self.world.spawn(camera).id()
    }

    /// The camera the mixer falls back to. `None` leaves only blended cameras.
    pub fn set_main_camera(&mut self, camera: Option<Entity>) {
        self.mixer.set_default_camera(camera);
    }

    /// Blend `camera` in over `duration` seconds.
    pub fn blend_to_camera(&mut self, camera: Entity, duration: f32, curve: Interpolator) {
        self.mixer.blend_to(camera, duration, curve);
    }

    pub fn resize(&mut self, width: u32, height: u32) -> EngineResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.backend.resize(width, height);
        let (width, height) = self.backend.surface_size();
        self.pipeline.resize(self.backend.as_mut(), width, height)
    }

    /// Render one frame, `dt` seconds after the previous one.
    pub fn render(&mut self, dt: f32) -> EngineResult<FrameOutcome> {
        self.mixer.update(dt);
        let camera = self.mixer.compose(&self.world)?;
        self.registry.sync_transforms(&self.world);
        let lights = collect_lights(&mut self.world);

        match self.pipeline.begin_frame(self.backend.as_mut()) {
            Ok(()) => {}
            Err(EngineError::Backend(BackendError::SurfaceLost)) => {
                let (width, height) = self.backend.surface_size();
                log::warn!("Surface lost, reconfiguring at {width}x{height}");
                self.backend.resize(width, height);
                return Ok(FrameOutcome::Aborted);
            }
            Err(err) => return Err(err),
        }

        let generated = self.pipeline.generate_frame(
            self.backend.as_mut(),
            &mut self.registry,
            FrameInput {
                camera,
                lights: &lights,
                ambient: self.ambient,
                dt,
            },
        );
        let ended = self.pipeline.end_frame(self.backend.as_mut());
        let unloaded = self.cache.flush_unloads(self.backend.as_mut());
        if unloaded > 0 {
            log::debug!("Unloaded {unloaded} resources");
        }

        generated?;
        ended
    }

    /// Counters of the last generated frame.
    pub fn stats(&self) -> FrameStats {
        self.pipeline.stats()
    }

    /// Release every resource the engine holds and free the GPU objects.
    pub fn shutdown(mut self) {
        let entities: Vec<Entity> = self
            .world
            .query_filtered::<Entity, With<Renderable>>()
            .iter(&self.world)
            .collect();
        for entity in entities {
            self.despawn(entity);
        }
        let Self {
            mut backend,
            cache,
            pipeline,
            registered,
            ..
        } = self;
        for mesh in registered {
            cache.release(mesh);
        }
        pipeline.release(backend.as_mut());
        let unloaded = cache.flush_unloads(backend.as_mut());
        log::info!("Engine shut down, {unloaded} resources unloaded");
    }
}
