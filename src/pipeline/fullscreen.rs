//! Shared machinery of full-screen passes
//!
//! A full-screen pass draws the shared quad with one technique. Its own inputs
//! live in the last bind group, which is built lazily the first time the pass
//! runs and dropped whenever an input target is recreated.

use std::collections::HashMap;

use crate::assets::{AssetResult, Handle, ResourceCache};
use crate::backend::*;
use crate::draw::PassTargets;
use crate::error::{EngineError, EngineResult};
use crate::resources::{Mesh, PipelineKey, Technique, FULLSCREEN_QUAD_PATH};

/// Fetch the shared full-screen quad, registering it on first use.
pub(crate) async fn fetch_fullscreen_quad(cache: &ResourceCache) -> AssetResult<Handle<Mesh>> {
    if cache.contains(FULLSCREEN_QUAD_PATH) {
        cache.fetch::<Mesh>(FULLSCREEN_QUAD_PATH).await
    } else {
        cache.register(FULLSCREEN_QUAD_PATH, std::sync::Arc::new(Mesh::fullscreen_quad()))
    }
}

/// Technique and quad references held by one full-screen pass.
pub struct FullscreenResources {
    pub technique: Handle<Technique>,
    pub quad: Handle<Mesh>,
}

impl FullscreenResources {
    pub async fn load(cache: &ResourceCache, technique_path: &str) -> AssetResult<Self> {
        let technique = cache.fetch::<Technique>(technique_path).await?;
        match fetch_fullscreen_quad(cache).await {
            Ok(quad) => Ok(Self { technique, quad }),
            Err(err) => {
                cache.release(technique);
                Err(err)
            }
        }
    }

    pub fn release(self, cache: &ResourceCache) {
        cache.release(self.technique);
        cache.release(self.quad);
    }
}

pub struct FullscreenPass {
    label: &'static str,
    resources: FullscreenResources,
    /// Shared layouts first, the pass's own layout last
    layouts: Vec<BindGroupLayoutHandle>,
    bind_groups: HashMap<usize, BindGroupHandle>,
}

impl FullscreenPass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &'static str,
        resources: FullscreenResources,
        entries: &[BindGroupLayoutEntry],
        shared_layouts: &[BindGroupLayoutHandle],
    ) -> EngineResult<Self> {
        let own = backend
            .create_bind_group_layout(entries)
            .map_err(|err| EngineError::configuration(label, format!("bind group layout: {err}")))?;
        let mut layouts = shared_layouts.to_vec();
        layouts.push(own);
        Ok(Self {
            label,
            resources,
            layouts,
            bind_groups: HashMap::new(),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn technique(&self) -> &Technique {
        &self.resources.technique
    }

    fn own_index(&self) -> u32 {
        (self.layouts.len() - 1) as u32
    }

    /// Whether the bind group in `slot` needs rebuilding.
    pub fn is_bound(&self, slot: usize) -> bool {
        self.bind_groups.contains_key(&slot)
    }

    /// Forget every bind group; they are rebuilt on the next run.
    pub fn invalidate(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, bind_group) in self.bind_groups.drain() {
            backend.destroy_bind_group(bind_group);
        }
    }

    /// Bind group in `slot`, created from `entries` if it does not exist yet.
    pub fn bind_group(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        slot: usize,
        entries: impl FnOnce() -> Vec<(u32, BindGroupEntry)>,
    ) -> EngineResult<BindGroupHandle> {
        if let Some(bind_group) = self.bind_groups.get(&slot) {
            return Ok(*bind_group);
        }
        let layout = self.layouts[self.layouts.len() - 1];
        let bind_group = backend
            .create_bind_group(layout, &entries())
            .map_err(|err| EngineError::configuration(self.label, format!("missing input: {err}")))?;
        log::debug!("{}: bind group {} built", self.label, slot);
        self.bind_groups.insert(slot, bind_group);
        Ok(bind_group)
    }

    /// Record the draw into the currently open render pass.
    pub fn record(
        &self,
        backend: &mut dyn GraphicsBackend,
        targets: &PassTargets,
        shared_groups: &[BindGroupHandle],
        bind_group: BindGroupHandle,
    ) -> EngineResult<()> {
        let key = PipelineKey {
            bind_group_layouts: self.layouts.clone(),
            color_formats: targets.color_formats.clone(),
            depth_format: targets.depth_format,
            sample_count: targets.sample_count,
        };
        let pipeline = self
            .resources
            .technique
            .pipeline(backend, &key)
            .map_err(|err| EngineError::configuration(self.label, err.to_string()))?;

        backend.set_render_pipeline(pipeline);
        for (index, group) in shared_groups.iter().enumerate() {
            backend.set_bind_group(index as u32, *group, &[]);
        }
        backend.set_bind_group(self.own_index(), bind_group, &[]);
        self.resources.quad.draw_part(backend, 0)?;
        Ok(())
    }

    /// Run as a pass of its own into one single-sample color target.
    pub fn run(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        target: ColorAttachment,
        format: TextureFormat,
        size: (u32, u32),
        shared_groups: &[BindGroupHandle],
        slot: usize,
        entries: impl FnOnce() -> Vec<(u32, BindGroupEntry)>,
    ) -> EngineResult<()> {
        let bind_group = self.bind_group(backend, slot, entries)?;
        let targets = PassTargets {
            color_formats: vec![format],
            depth_format: None,
            sample_count: 1,
        };

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(self.label.to_string()),
            color_attachments: vec![target],
            depth_stencil_attachment: None,
        });
        backend.set_viewport(0.0, 0.0, size.0 as f32, size.1 as f32, 0.0, 1.0);
        let recorded = self.record(backend, &targets, shared_groups, bind_group);
        backend.end_render_pass();
        recorded
    }

    pub fn release(mut self, cache: &ResourceCache, backend: &mut dyn GraphicsBackend) {
        self.invalidate(backend);
        self.resources.release(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryAssetIo;
    use crate::backend::headless::ResourceClass;

    const SHADER: &str = "@vertex fn vs_main() {} @fragment fn fs_main() {}";
    const TECHNIQUE: &str = r#"{ "shader": "copy.wgsl", "category": "fullscreen", "cull": "none", "depth_test": false, "depth_write": false }"#;

    fn cache() -> ResourceCache {
        ResourceCache::new(
            MemoryAssetIo::new()
                .with_file("copy.wgsl", SHADER)
                .with_file("copy.json", TECHNIQUE),
        )
    }

    fn texture_entry() -> BindGroupLayoutEntry {
        BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::texture_2d(),
        }
    }

    #[test]
    fn passes_share_one_quad() {
        let cache = cache();
        let a = pollster::block_on(FullscreenResources::load(&cache, "copy.json")).unwrap();
        let b = pollster::block_on(FullscreenResources::load(&cache, "copy.json")).unwrap();
        assert!(Handle::ptr_eq(&a.quad, &b.quad));
        assert_eq!(cache.ref_count(FULLSCREEN_QUAD_PATH), Some(2));

        a.release(&cache);
        b.release(&cache);
        assert!(!cache.contains(FULLSCREEN_QUAD_PATH));
    }

    #[test]
    fn bind_group_is_built_once_until_invalidated() {
        let cache = cache();
        let mut backend = HeadlessBackend::default();
        let resources = pollster::block_on(FullscreenResources::load(&cache, "copy.json")).unwrap();
        let mut pass = FullscreenPass::new(&mut backend, "Copy", resources, &[texture_entry()], &[]).unwrap();

        let texture = backend
            .create_texture(&TextureDescriptor {
                label: Some("input".into()),
                width: 4,
                height: 4,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::TEXTURE_BINDING,
                ..Default::default()
            })
            .unwrap();
        let view = backend.create_texture_view(texture).unwrap();

        let mut builds = 0;
        for _ in 0..3 {
            pass.bind_group(&mut backend, 0, || {
                builds += 1;
                vec![(0, BindGroupEntry::Texture(view))]
            })
            .unwrap();
        }
        assert_eq!(builds, 1);
        assert_eq!(backend.live_count(ResourceClass::BindGroup), 1);

        pass.invalidate(&mut backend);
        assert!(!pass.is_bound(0));
        assert_eq!(backend.live_count(ResourceClass::BindGroup), 0);
        pass.release(&cache, &mut backend);
    }

    #[test]
    fn stale_inputs_are_configuration_errors() {
        let cache = cache();
        let mut backend = HeadlessBackend::default();
        let resources = pollster::block_on(FullscreenResources::load(&cache, "copy.json")).unwrap();
        let mut pass = FullscreenPass::new(&mut backend, "Copy", resources, &[texture_entry()], &[]).unwrap();

        let texture = backend.create_texture(&TextureDescriptor::default()).unwrap();
        let view = backend.create_texture_view(texture).unwrap();
        backend.destroy_texture_view(view);

        let err = pass
            .bind_group(&mut backend, 0, || vec![(0, BindGroupEntry::Texture(view))])
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, EngineError::Configuration { stage: "Copy", .. }));
    }
}
