//! Material definitions for PBR rendering

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use futures::future::{BoxFuture, FutureExt};
use glam::{Vec3, Vec4};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::assets::{Asset, AssetError, AssetResult, LoadContext, ResourceKind};
use crate::backend::*;
use crate::draw::DrawCategory;
use crate::pipeline::GpuLayouts;
use crate::resources::{Cubemap, Technique, Texture};

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

/// PBR material properties
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialParams {
    pub name: String,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub emissive: Vec3,
    pub emissive_strength: f32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color: Vec4::new(1.0, 1.0, 1.0, 1.0),
            metallic: 0.0,
            roughness: 0.5,
            emissive: Vec3::ZERO,
            emissive_strength: 1.0,
        }
    }
}

impl MaterialParams {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color = color;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn with_emissive(mut self, emissive: Vec3, strength: f32) -> Self {
        self.emissive = emissive;
        self.emissive_strength = strength;
        self
    }

    pub fn uniform_data(&self, has_normal_map: bool) -> MaterialUniformData {
        MaterialUniformData {
            base_color: self.base_color,
            metallic_roughness: [
                self.metallic,
                self.roughness,
                if has_normal_map { 1.0 } else { 0.0 },
                0.0,
            ],
            emissive: self.emissive.extend(self.emissive_strength),
        }
    }

    // Presets

    pub fn plastic(color: Vec3) -> Self {
        Self::new("plastic")
            .with_base_color(color.extend(1.0))
            .with_metallic(0.0)
            .with_roughness(0.4)
    }

    pub fn metal(color: Vec3, roughness: f32) -> Self {
        Self::new("metal")
            .with_base_color(color.extend(1.0))
            .with_metallic(1.0)
            .with_roughness(roughness)
    }

    pub fn gold() -> Self {
        Self::metal(Vec3::new(1.0, 0.766, 0.336), 0.3)
    }

    pub fn rubber(color: Vec3) -> Self {
        Self::new("rubber")
            .with_base_color(color.extend(1.0))
            .with_metallic(0.0)
            .with_roughness(0.9)
    }

    pub fn glass() -> Self {
        Self::new("glass")
            .with_base_color(Vec4::new(1.0, 1.0, 1.0, 0.3))
            .with_metallic(0.0)
            .with_roughness(0.1)
    }

    pub fn emissive(color: Vec3, strength: f32) -> Self {
        Self::new("emissive")
            .with_base_color(Vec4::ONE)
            .with_emissive(color, strength)
    }
}

/// Material uniform data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialUniformData {
    pub base_color: Vec4,
    /// x = metallic, y = roughness, z = 1 when a normal map is bound
    pub metallic_roughness: [f32; 4],
    /// xyz = emissive, w = strength
    pub emissive: Vec4,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MaterialDescriptor {
    technique: String,
    base_color: [f32; 4],
    metallic: f32,
    roughness: f32,
    emissive: [f32; 3],
    emissive_strength: f32,
    base_color_texture: Option<String>,
    normal_texture: Option<String>,
    environment: Option<String>,
}

impl Default for MaterialDescriptor {
    fn default() -> Self {
        let params = MaterialParams::default();
        Self {
            technique: String::new(),
            base_color: params.base_color.to_array(),
            metallic: params.metallic,
            roughness: params.roughness,
            emissive: params.emissive.to_array(),
            emissive_strength: params.emissive_strength,
            base_color_texture: None,
            normal_texture: None,
            environment: None,
        }
    }
}

struct MaterialGpu {
    uniform_buffer: BufferHandle,
    bind_group: BindGroupHandle,
}

/// A material resource: parameters, a technique and optional textures.
pub struct Material {
    id: u64,
    params: MaterialParams,
    technique: Arc<Technique>,
    base_color_texture: Option<Arc<Texture>>,
    normal_texture: Option<Arc<Texture>>,
    environment: Option<Arc<Cubemap>>,
    gpu: Mutex<Option<MaterialGpu>>,
}

impl Material {
    pub fn new(params: MaterialParams, technique: Arc<Technique>) -> Self {
        Self {
            id: NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed),
            params,
            technique,
            base_color_texture: None,
            normal_texture: None,
            environment: None,
            gpu: Mutex::new(None),
        }
    }

    pub fn with_base_color_texture(mut self, texture: Arc<Texture>) -> Self {
        self.base_color_texture = Some(texture);
        self
    }

    pub fn with_normal_texture(mut self, texture: Arc<Texture>) -> Self {
        self.normal_texture = Some(texture);
        self
    }

    pub fn with_environment(mut self, cubemap: Arc<Cubemap>) -> Self {
        self.environment = Some(cubemap);
        self
    }

    /// Process-unique identity, used to group draws by material.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &MaterialParams {
        &self.params
    }

    pub fn technique(&self) -> &Arc<Technique> {
        &self.technique
    }

    pub fn category(&self) -> DrawCategory {
        self.technique.category()
    }

    pub fn priority(&self) -> i32 {
        self.technique.priority()
    }

    /// Bind group for group 2, built on first use.
    pub fn bind_group(
        &self,
        backend: &mut dyn GraphicsBackend,
        layouts: &GpuLayouts,
    ) -> BackendResult<BindGroupHandle> {
        let mut gpu = self.gpu.lock();
        if let Some(gpu) = gpu.as_ref() {
            return Ok(gpu.bind_group);
        }

        let base_color_view = match &self.base_color_texture {
            Some(texture) => texture.view(backend)?,
            None => layouts.defaults.white,
        };
        let normal_view = match &self.normal_texture {
            Some(texture) => texture.view(backend)?,
            None => layouts.defaults.normal,
        };
        let environment_view = match &self.environment {
            Some(cubemap) => cubemap.view(backend)?,
            None => layouts.defaults.environment,
        };

        let uniform = self.params.uniform_data(self.normal_texture.is_some());
        let uniform_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} material", self.params.name)),
                size: std::mem::size_of::<MaterialUniformData>() as u64,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            bytemuck::bytes_of(&uniform),
        )?;
        let bind_group = backend.create_bind_group(
            layouts.material,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: uniform_buffer,
                        offset: 0,
                        size: None,
                    },
                ),
                (1, BindGroupEntry::Texture(base_color_view)),
                (2, BindGroupEntry::Texture(normal_view)),
                (3, BindGroupEntry::Texture(environment_view)),
                (4, BindGroupEntry::Sampler(layouts.defaults.sampler)),
            ],
        );
        let bind_group = match bind_group {
            Ok(bind_group) => bind_group,
            Err(err) => {
                backend.destroy_buffer(uniform_buffer);
                return Err(err);
            }
        };

        *gpu = Some(MaterialGpu {
            uniform_buffer,
            bind_group,
        });
        Ok(bind_group)
    }

    /// Drop the bind group so it is rebuilt against fresh defaults.
    pub fn invalidate(&self, backend: &mut dyn GraphicsBackend) {
        if let Some(gpu) = self.gpu.lock().take() {
            backend.destroy_bind_group(gpu.bind_group);
            backend.destroy_buffer(gpu.uniform_buffer);
        }
    }
}

async fn fetch_optional<B: Asset>(ctx: &LoadContext, path: Option<&str>) -> AssetResult<Option<Arc<B>>> {
    match path {
        Some(path) => ctx.fetch::<B>(&ctx.resolve(path)).await.map(Some),
        None => Ok(None),
    }
}

impl Asset for Material {
    const KIND: ResourceKind = ResourceKind::Material;

    fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
        async move {
            let descriptor: MaterialDescriptor =
                serde_json::from_slice(&bytes).map_err(|e| AssetError::decode(ctx.path(), e))?;
            if descriptor.technique.is_empty() {
                return Err(AssetError::decode(ctx.path(), "material has no technique"));
            }

            let technique_path = ctx.resolve(&descriptor.technique);
            let (technique, base_color_texture, normal_texture, environment) = futures::join!(
                ctx.fetch::<Technique>(&technique_path),
                fetch_optional::<Texture>(&ctx, descriptor.base_color_texture.as_deref()),
                fetch_optional::<Texture>(&ctx, descriptor.normal_texture.as_deref()),
                fetch_optional::<Cubemap>(&ctx, descriptor.environment.as_deref()),
            );

            let params = MaterialParams {
                name: ctx.path().to_string(),
                base_color: Vec4::from_array(descriptor.base_color),
                metallic: descriptor.metallic,
                roughness: descriptor.roughness,
                emissive: Vec3::from_array(descriptor.emissive),
                emissive_strength: descriptor.emissive_strength,
            };

            let mut material = Material::new(params, technique?);
            material.base_color_texture = base_color_texture?;
            material.normal_texture = normal_texture?;
            material.environment = environment?;
            Ok(material)
        }
        .boxed()
    }

    fn is_gpu_resident(&self) -> bool {
        self.gpu.lock().is_some()
    }

    fn unload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        self.invalidate(backend);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_match_params() {
        let descriptor: MaterialDescriptor =
            serde_json::from_str(r#"{ "technique": "opaque.json", "metallic": 1.0 }"#).unwrap();
        assert_eq!(descriptor.base_color, [1.0, 1.0, 1.0, 1.0]);
        assert_eq!(descriptor.roughness, 0.5);
        assert_eq!(descriptor.metallic, 1.0);
        assert!(descriptor.normal_texture.is_none());
    }

    #[test]
    fn uniform_flags_normal_maps() {
        let params = MaterialParams::gold();
        assert_eq!(params.uniform_data(true).metallic_roughness, [1.0, 0.3, 1.0, 0.0]);
        assert_eq!(params.uniform_data(false).metallic_roughness[2], 0.0);
    }

    #[test]
    fn uniform_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<MaterialUniformData>(), 48);
    }
}
