//! Bind group layouts shared by every scene draw
//!
//! - group 0: camera uniforms
//! - group 1: per-draw object uniforms, dynamic offset
//! - group 2: material uniforms, base color / normal / environment textures, sampler

use crate::backend::*;
use crate::resources::{GpuTexture, TextureData};
use crate::scene::CameraUniformData;

/// Fallback textures bound when a material leaves a slot empty
pub struct DefaultTextures {
    pub white: TextureViewHandle,
    pub normal: TextureViewHandle,
    pub environment: TextureViewHandle,
    pub sampler: SamplerHandle,
    textures: Vec<GpuTexture>,
}

impl DefaultTextures {
    fn new(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let white = GpuTexture::create(backend, &TextureData::white())?;
        let normal = GpuTexture::create(backend, &TextureData::default_normal())?;
        let black_faces: Vec<TextureData> = (0..6)
            .map(|i| TextureData::solid_color([0, 0, 0, 255], &format!("default_environment[{i}]")))
            .collect();
        let environment = GpuTexture::create_cube(backend, &black_faces)?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Material Sampler".into()),
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            ..Default::default()
        })?;

        Ok(Self {
            white: white.view,
            normal: normal.view,
            environment: environment.view,
            sampler,
            textures: vec![white, normal, environment],
        })
    }

    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_sampler(self.sampler);
        for texture in self.textures {
            texture.destroy(backend);
        }
    }
}

pub struct GpuLayouts {
    pub camera: BindGroupLayoutHandle,
    pub object: BindGroupLayoutHandle,
    pub material: BindGroupLayoutHandle,
    pub defaults: DefaultTextures,
}

impl GpuLayouts {
    pub fn new(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let camera = backend.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
            ty: BindingType::UniformBuffer,
        }])?;

        let object = backend.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::VERTEX,
            ty: BindingType::DynamicUniformBuffer {
                min_binding_size: std::mem::size_of::<ObjectUniform>() as u64,
            },
        }])?;

        let material = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::texture_2d(),
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::texture_2d(),
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                    view_dimension: TextureViewDimension::Cube,
                    multisampled: false,
                },
            },
            BindGroupLayoutEntry {
                binding: 4,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
        ])?;

        let defaults = DefaultTextures::new(backend)?;
        log::info!("Scene bind group layouts created");

        Ok(Self {
            camera,
            object,
            material,
            defaults,
        })
    }

    /// Layouts in group order for scene pipelines
    pub fn scene_layouts(&self) -> Vec<BindGroupLayoutHandle> {
        vec![self.camera, self.object, self.material]
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        self.defaults.destroy(backend);
    }
}

/// Camera uniform buffer and its group 0 bind group
pub struct CameraBinding {
    pub buffer: BufferHandle,
    pub bind_group: BindGroupHandle,
}

impl CameraBinding {
    pub fn new(backend: &mut dyn GraphicsBackend, layouts: &GpuLayouts) -> BackendResult<Self> {
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("Camera Uniforms".into()),
            size: std::mem::size_of::<CameraUniformData>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        let bind_group = backend.create_bind_group(
            layouts.camera,
            &[(
                0,
                BindGroupEntry::Buffer {
                    buffer,
                    offset: 0,
                    size: None,
                },
            )],
        )?;
        Ok(Self { buffer, bind_group })
    }

    pub fn update(&self, backend: &mut dyn GraphicsBackend, data: &CameraUniformData) {
        backend.write_buffer(self.buffer, 0, bytemuck::bytes_of(data));
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_bind_group(self.bind_group);
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::ResourceClass;

    #[test]
    fn defaults_are_created_and_freed() {
        let mut backend = HeadlessBackend::default();
        let layouts = GpuLayouts::new(&mut backend).unwrap();
        let camera = CameraBinding::new(&mut backend, &layouts).unwrap();
        assert_eq!(backend.live_count(ResourceClass::Texture), 3);
        assert_eq!(layouts.scene_layouts().len(), 3);

        camera.destroy(&mut backend);
        layouts.destroy(&mut backend);
        assert_eq!(backend.live_count(ResourceClass::Texture), 0);
        assert_eq!(backend.live_count(ResourceClass::Buffer), 0);
        assert_eq!(backend.live_count(ResourceClass::Sampler), 0);
    }
}
