//! Sky compositing
//!
//! Runs inside the lighting pass. The skybox is drawn at the far plane with a
//! less-equal depth test against the G-buffer depth, so it only lands on
//! background pixels. Entities with sky-category materials are drawn after it.

use super::fullscreen::{FullscreenPass, FullscreenResources};
use super::{GpuLayouts, SceneFrame};
use crate::assets::{Handle, ResourceCache};
use crate::backend::*;
use crate::draw::{DrawCategory, DrawContext, DrawRegistry, DrawStats, PassTargets};
use crate::error::EngineResult;
use crate::resources::Cubemap;

struct Skybox {
    pass: FullscreenPass,
    cubemap: Handle<Cubemap>,
    sampler: SamplerHandle,
}

pub struct SkyPass {
    skybox: Option<Skybox>,
}

impl SkyPass {
    /// Sky pass that only draws sky-category entities.
    pub fn without_skybox() -> Self {
        Self { skybox: None }
    }

    pub fn new(
        backend: &mut dyn GraphicsBackend,
        resources: FullscreenResources,
        cubemap: Handle<Cubemap>,
        layouts: &GpuLayouts,
    ) -> EngineResult<Self> {
        let entries = [
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                    view_dimension: TextureViewDimension::Cube,
                    multisampled: false,
                },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
        ];
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Skybox Sampler".into()),
            ..Default::default()
        })?;
        let pass = match FullscreenPass::new(backend, "Sky", resources, &entries, &[layouts.camera]) {
            Ok(pass) => pass,
            Err(err) => {
                backend.destroy_sampler(sampler);
                return Err(err);
            }
        };
        Ok(Self {
            skybox: Some(Skybox { pass, cubemap, sampler }),
        })
    }

    pub fn has_skybox(&self) -> bool {
        self.skybox.is_some()
    }

    /// Record the skybox and the sky category into the open lighting pass.
    pub fn record(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        frame: &SceneFrame<'_>,
        registry: &mut DrawRegistry,
        targets: &PassTargets,
    ) -> EngineResult<DrawStats> {
        if let Some(skybox) = &mut self.skybox {
            let view = skybox.cubemap.view(backend)?;
            let sampler = skybox.sampler;
            let bind_group = skybox.pass.bind_group(backend, 0, || {
                vec![(0, BindGroupEntry::Texture(view)), (1, BindGroupEntry::Sampler(sampler))]
            })?;
            skybox
                .pass
                .record(backend, targets, &[frame.camera.bind_group], bind_group)?;
        }

        let mut ctx = DrawContext {
            backend,
            layouts: frame.layouts,
            camera_bind_group: frame.camera.bind_group,
            camera_position: frame.camera_position,
            targets,
            frame_index: frame.frame_index,
        };
        Ok(registry.render_category(DrawCategory::Sky, &mut ctx))
    }

    pub fn release(self, cache: &ResourceCache, backend: &mut dyn GraphicsBackend) {
        if let Some(skybox) = self.skybox {
            backend.destroy_sampler(skybox.sampler);
            skybox.pass.release(cache, backend);
            cache.release(skybox.cubemap);
        }
    }
}

pub const SKYBOX_TECHNIQUE: &str = r#"{
    "shader": "../shaders/skybox.wgsl",
    "category": "sky",
    "cull": "none",
    "depth_test": true,
    "depth_write": false,
    "depth_compare": "less_equal"
}"#;

pub const SKYBOX_SHADER: &str = r#"
struct CameraUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    inv_proj: mat4x4<f32>,
    position: vec4<f32>,
    near_far: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) ndc: vec2<f32>,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;
@group(1) @binding(0) var sky_texture: texture_cube<f32>;
@group(1) @binding(1) var sky_sampler: sampler;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var output: VertexOutput;
    // z = w puts every fragment on the far plane
    output.position = vec4<f32>(position.xy, 1.0, 1.0);
    output.ndc = position.xy;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let far_point = camera.inv_proj * vec4<f32>(input.ndc, 1.0, 1.0);
    let view_dir = far_point.xyz / far_point.w;
    let world_dir = (camera.inv_view * vec4<f32>(view_dir, 0.0)).xyz;
    return vec4<f32>(textureSample(sky_texture, sky_sampler, normalize(world_dir)).rgb, 1.0);
}
"#;
