//! G-Buffer generation pass for deferred rendering
//!
//! Renders the solid category to multiple render targets (MRT):
//! - Albedo (base color)
//! - World-space normal + roughness
//! - Self-illumination (emissive + environment reflection) + metallic
//! - Linear view depth, 0 where nothing was drawn
//! - Depth-stencil, shared with the later scene passes

use super::{DepthTarget, RenderTarget, SceneFrame};
use crate::backend::*;
use crate::draw::{DrawCategory, DrawContext, DrawRegistry, DrawStats, PassTargets};

const ALBEDO: usize = 0;
const NORMAL: usize = 1;
const EMISSIVE: usize = 2;
const LINEAR_DEPTH: usize = 3;

pub struct GBufferPass {
    targets: Vec<RenderTarget>,
}

impl GBufferPass {
    pub const ALBEDO_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
    pub const NORMAL_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
    pub const EMISSIVE_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

    /// 32-bit float targets cannot be resolved, so multisampled G-buffers
    /// store linear depth at half precision.
    pub fn linear_depth_format(sample_count: u32) -> TextureFormat {
        if sample_count > 1 {
            TextureFormat::R16Float
        } else {
            TextureFormat::R32Float
        }
    }

    pub fn new(backend: &mut dyn GraphicsBackend, width: u32, height: u32, sample_count: u32) -> BackendResult<Self> {
        let layout = [
            ("G-Buffer Albedo", Self::ALBEDO_FORMAT),
            ("G-Buffer Normal", Self::NORMAL_FORMAT),
            ("G-Buffer Emissive", Self::EMISSIVE_FORMAT),
            ("G-Buffer Linear Depth", Self::linear_depth_format(sample_count)),
        ];

        let mut targets = Vec::with_capacity(layout.len());
        for (label, format) in layout {
            match RenderTarget::new(backend, label, format, width, height, sample_count) {
                Ok(target) => targets.push(target),
                Err(err) => {
                    for target in targets {
                        target.destroy(backend);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { targets })
    }

    pub fn pass_targets(&self) -> PassTargets {
        PassTargets {
            color_formats: self.targets.iter().map(RenderTarget::format).collect(),
            depth_format: Some(DepthTarget::FORMAT),
            sample_count: self.targets[ALBEDO].sample_count(),
        }
    }

    pub fn albedo(&self) -> &RenderTarget {
        &self.targets[ALBEDO]
    }

    pub fn normal(&self) -> &RenderTarget {
        &self.targets[NORMAL]
    }

    pub fn emissive(&self) -> &RenderTarget {
        &self.targets[EMISSIVE]
    }

    pub fn linear_depth(&self) -> &RenderTarget {
        &self.targets[LINEAR_DEPTH]
    }

    /// Clear every target and draw the solid category.
    pub fn execute(
        &self,
        backend: &mut dyn GraphicsBackend,
        frame: &SceneFrame<'_>,
        registry: &mut DrawRegistry,
        depth: &DepthTarget,
    ) -> DrawStats {
        let targets = self.pass_targets();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("G-Buffer".into()),
            color_attachments: self
                .targets
                .iter()
                .map(|target| target.color_attachment(LoadOp::Clear([0.0, 0.0, 0.0, 0.0])))
                .collect(),
            depth_stencil_attachment: Some(depth.clear_attachment()),
        });
        backend.set_viewport(0.0, 0.0, frame.size.0 as f32, frame.size.1 as f32, 0.0, 1.0);

        let mut ctx = DrawContext {
            backend: &mut *backend,
            layouts: frame.layouts,
            camera_bind_group: frame.camera.bind_group,
            camera_position: frame.camera_position,
            targets: &targets,
            frame_index: frame.frame_index,
        };
        let stats = registry.render_category(DrawCategory::Solid, &mut ctx);
        backend.end_render_pass();
        stats
    }

    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> BackendResult<()> {
        for target in &mut self.targets {
            target.resize(backend, width, height)?;
        }
        Ok(())
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        for target in self.targets {
            target.destroy(backend);
        }
    }
}

pub const GBUFFER_TECHNIQUE: &str = r#"{
    "shader": "../shaders/gbuffer.wgsl",
    "category": "solid",
    "cull": "back",
    "depth_compare": "less"
}"#;

/// G-Buffer generation shader
pub const GBUFFER_SHADER: &str = r#"
struct CameraUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    inv_proj: mat4x4<f32>,
    position: vec4<f32>,
    near_far: vec4<f32>,
}

struct ObjectUniforms {
    model: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
}

struct MaterialUniforms {
    base_color: vec4<f32>,
    // x = metallic, y = roughness, z = 1 with a normal map
    metallic_roughness: vec4<f32>,
    // xyz = color, w = strength
    emissive: vec4<f32>,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) world_tangent: vec4<f32>,
    @location(4) view_depth: f32,
}

struct GBufferOutput {
    @location(0) albedo: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) emissive: vec4<f32>,
    @location(3) linear_depth: vec4<f32>,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;
@group(1) @binding(0) var<uniform> object: ObjectUniforms;
@group(2) @binding(0) var<uniform> material: MaterialUniforms;
@group(2) @binding(1) var base_color_texture: texture_2d<f32>;
@group(2) @binding(2) var normal_texture: texture_2d<f32>;
@group(2) @binding(3) var environment: texture_cube<f32>;
@group(2) @binding(4) var material_sampler: sampler;

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    let world_pos = object.model * vec4<f32>(input.position, 1.0);
    output.world_position = world_pos.xyz;
    output.clip_position = camera.view_proj * world_pos;
    output.world_normal = normalize((object.normal_matrix * vec4<f32>(input.normal, 0.0)).xyz);
    output.world_tangent = vec4<f32>(normalize((object.model * vec4<f32>(input.tangent.xyz, 0.0)).xyz), input.tangent.w);
    output.uv = input.uv;
    output.view_depth = -(camera.view * world_pos).z;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> GBufferOutput {
    var output: GBufferOutput;

    let base = material.base_color * textureSample(base_color_texture, material_sampler, input.uv);
    let metallic = material.metallic_roughness.x;
    let roughness = material.metallic_roughness.y;

    var normal = normalize(input.world_normal);
    if material.metallic_roughness.z > 0.5 {
        let tangent = normalize(input.world_tangent.xyz);
        let bitangent = cross(normal, tangent) * input.world_tangent.w;
        let sampled = textureSample(normal_texture, material_sampler, input.uv).xyz * 2.0 - 1.0;
        normal = normalize(tangent * sampled.x + bitangent * sampled.y + normal * sampled.z);
    }

    let view_dir = normalize(camera.position.xyz - input.world_position);
    let reflected = reflect(-view_dir, normal);
    let reflection = textureSample(environment, material_sampler, reflected).rgb;
    let fresnel = mix(vec3<f32>(0.04), base.rgb, metallic) * (1.0 - roughness);

    output.albedo = base;
    output.normal = vec4<f32>(normal, roughness);
    output.emissive = vec4<f32>(material.emissive.rgb * material.emissive.w + reflection * fresnel, metallic);
    output.linear_depth = vec4<f32>(input.view_depth, 0.0, 0.0, 1.0);

    return output;
}
"#;
