//! Transparency pass
//!
//! Draws the transparent category back to front over the lit HDR image. Depth
//! is tested against the G-buffer depth but never written.

use super::{DepthTarget, RenderTarget, SceneFrame};
use crate::backend::*;
use crate::draw::{DrawCategory, DrawContext, DrawRegistry, DrawStats, PassTargets};

pub struct TransparencyPass;

impl TransparencyPass {
    pub fn pass_targets(hdr: &RenderTarget) -> PassTargets {
        PassTargets {
            color_formats: vec![hdr.format()],
            depth_format: Some(DepthTarget::FORMAT),
            sample_count: hdr.sample_count(),
        }
    }

    pub fn execute(
        backend: &mut dyn GraphicsBackend,
        frame: &SceneFrame<'_>,
        registry: &mut DrawRegistry,
        hdr: &RenderTarget,
        depth: &DepthTarget,
    ) -> DrawStats {
        let targets = Self::pass_targets(hdr);
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Transparency".into()),
            color_attachments: vec![hdr.color_attachment(LoadOp::Load)],
            depth_stencil_attachment: Some(depth.read_only_attachment()),
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
        let stats = registry.render_category(DrawCategory::Transparent, &mut ctx);
        backend.end_render_pass();
        stats
    }
}

pub const FORWARD_TECHNIQUE: &str = r#"{
    "shader": "../shaders/forward.wgsl",
    "category": "transparent",
    "blend": "alpha",
    "cull": "none",
    "depth_write": false
}"#;

/// Forward shading for blended geometry
pub const FORWARD_SHADER: &str = r#"
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
    metallic_roughness: vec4<f32>,
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
    output.uv = input.uv;
    return output;
}

@fragment
fn fs_main(input: VertexOutput, @builtin(front_facing) front_facing: bool) -> @location(0) vec4<f32> {
    let base = material.base_color * textureSample(base_color_texture, material_sampler, input.uv);
    let roughness = material.metallic_roughness.y;

    var normal = normalize(input.world_normal);
    if !front_facing {
        normal = -normal;
    }
    let view_dir = normalize(camera.position.xyz - input.world_position);

    // Headlight: a light at the eye keeps blended surfaces readable
    let diffuse = base.rgb * (0.25 + 0.75 * max(dot(normal, view_dir), 0.0));
    let reflection = textureSample(environment, material_sampler, reflect(-view_dir, normal)).rgb;
    let fresnel = pow(1.0 - max(dot(normal, view_dir), 0.0), 5.0) * (1.0 - roughness);
    let emissive = material.emissive.rgb * material.emissive.w;

    return vec4<f32>(diffuse + reflection * fresnel + emissive, base.a);
}
"#;
