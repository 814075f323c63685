//! Deferred lighting pass
//!
//! A full-screen pass reads the G-buffer and accumulates the ambient term and
//! every analytic light into the HDR target. Pixels the G-buffer left empty
//! stay black for the sky to fill.

use glam::Vec3;

use super::fullscreen::{FullscreenPass, FullscreenResources};
use super::{GBufferPass, GpuLayouts, SceneFrame};
use crate::assets::ResourceCache;
use crate::backend::*;
use crate::draw::PassTargets;
use crate::error::EngineResult;
use crate::scene::{GpuLightData, LightBlock};

pub struct LightingPass {
    pass: FullscreenPass,
    lights: BufferHandle,
}

impl LightingPass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        resources: FullscreenResources,
        layouts: &GpuLayouts,
    ) -> EngineResult<Self> {
        let texture = |binding| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::texture_2d(),
        };
        let entries = [
            texture(0),
            texture(1),
            texture(2),
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::texture_2d_unfilterable(),
            },
            BindGroupLayoutEntry {
                binding: 4,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
        ];

        let lights = backend.create_buffer(&BufferDescriptor {
            label: Some("Light Block".into()),
            size: std::mem::size_of::<LightBlock>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        let pass = match FullscreenPass::new(backend, "Lighting", resources, &entries, &[layouts.camera]) {
            Ok(pass) => pass,
            Err(err) => {
                backend.destroy_buffer(lights);
                return Err(err);
            }
        };
        Ok(Self { pass, lights })
    }

    pub fn update_lights(&self, backend: &mut dyn GraphicsBackend, ambient: Vec3, lights: &[GpuLightData]) {
        let block = LightBlock::new(ambient, lights);
        backend.write_buffer(self.lights, 0, bytemuck::bytes_of(&block));
    }

    /// Drop the G-buffer bind group after the G-buffer was recreated.
    pub fn invalidate(&mut self, backend: &mut dyn GraphicsBackend) {
        self.pass.invalidate(backend);
    }

    /// Record the full-screen lighting draw into the open HDR pass.
    pub fn record(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        frame: &SceneFrame<'_>,
        gbuffer: &GBufferPass,
        targets: &PassTargets,
    ) -> EngineResult<()> {
        let lights = self.lights;
        let bind_group = self.pass.bind_group(backend, 0, || {
            vec![
                (0, BindGroupEntry::Texture(gbuffer.albedo().sample_view())),
                (1, BindGroupEntry::Texture(gbuffer.normal().sample_view())),
                (2, BindGroupEntry::Texture(gbuffer.emissive().sample_view())),
                (3, BindGroupEntry::Texture(gbuffer.linear_depth().sample_view())),
                (
                    4,
                    BindGroupEntry::Buffer {
                        buffer: lights,
                        offset: 0,
                        size: None,
                    },
                ),
            ]
        })?;
        self.pass
            .record(backend, targets, &[frame.camera.bind_group], bind_group)
    }

    pub fn release(self, cache: &ResourceCache, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.lights);
        self.pass.release(cache, backend);
    }
}

pub const LIGHTING_TECHNIQUE: &str = r#"{
    "shader": "../shaders/lighting.wgsl",
    "category": "fullscreen",
    "cull": "none",
    "depth_test": false,
    "depth_write": false
}"#;

/// Deferred lighting shader
pub const LIGHTING_SHADER: &str = r#"
struct CameraUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    inv_proj: mat4x4<f32>,
    position: vec4<f32>,
    near_far: vec4<f32>,
}

struct LightData {
    // xyz = position, w = radius
    position_radius: vec4<f32>,
    // xyz = color, w = intensity
    color_intensity: vec4<f32>,
    // xyz = direction, w = light type (0=point, 1=spot, 2=directional)
    direction_type: vec4<f32>,
    // x = cos(inner_angle), y = cos(outer_angle), zw = unused
    spot_params: vec4<f32>,
}

struct LightBlock {
    ambient: vec4<f32>,
    counts: vec4<u32>,
    lights: array<LightData, 64>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;

@group(1) @binding(0) var gbuffer_albedo: texture_2d<f32>;
@group(1) @binding(1) var gbuffer_normal: texture_2d<f32>;
@group(1) @binding(2) var gbuffer_emissive: texture_2d<f32>;
@group(1) @binding(3) var gbuffer_linear_depth: texture_2d<f32>;
@group(1) @binding(4) var<uniform> light_block: LightBlock;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = vec4<f32>(position.xy, 0.0, 1.0);
    output.uv = vec2<f32>(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
    return output;
}

fn reconstruct_world_position(uv: vec2<f32>, linear_depth: f32) -> vec3<f32> {
    let ndc = vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, 1.0, 1.0);
    let far_point = camera.inv_proj * ndc;
    let ray = far_point.xyz / far_point.w;
    let view_position = ray * (linear_depth / -ray.z);
    return (camera.inv_view * vec4<f32>(view_position, 1.0)).xyz;
}

fn calculate_light(
    light: LightData,
    world_pos: vec3<f32>,
    normal: vec3<f32>,
    albedo: vec3<f32>,
    metallic: f32,
    roughness: f32,
    view_dir: vec3<f32>,
) -> vec3<f32> {
    let light_type = u32(light.direction_type.w);
    var light_dir: vec3<f32>;
    var attenuation: f32 = 1.0;

    if light_type == 2u {
        light_dir = -normalize(light.direction_type.xyz);
    } else {
        let light_vec = light.position_radius.xyz - world_pos;
        let distance = length(light_vec);
        light_dir = light_vec / max(distance, 1e-4);

        let radius = light.position_radius.w;
        attenuation = max(0.0, 1.0 - (distance / radius));
        attenuation = attenuation * attenuation;

        if light_type == 1u {
            let spot_dir = normalize(light.direction_type.xyz);
            let cos_angle = dot(-light_dir, spot_dir);
            let inner_cos = light.spot_params.x;
            let outer_cos = light.spot_params.y;
            attenuation = attenuation * saturate((cos_angle - outer_cos) / max(inner_cos - outer_cos, 1e-4));
        }
    }

    let ndotl = max(dot(normal, light_dir), 0.0);
    let diffuse = albedo * (1.0 - metallic);

    // Blinn-Phong specular, tightened as roughness drops
    let half_vec = normalize(light_dir + view_dir);
    let ndoth = max(dot(normal, half_vec), 0.0);
    let shininess = mix(16.0, 128.0, 1.0 - roughness);
    let spec_strength = pow(ndoth, shininess) * (1.0 - roughness);
    let spec_color = mix(vec3<f32>(0.04), albedo, metallic);
    let specular = spec_color * spec_strength;

    return (diffuse * ndotl + specular) * light.color_intensity.xyz * light.color_intensity.w * attenuation;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(input.position.xy);
    let linear_depth = textureLoad(gbuffer_linear_depth, pixel, 0).r;
    if linear_depth <= 0.0 {
        return vec4<f32>(0.0, 0.0, 0.0, 1.0);
    }

    let albedo = textureLoad(gbuffer_albedo, pixel, 0).rgb;
    let normal_roughness = textureLoad(gbuffer_normal, pixel, 0);
    let emissive_metallic = textureLoad(gbuffer_emissive, pixel, 0);
    let normal = normalize(normal_roughness.xyz);
    let roughness = normal_roughness.w;
    let metallic = emissive_metallic.a;

    let world_pos = reconstruct_world_position(input.uv, linear_depth);
    let view_dir = normalize(camera.position.xyz - world_pos);

    var color = light_block.ambient.rgb * albedo + emissive_metallic.rgb;
    let count = min(light_block.counts.x, 64u);
    for (var i = 0u; i < count; i = i + 1u) {
        color = color + calculate_light(
            light_block.lights[i],
            world_pos,
            normal,
            albedo,
            metallic,
            roughness,
            view_dir,
        );
    }

    return vec4<f32>(color, 1.0);
}
"#;
