//! Screen-space ambient occlusion
//!
//! Hemisphere sampling around each G-buffer position, rotated per pixel by a
//! tiled 4x4 noise texture. The result is a single-channel occlusion factor,
//! 1 meaning unoccluded. With the stage disabled the output is cleared to 1.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::assets::ResourceCache;
use crate::backend::*;
use crate::error::EngineResult;
use crate::pipeline::fullscreen::{FullscreenPass, FullscreenResources};
use crate::pipeline::{GBufferPass, GpuLayouts, RenderTarget, SceneFrame};
use crate::resources::{GpuTexture, TextureData};

pub const MAX_SSAO_SAMPLES: usize = 64;
const NOISE_SIZE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SsaoSettings {
    /// World-space sampling radius
    pub radius: f32,
    pub bias: f32,
    pub intensity: f32,
    pub sample_count: u32,
    /// Seed of the kernel and noise
    pub seed: u64,
}

impl Default for SsaoSettings {
    fn default() -> Self {
        Self {
            radius: 0.5,
            bias: 0.025,
            intensity: 1.0,
            sample_count: 16,
            seed: 0x55A0,
        }
    }
}

/// Sample offsets in the +Z hemisphere, denser towards the origin.
pub fn ssao_kernel(count: usize, seed: u64) -> Vec<Vec3> {
    let count = count.clamp(1, MAX_SSAO_SAMPLES);
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let direction = Vec3::new(
                rng.gen_range(-1.0..=1.0),
                rng.gen_range(-1.0..=1.0),
                rng.gen_range(0.0..=1.0),
            )
            .try_normalize()
            .unwrap_or(Vec3::Z);
            let t = i as f32 / count as f32;
            let scale = 0.1 + (1.0 - 0.1) * t * t;
            direction * rng.gen_range(0.0..=1.0f32) * scale
        })
        .collect()
}

/// Rotation vectors around the surface normal, RGBA8 encoded.
fn noise_texture(seed: u64) -> TextureData {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x4E01_5E);
    let encode = |v: f32| ((v * 0.5 + 0.5) * 255.0).round() as u8;
    let data = (0..NOISE_SIZE * NOISE_SIZE)
        .flat_map(|_| {
            let x: f32 = rng.gen_range(-1.0..=1.0);
            let y: f32 = rng.gen_range(-1.0..=1.0);
            [encode(x), encode(y), 128, 255]
        })
        .collect();
    TextureData {
        width: NOISE_SIZE,
        height: NOISE_SIZE,
        format: TextureFormat::Rgba8Unorm,
        data,
        name: "SSAO Noise".into(),
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SsaoParams {
    kernel: [Vec4; MAX_SSAO_SAMPLES],
    /// x = radius, y = bias, z = intensity, w = sample count
    settings: Vec4,
    /// xy = output size / noise size
    noise_scale: Vec4,
}

pub struct SsaoStage {
    pass: FullscreenPass,
    output: RenderTarget,
    params: BufferHandle,
    noise: GpuTexture,
    noise_sampler: SamplerHandle,
    settings: SsaoSettings,
    enabled: bool,
}

impl SsaoStage {
    pub const OUTPUT_FORMAT: TextureFormat = TextureFormat::R8Unorm;

    pub fn new(
        backend: &mut dyn GraphicsBackend,
        resources: FullscreenResources,
        layouts: &GpuLayouts,
        settings: SsaoSettings,
        enabled: bool,
        size: (u32, u32),
    ) -> EngineResult<Self> {
        let entries = [
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::texture_2d(),
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::texture_2d_unfilterable(),
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::texture_2d(),
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
            BindGroupLayoutEntry {
                binding: 4,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
        ];
        let pass = FullscreenPass::new(backend, "Ambient Occlusion", resources, &entries, &[layouts.camera])?;

        let output = RenderTarget::new(backend, "Ambient Occlusion", Self::OUTPUT_FORMAT, size.0, size.1, 1)?;
        let noise = GpuTexture::create(backend, &noise_texture(settings.seed))?;
        let noise_sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("SSAO Noise Sampler".into()),
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            compare: None,
        })?;
        let params = backend.create_buffer(&BufferDescriptor {
            label: Some("SSAO Params".into()),
            size: std::mem::size_of::<SsaoParams>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;

        let stage = Self {
            pass,
            output,
            params,
            noise,
            noise_sampler,
            settings,
            enabled,
        };
        stage.write_params(backend);
        Ok(stage)
    }

    fn write_params(&self, backend: &mut dyn GraphicsBackend) {
        let kernel = ssao_kernel(self.settings.sample_count as usize, self.settings.seed);
        let mut params = SsaoParams::zeroed();
        for (slot, offset) in params.kernel.iter_mut().zip(&kernel) {
            *slot = offset.extend(0.0);
        }
        params.settings = Vec4::new(
            self.settings.radius,
            self.settings.bias,
            self.settings.intensity,
            kernel.len() as f32,
        );
        let (width, height) = self.output.size();
        params.noise_scale = Vec4::new(
            width as f32 / NOISE_SIZE as f32,
            height as f32 / NOISE_SIZE as f32,
            0.0,
            0.0,
        );
        backend.write_buffer(self.params, 0, bytemuck::bytes_of(&params));
    }

    pub fn settings(&self) -> &SsaoSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, backend: &mut dyn GraphicsBackend, settings: SsaoSettings) {
        self.settings = settings;
        self.write_params(backend);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn output(&self) -> &RenderTarget {
        &self.output
    }

    /// Drop the bind group after the G-buffer was recreated.
    pub fn invalidate(&mut self, backend: &mut dyn GraphicsBackend) {
        self.pass.invalidate(backend);
    }

    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> EngineResult<()> {
        self.output.resize(backend, width, height)?;
        self.pass.invalidate(backend);
        self.write_params(backend);
        Ok(())
    }

    /// Compute occlusion from the G-buffer. Returns the view to sample it from.
    pub fn apply(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        frame: &SceneFrame<'_>,
        gbuffer: &GBufferPass,
    ) -> EngineResult<TextureViewHandle> {
        if !self.enabled {
            backend.begin_render_pass(&RenderPassDescriptor {
                label: Some("Ambient Occlusion".into()),
                color_attachments: vec![self.output.color_attachment(LoadOp::Clear([1.0, 1.0, 1.0, 1.0]))],
                depth_stencil_attachment: None,
            });
            backend.end_render_pass();
            return Ok(self.output.sample_view());
        }

        let normal = gbuffer.normal().sample_view();
        let linear_depth = gbuffer.linear_depth().sample_view();
        let (noise, sampler, params) = (self.noise.view, self.noise_sampler, self.params);
        self.pass.run(
            backend,
            self.output.color_attachment(LoadOp::Clear([1.0, 1.0, 1.0, 1.0])),
            Self::OUTPUT_FORMAT,
            self.output.size(),
            &[frame.camera.bind_group],
            0,
            || {
                vec![
                    (0, BindGroupEntry::Texture(normal)),
                    (1, BindGroupEntry::Texture(linear_depth)),
                    (2, BindGroupEntry::Texture(noise)),
                    (3, BindGroupEntry::Sampler(sampler)),
                    (
                        4,
                        BindGroupEntry::Buffer {
                            buffer: params,
                            offset: 0,
                            size: None,
                        },
                    ),
                ]
            },
        )?;
        Ok(self.output.sample_view())
    }

    pub fn release(self, cache: &ResourceCache, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.params);
        backend.destroy_sampler(self.noise_sampler);
        self.noise.destroy(backend);
        self.output.destroy(backend);
        self.pass.release(cache, backend);
    }
}

pub const SSAO_TECHNIQUE: &str = r#"{
    "shader": "../shaders/ssao.wgsl",
    "category": "fullscreen",
    "cull": "none",
    "depth_test": false,
    "depth_write": false
}"#;

pub const SSAO_SHADER: &str = r#"
struct CameraUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    inv_proj: mat4x4<f32>,
    position: vec4<f32>,
    near_far: vec4<f32>,
}

struct SsaoParams {
    kernel: array<vec4<f32>, 64>,
    // x = radius, y = bias, z = intensity, w = sample count
    settings: vec4<f32>,
    noise_scale: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;
@group(1) @binding(0) var gbuffer_normal: texture_2d<f32>;
@group(1) @binding(1) var gbuffer_linear_depth: texture_2d<f32>;
@group(1) @binding(2) var noise_texture: texture_2d<f32>;
@group(1) @binding(3) var noise_sampler: sampler;
@group(1) @binding(4) var<uniform> params: SsaoParams;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = vec4<f32>(position.xy, 0.0, 1.0);
    output.uv = vec2<f32>(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
    return output;
}

fn world_position(uv: vec2<f32>, linear_depth: f32) -> vec3<f32> {
    let far_point = camera.inv_proj * vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, 1.0, 1.0);
    let ray = far_point.xyz / far_point.w;
    return (camera.inv_view * vec4<f32>(ray * (linear_depth / -ray.z), 1.0)).xyz;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let size = vec2<i32>(textureDimensions(gbuffer_linear_depth));
    let pixel = vec2<i32>(input.position.xy);
    let depth = textureLoad(gbuffer_linear_depth, pixel, 0).r;
    if depth <= 0.0 {
        return vec4<f32>(1.0);
    }

    let position = world_position(input.uv, depth);
    let normal = normalize(textureLoad(gbuffer_normal, pixel, 0).xyz);
    let random = vec3<f32>(textureSample(noise_texture, noise_sampler, input.uv * params.noise_scale.xy).xy * 2.0 - 1.0, 0.0);

    let tangent = normalize(random - normal * dot(random, normal) + vec3<f32>(1e-4, 0.0, 0.0));
    let bitangent = cross(normal, tangent);

    let radius = params.settings.x;
    let bias = params.settings.y;
    let count = u32(params.settings.w);
    var occlusion = 0.0;
    for (var i = 0u; i < count; i = i + 1u) {
        let offset = params.kernel[i].xyz;
        let sample_pos = position + (tangent * offset.x + bitangent * offset.y + normal * offset.z) * radius;
        let clip = camera.view_proj * vec4<f32>(sample_pos, 1.0);
        let ndc = clip.xy / clip.w;
        let sample_uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        let sample_pixel = clamp(vec2<i32>(sample_uv * vec2<f32>(size)), vec2<i32>(0), size - vec2<i32>(1));
        let scene_depth = textureLoad(gbuffer_linear_depth, sample_pixel, 0).r;
        let sample_depth = -(camera.view * vec4<f32>(sample_pos, 1.0)).z;
        let range = smoothstep(0.0, 1.0, radius / max(abs(depth - scene_depth), 1e-4));
        if scene_depth > 0.0 && scene_depth <= sample_depth - bias {
            occlusion = occlusion + range;
        }
    }

    let ao = clamp(1.0 - occlusion / f32(max(count, 1u)) * params.settings.z, 0.0, 1.0);
    return vec4<f32>(ao, ao, ao, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_lies_in_the_unit_hemisphere() {
        let kernel = ssao_kernel(32, 7);
        assert_eq!(kernel.len(), 32);
        for offset in &kernel {
            assert!(offset.z >= 0.0);
            assert!(offset.length() <= 1.0 + 1e-5);
        }
    }

    #[test]
    fn kernel_is_seeded() {
        assert_eq!(ssao_kernel(16, 3), ssao_kernel(16, 3));
        assert_ne!(ssao_kernel(16, 3), ssao_kernel(16, 4));
    }

    #[test]
    fn kernel_size_is_bounded() {
        assert_eq!(ssao_kernel(1000, 1).len(), MAX_SSAO_SAMPLES);
        assert_eq!(ssao_kernel(0, 1).len(), 1);
    }

    #[test]
    fn noise_is_a_tiny_linear_texture() {
        let noise = noise_texture(1);
        assert_eq!((noise.width, noise.height), (4, 4));
        assert_eq!(noise.data.len(), 64);
        assert_eq!(noise.format, TextureFormat::Rgba8Unorm);
    }

    #[test]
    fn params_fit_a_uniform_block() {
        assert_eq!(std::mem::size_of::<SsaoParams>(), 16 * (MAX_SSAO_SAMPLES + 2));
    }
}
