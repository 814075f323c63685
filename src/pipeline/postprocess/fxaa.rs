//! Fast approximate anti-aliasing
//!
//! Last stage of the frame: reads the tone-mapped image and writes the
//! swapchain. Disabled, it copies through unchanged. Its input is already
//! gamma encoded, so an sRGB swapchain gets it decoded first.

use bytemuck::{Pod, Zeroable};

use crate::assets::ResourceCache;
use crate::backend::*;
use crate::error::EngineResult;
use crate::pipeline::fullscreen::{FullscreenPass, FullscreenResources};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FxaaParams {
    inv_size: [f32; 2],
    decode_gamma: f32,
    enabled: f32,
}

pub struct FxaaStage {
    pass: FullscreenPass,
    params: BufferHandle,
    sampler: SamplerHandle,
    enabled: bool,
    gamma: f32,
    format: TextureFormat,
    size: (u32, u32),
}

impl FxaaStage {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        resources: FullscreenResources,
        enabled: bool,
        gamma: f32,
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
                ty: BindingType::Sampler { comparison: false },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
        ];
        let pass = FullscreenPass::new(backend, "FXAA", resources, &entries, &[])?;
        let params = backend.create_buffer(&BufferDescriptor {
            label: Some("FXAA Params".into()),
            size: std::mem::size_of::<FxaaParams>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("FXAA Sampler".into()),
            ..Default::default()
        })?;

        let stage = Self {
            pass,
            params,
            sampler,
            enabled,
            gamma,
            format: backend.swapchain_format(),
            size,
        };
        stage.write_params(backend);
        Ok(stage)
    }

    fn write_params(&self, backend: &mut dyn GraphicsBackend) {
        let params = FxaaParams {
            inv_size: [1.0 / self.size.0.max(1) as f32, 1.0 / self.size.1.max(1) as f32],
            decode_gamma: if self.format.is_srgb() { self.gamma } else { 1.0 },
            enabled: if self.enabled { 1.0 } else { 0.0 },
        };
        backend.write_buffer(self.params, 0, bytemuck::bytes_of(&params));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, backend: &mut dyn GraphicsBackend, enabled: bool) {
        self.enabled = enabled;
        self.write_params(backend);
    }

    pub fn invalidate(&mut self, backend: &mut dyn GraphicsBackend) {
        self.pass.invalidate(backend);
    }

    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) {
        self.size = (width, height);
        self.format = backend.swapchain_format();
        self.pass.invalidate(backend);
        self.write_params(backend);
    }

    /// Resolve `input` into the swapchain view.
    pub fn apply(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        input: TextureViewHandle,
        swapchain: TextureViewHandle,
    ) -> EngineResult<()> {
        let (sampler, params) = (self.sampler, self.params);
        self.pass.run(
            backend,
            ColorAttachment {
                view: swapchain,
                resolve_target: None,
                load_op: LoadOp::Clear([0.0, 0.0, 0.0, 1.0]),
                store_op: StoreOp::Store,
            },
            self.format,
            self.size,
            &[],
            0,
            || {
                vec![
                    (0, BindGroupEntry::Texture(input)),
                    (1, BindGroupEntry::Sampler(sampler)),
                    (
                        2,
                        BindGroupEntry::Buffer {
                            buffer: params,
                            offset: 0,
                            size: None,
                        },
                    ),
                ]
            },
        )
    }

    pub fn release(self, cache: &ResourceCache, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.params);
        backend.destroy_sampler(self.sampler);
        self.pass.release(cache, backend);
    }
}

pub const FXAA_TECHNIQUE: &str = r#"{
    "shader": "../shaders/fxaa.wgsl",
    "category": "fullscreen",
    "cull": "none",
    "depth_test": false,
    "depth_write": false
}"#;

pub const FXAA_SHADER: &str = r#"
struct FxaaParams {
    inv_size: vec2<f32>,
    decode_gamma: f32,
    enabled: f32,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(0) var input_texture: texture_2d<f32>;
@group(0) @binding(1) var input_sampler: sampler;
@group(0) @binding(2) var<uniform> params: FxaaParams;

const REDUCE_MIN: f32 = 1.0 / 128.0;
const REDUCE_MUL: f32 = 1.0 / 8.0;
const SPAN_MAX: f32 = 8.0;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = vec4<f32>(position.xy, 0.0, 1.0);
    output.uv = vec2<f32>(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
    return output;
}

fn luma(color: vec3<f32>) -> f32 {
    return dot(color, vec3<f32>(0.299, 0.587, 0.114));
}

fn fetch(uv: vec2<f32>) -> vec3<f32> {
    return textureSampleLevel(input_texture, input_sampler, uv, 0.0).rgb;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let uv = input.uv;
    let texel = params.inv_size;
    let center = fetch(uv);

    let luma_nw = luma(fetch(uv + vec2<f32>(-1.0, -1.0) * texel));
    let luma_ne = luma(fetch(uv + vec2<f32>(1.0, -1.0) * texel));
    let luma_sw = luma(fetch(uv + vec2<f32>(-1.0, 1.0) * texel));
    let luma_se = luma(fetch(uv + vec2<f32>(1.0, 1.0) * texel));
    let luma_m = luma(center);

    let luma_min = min(luma_m, min(min(luma_nw, luma_ne), min(luma_sw, luma_se)));
    let luma_max = max(luma_m, max(max(luma_nw, luma_ne), max(luma_sw, luma_se)));

    var dir = vec2<f32>(-((luma_nw + luma_ne) - (luma_sw + luma_se)), (luma_nw + luma_sw) - (luma_ne + luma_se));
    let dir_reduce = max((luma_nw + luma_ne + luma_sw + luma_se) * 0.25 * REDUCE_MUL, REDUCE_MIN);
    let rcp_dir_min = 1.0 / (min(abs(dir.x), abs(dir.y)) + dir_reduce);
    dir = clamp(dir * rcp_dir_min, vec2<f32>(-SPAN_MAX), vec2<f32>(SPAN_MAX)) * texel;

    let rgb_a = 0.5 * (fetch(uv + dir * (1.0 / 3.0 - 0.5)) + fetch(uv + dir * (2.0 / 3.0 - 0.5)));
    let rgb_b = rgb_a * 0.5 + 0.25 * (fetch(uv - dir * 0.5) + fetch(uv + dir * 0.5));
    let luma_b = luma(rgb_b);
    let outside = luma_b < luma_min || luma_b > luma_max;
    var color = select(rgb_b, rgb_a, outside);
    color = select(center, color, params.enabled > 0.5);

    return vec4<f32>(pow(color, vec3<f32>(params.decode_gamma)), 1.0);
}
"#;
