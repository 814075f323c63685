//! Tone mapping with automatic exposure
//!
//! Measures the HDR image through the luminance pyramid, eases the exposure
//! towards the measurement, then maps exposed HDR color (darkened by ambient
//! occlusion) into a gamma-encoded LDR target.

use bytemuck::{Pod, Zeroable};
use serde::Deserialize;

use super::exposure::ExposureController;
use super::luminance::{LuminancePyramid, LuminanceRange};
use crate::assets::ResourceCache;
use crate::backend::*;
use crate::error::EngineResult;
use crate::pipeline::fullscreen::{FullscreenPass, FullscreenResources};
use crate::pipeline::RenderTarget;

/// Tonemapping operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TonemapOperator {
    Reinhard,
    #[default]
    Aces,
    Uncharted2,
    None,
}

impl TonemapOperator {
    fn shader_index(self) -> u32 {
        match self {
            TonemapOperator::Reinhard => 0,
            TonemapOperator::Aces => 1,
            TonemapOperator::Uncharted2 => 2,
            TonemapOperator::None => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TonemapSettings {
    pub operator: TonemapOperator,
    pub gamma: f32,
    pub initial_exposure: f32,
    /// Log2 luminance mapped to the bottom of the pyramid range
    pub min_log_luminance: f32,
    pub max_log_luminance: f32,
    /// Per-second rate of the exponential exposure ease
    pub adaptation_rate: f32,
    /// Frames between a luminance copy and its read on the CPU
    pub readback_latency: u32,
}

impl Default for TonemapSettings {
    fn default() -> Self {
        Self {
            operator: TonemapOperator::Aces,
            gamma: 2.2,
            initial_exposure: 1.0,
            min_log_luminance: -8.0,
            max_log_luminance: 4.0,
            adaptation_rate: 1.5,
            readback_latency: 2,
        }
    }
}

impl TonemapSettings {
    pub fn luminance_range(&self) -> LuminanceRange {
        LuminanceRange {
            min_log: self.min_log_luminance,
            max_log: self.max_log_luminance,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TonemapParams {
    exposure: f32,
    gamma: f32,
    operator: u32,
    _padding: u32,
}

/// Techniques of the passes owned by the tone mapper.
pub struct TonemapResources {
    pub tonemap: FullscreenResources,
    pub extract: FullscreenResources,
    pub downsample: FullscreenResources,
}

pub struct TonemapStage {
    pass: FullscreenPass,
    output: RenderTarget,
    params: BufferHandle,
    sampler: SamplerHandle,
    pyramid: LuminancePyramid,
    exposure: ExposureController,
    settings: TonemapSettings,
}

impl TonemapStage {
    pub const OUTPUT_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

    pub fn new(
        backend: &mut dyn GraphicsBackend,
        resources: TonemapResources,
        settings: TonemapSettings,
        size: (u32, u32),
    ) -> EngineResult<Self> {
        let texture = |binding| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::texture_2d(),
        };
        let entries = [
            texture(0),
            texture(1),
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
        ];
        let pass = FullscreenPass::new(backend, "Tonemapping", resources.tonemap, &entries, &[])?;
        let pyramid = LuminancePyramid::new(
            backend,
            resources.extract,
            resources.downsample,
            settings.luminance_range(),
            settings.readback_latency,
            size,
        )?;

        let output = RenderTarget::new(backend, "Tonemapped", Self::OUTPUT_FORMAT, size.0, size.1, 1)?;
        let params = backend.create_buffer(&BufferDescriptor {
            label: Some("Tonemap Params".into()),
            size: std::mem::size_of::<TonemapParams>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Tonemap Sampler".into()),
            ..Default::default()
        })?;

        Ok(Self {
            pass,
            output,
            params,
            sampler,
            pyramid,
            exposure: ExposureController::new(settings.initial_exposure, settings.adaptation_rate),
            settings,
        })
    }

    pub fn settings(&self) -> &TonemapSettings {
        &self.settings
    }

    /// Swap operator, gamma and adaptation. The readback latency is fixed for
    /// the lifetime of the stage.
    pub fn set_settings(&mut self, backend: &mut dyn GraphicsBackend, mut settings: TonemapSettings) {
        if settings.readback_latency != self.settings.readback_latency {
            log::warn!(
                "Ignoring readback latency {}: the luminance ring was built for {} frames",
                settings.readback_latency,
                self.settings.readback_latency
            );
            settings.readback_latency = self.settings.readback_latency;
        }
        self.pyramid.set_range(backend, settings.luminance_range());
        self.exposure.set_adaptation_rate(settings.adaptation_rate);
        self.settings = settings;
    }

    pub fn exposure(&self) -> f32 {
        self.exposure.exposure()
    }

    /// Latest average scene luminance read back from the GPU.
    pub fn luminance(&self) -> Option<f32> {
        self.pyramid.latest()
    }

    pub fn pyramid(&self) -> &LuminancePyramid {
        &self.pyramid
    }

    pub fn output(&self) -> &RenderTarget {
        &self.output
    }

    pub fn invalidate(&mut self, backend: &mut dyn GraphicsBackend) {
        self.pass.invalidate(backend);
        self.pyramid.invalidate(backend);
    }

    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> EngineResult<()> {
        self.output.resize(backend, width, height)?;
        self.pass.invalidate(backend);
        self.pyramid.resize(backend, width, height)
    }

    /// The frame that requested readbacks was dropped before submission.
    pub fn frame_abandoned(&mut self, frame_index: u64) {
        self.pyramid.discard_pending(frame_index);
    }

    pub fn apply(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        hdr: &RenderTarget,
        ambient_occlusion: TextureViewHandle,
        frame_index: u64,
        dt: f32,
    ) -> EngineResult<TextureViewHandle> {
        let hdr_view = hdr.sample_view();
        let measured = self.pyramid.measure(backend, hdr_view, frame_index)?;
        let exposure = self.exposure.update(measured, dt);

        let params = TonemapParams {
            exposure,
            gamma: self.settings.gamma.max(f32::EPSILON),
            operator: self.settings.operator.shader_index(),
            _padding: 0,
        };
        backend.write_buffer(self.params, 0, bytemuck::bytes_of(&params));

        let (sampler, params) = (self.sampler, self.params);
        self.pass.run(
            backend,
            self.output.color_attachment(LoadOp::Clear([0.0, 0.0, 0.0, 1.0])),
            Self::OUTPUT_FORMAT,
            self.output.size(),
            &[],
            0,
            || {
                vec![
                    (0, BindGroupEntry::Texture(hdr_view)),
                    (1, BindGroupEntry::Texture(ambient_occlusion)),
                    (2, BindGroupEntry::Sampler(sampler)),
                    (
                        3,
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
        backend.destroy_sampler(self.sampler);
        self.output.destroy(backend);
        self.pyramid.release(cache, backend);
        self.pass.release(cache, backend);
    }
}

pub const TONEMAP_TECHNIQUE: &str = r#"{
    "shader": "../shaders/tonemap.wgsl",
    "category": "fullscreen",
    "cull": "none",
    "depth_test": false,
    "depth_write": false
}"#;

pub const TONEMAP_SHADER: &str = r#"
struct TonemapParams {
    exposure: f32,
    gamma: f32,
    operator: u32,
    _padding: u32,
}

@group(0) @binding(0) var hdr_texture: texture_2d<f32>;
@group(0) @binding(1) var ao_texture: texture_2d<f32>;
@group(0) @binding(2) var hdr_sampler: sampler;
@group(0) @binding(3) var<uniform> params: TonemapParams;

fn aces_tonemap(color: vec3<f32>) -> vec3<f32> {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;
    return saturate((color * (a * color + b)) / (color * (c * color + d) + e));
}

fn reinhard_tonemap(color: vec3<f32>) -> vec3<f32> {
    return color / (color + vec3<f32>(1.0));
}

fn uncharted2_curve(x: vec3<f32>) -> vec3<f32> {
    let a = 0.15;
    let b = 0.50;
    let c = 0.10;
    let d = 0.20;
    let e = 0.02;
    let f = 0.30;
    return ((x * (a * x + c * b) + d * e) / (x * (a * x + b) + d * f)) - e / f;
}

fn uncharted2_tonemap(color: vec3<f32>) -> vec3<f32> {
    let white = uncharted2_curve(vec3<f32>(11.2));
    return saturate(uncharted2_curve(color * 2.0) / white);
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = vec4<f32>(position.xy, 0.0, 1.0);
    output.uv = vec2<f32>(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let ao = textureSample(ao_texture, hdr_sampler, input.uv).r;
    var color = textureSample(hdr_texture, hdr_sampler, input.uv).rgb * ao;
    color = color * params.exposure;

    var mapped: vec3<f32>;
    switch params.operator {
        case 0u: { mapped = reinhard_tonemap(color); }
        case 1u: { mapped = aces_tonemap(color); }
        case 2u: { mapped = uncharted2_tonemap(color); }
        default: { mapped = saturate(color); }
    }

    let gamma_corrected = pow(mapped, vec3<f32>(1.0 / params.gamma));
    return vec4<f32>(gamma_corrected, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: TonemapSettings = serde_json::from_str(r#"{ "operator": "uncharted2", "gamma": 2.4 }"#).unwrap();
        assert_eq!(settings.operator, TonemapOperator::Uncharted2);
        assert_eq!(settings.gamma, 2.4);
        assert_eq!(settings.readback_latency, 2);
        assert_eq!(settings.initial_exposure, 1.0);
    }

    #[test]
    fn operators_map_to_shader_branches() {
        let indices: Vec<u32> = [
            TonemapOperator::Reinhard,
            TonemapOperator::Aces,
            TonemapOperator::Uncharted2,
            TonemapOperator::None,
        ]
        .into_iter()
        .map(TonemapOperator::shader_index)
        .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }
}
