//! Log-luminance pyramid
//!
//! The HDR image is reduced to a square power-of-two texture of normalized
//! log-luminance, then halved level by level down to 1x1. The last level is
//! copied into one of a small ring of readback buffers every frame; the value
//! copied `latency` frames ago is read back and decoded on the CPU.

use bytemuck::{Pod, Zeroable};

use crate::assets::ResourceCache;
use crate::backend::*;
use crate::error::EngineResult;
use crate::pipeline::fullscreen::{FullscreenPass, FullscreenResources};
use crate::pipeline::RenderTarget;

pub const LUMINANCE_EPSILON: f32 = 1e-4;
const READBACK_SIZE: u64 = 256;

/// Log2 luminance window mapped onto 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuminanceRange {
    pub min_log: f32,
    pub max_log: f32,
}

impl LuminanceRange {
    fn span(&self) -> f32 {
        (self.max_log - self.min_log).max(f32::EPSILON)
    }

    pub fn encode(&self, luminance: f32) -> f32 {
        (((luminance.max(0.0) + LUMINANCE_EPSILON).log2() - self.min_log) / self.span()).clamp(0.0, 1.0)
    }

    pub fn decode(&self, value: f32) -> f32 {
        (value * self.span() + self.min_log).exp2()
    }
}

/// Largest power of two that fits in both dimensions.
pub fn pyramid_top_size(width: u32, height: u32) -> u32 {
    let side = width.min(height).max(1);
    1 << (31 - side.leading_zeros())
}

/// Side length of every level, top first, ending at 1.
pub fn pyramid_sizes(width: u32, height: u32) -> Vec<u32> {
    let mut size = pyramid_top_size(width, height);
    let mut sizes = vec![size];
    while size > 1 {
        size /= 2;
        sizes.push(size);
    }
    sizes
}

/// CPU reference of the reduction over a square power-of-two grid.
pub fn reduce_log_luminance(values: &[f32], size: usize) -> f32 {
    if size == 0 || values.len() < size * size {
        return 0.0;
    }
    let mut level: Vec<f32> = values[..size * size].to_vec();
    let mut side = size;
    while side > 1 {
        let half = side / 2;
        let mut next = Vec::with_capacity(half * half);
        for y in 0..half {
            for x in 0..half {
                let at = |dx: usize, dy: usize| level[(y * 2 + dy) * side + x * 2 + dx];
                next.push((at(0, 0) + at(1, 0) + at(0, 1) + at(1, 1)) * 0.25);
            }
        }
        level = next;
        side = half;
    }
    level[0]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Pending { frame: u64 },
}

struct Readback {
    buffer: BufferHandle,
    state: SlotState,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct LuminanceParams {
    min_log: f32,
    log_span: f32,
    _padding: [f32; 2],
}

pub struct LuminancePyramid {
    extract: FullscreenPass,
    downsample: FullscreenPass,
    levels: Vec<RenderTarget>,
    params: BufferHandle,
    sampler: SamplerHandle,
    range: LuminanceRange,
    latency: u32,
    readbacks: Vec<Readback>,
    latest: Option<f32>,
}

impl LuminancePyramid {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        extract: FullscreenResources,
        downsample: FullscreenResources,
        range: LuminanceRange,
        latency: u32,
        size: (u32, u32),
    ) -> EngineResult<Self> {
        let extract = FullscreenPass::new(
            backend,
            "Luminance Extract",
            extract,
            &[
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
            ],
            &[],
        )?;
        let downsample = FullscreenPass::new(
            backend,
            "Luminance Downsample",
            downsample,
            &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::texture_2d_unfilterable(),
            }],
            &[],
        )?;

        let levels = create_levels(backend, size)?;
        let params = backend.create_buffer(&BufferDescriptor {
            label: Some("Luminance Params".into()),
            size: std::mem::size_of::<LuminanceParams>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Luminance Sampler".into()),
            ..Default::default()
        })?;

        let mut readbacks = Vec::with_capacity(latency as usize + 1);
        for _ in 0..=latency {
            let buffer = backend.create_buffer(&BufferDescriptor {
                label: Some("Luminance Readback".into()),
                size: READBACK_SIZE,
                usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            })?;
            readbacks.push(Readback {
                buffer,
                state: SlotState::Idle,
            });
        }

        let pyramid = Self {
            extract,
            downsample,
            levels,
            params,
            sampler,
            range,
            latency,
            readbacks,
            latest: None,
        };
        pyramid.write_params(backend);
        Ok(pyramid)
    }

    fn write_params(&self, backend: &mut dyn GraphicsBackend) {
        let params = LuminanceParams {
            min_log: self.range.min_log,
            log_span: self.range.span(),
            _padding: [0.0; 2],
        };
        backend.write_buffer(self.params, 0, bytemuck::bytes_of(&params));
    }

    pub fn range(&self) -> LuminanceRange {
        self.range
    }

    pub fn set_range(&mut self, backend: &mut dyn GraphicsBackend, range: LuminanceRange) {
        self.range = range;
        self.write_params(backend);
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    pub fn level_sizes(&self) -> Vec<u32> {
        self.levels.iter().map(|level| level.size().0).collect()
    }

    /// Most recent luminance read back, if any arrived yet.
    pub fn latest(&self) -> Option<f32> {
        self.latest
    }

    /// Forget bind groups referring to the HDR input.
    pub fn invalidate(&mut self, backend: &mut dyn GraphicsBackend) {
        self.extract.invalidate(backend);
    }

    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> EngineResult<()> {
        self.extract.invalidate(backend);
        if self.levels.first().map(|level| level.size().0) == Some(pyramid_top_size(width, height)) {
            return Ok(());
        }
        let levels = create_levels(backend, (width, height))?;
        for level in std::mem::replace(&mut self.levels, levels) {
            level.destroy(backend);
        }
        self.downsample.invalidate(backend);
        Ok(())
    }

    /// Reduce `hdr` and return the luminance that became available this frame.
    pub fn measure(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        hdr: TextureViewHandle,
        frame_index: u64,
    ) -> EngineResult<Option<f32>> {
        let (sampler, params) = (self.sampler, self.params);
        let top = &self.levels[0];
        self.extract.run(
            backend,
            top.color_attachment(LoadOp::Clear([0.0, 0.0, 0.0, 0.0])),
            top.format(),
            top.size(),
            &[],
            0,
            || {
                vec![
                    (0, BindGroupEntry::Texture(hdr)),
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
        )?;

        for index in 1..self.levels.len() {
            let source = self.levels[index - 1].sample_view();
            let target = &self.levels[index];
            self.downsample.run(
                backend,
                target.color_attachment(LoadOp::Clear([0.0, 0.0, 0.0, 0.0])),
                target.format(),
                target.size(),
                &[],
                index,
                || vec![(0, BindGroupEntry::Texture(source))],
            )?;
        }

        let measured = self.poll(backend, frame_index)?;
        self.request(backend, frame_index);
        Ok(measured)
    }

    fn poll(&mut self, backend: &mut dyn GraphicsBackend, frame_index: u64) -> EngineResult<Option<f32>> {
        let mut measured = None;
        for slot in &mut self.readbacks {
            let SlotState::Pending { frame } = slot.state else {
                continue;
            };
            if frame + u64::from(self.latency) > frame_index {
                continue;
            }
            let Some(bytes) = backend.try_read_buffer(slot.buffer)? else {
                continue;
            };
            slot.state = SlotState::Idle;
            let Some(raw) = bytes.get(..4) else {
                return Err(BackendError::ReadbackFailed(format!("luminance readback of {} bytes", bytes.len())).into());
            };
            let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if !value.is_finite() {
                log::warn!("Discarding non-finite luminance readback from frame {frame}");
                continue;
            }
            let luminance = self.range.decode(value);
            log::trace!("Luminance from frame {frame}: {luminance}");
            measured = Some(luminance);
        }
        if measured.is_some() {
            self.latest = measured;
        }
        Ok(measured)
    }

    fn request(&mut self, backend: &mut dyn GraphicsBackend, frame_index: u64) {
        let index = (frame_index % self.readbacks.len() as u64) as usize;
        let slot = &mut self.readbacks[index];
        if slot.state != SlotState::Idle {
            log::trace!("Luminance readback slot {index} still pending, skipping frame {frame_index}");
            return;
        }
        let Some(average) = self.levels.last() else {
            return;
        };
        backend.copy_texture_to_buffer(average.texture(), slot.buffer, 1, 1);
        backend.map_buffer_read(slot.buffer);
        slot.state = SlotState::Pending { frame: frame_index };
    }

    /// Forget readbacks requested by a frame that was never submitted.
    pub fn discard_pending(&mut self, frame_index: u64) {
        for slot in &mut self.readbacks {
            if slot.state == (SlotState::Pending { frame: frame_index }) {
                slot.state = SlotState::Idle;
            }
        }
    }

    pub fn release(self, cache: &ResourceCache, backend: &mut dyn GraphicsBackend) {
        for slot in self.readbacks {
            backend.destroy_buffer(slot.buffer);
        }
        for level in self.levels {
            level.destroy(backend);
        }
        backend.destroy_buffer(self.params);
        backend.destroy_sampler(self.sampler);
        self.extract.release(cache, backend);
        self.downsample.release(cache, backend);
    }
}

fn create_levels(backend: &mut dyn GraphicsBackend, size: (u32, u32)) -> BackendResult<Vec<RenderTarget>> {
    let sizes = pyramid_sizes(size.0, size.1);
    let mut levels = Vec::with_capacity(sizes.len());
    for side in sizes {
        let created = if side == 1 {
            RenderTarget::with_usage(
                backend,
                "Luminance Average",
                TextureFormat::R32Float,
                1,
                1,
                1,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC,
            )
        } else {
            RenderTarget::new(backend, &format!("Luminance {side}"), TextureFormat::R16Float, side, side, 1)
        };
        match created {
            Ok(level) => levels.push(level),
            Err(err) => {
                for level in levels {
                    level.destroy(backend);
                }
                return Err(err);
            }
        }
    }
    Ok(levels)
}

pub const LUMINANCE_EXTRACT_TECHNIQUE: &str = r#"{
    "shader": "../shaders/luminance_extract.wgsl",
    "category": "fullscreen",
    "cull": "none",
    "depth_test": false,
    "depth_write": false
}"#;

pub const LUMINANCE_EXTRACT_SHADER: &str = r#"
struct LuminanceParams {
    min_log: f32,
    log_span: f32,
    _padding: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(0) var hdr_texture: texture_2d<f32>;
@group(0) @binding(1) var hdr_sampler: sampler;
@group(0) @binding(2) var<uniform> params: LuminanceParams;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = vec4<f32>(position.xy, 0.0, 1.0);
    output.uv = vec2<f32>(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSample(hdr_texture, hdr_sampler, input.uv).rgb;
    let luminance = max(dot(color, vec3<f32>(0.2126, 0.7152, 0.0722)), 0.0);
    let normalized = clamp((log2(luminance + 1e-4) - params.min_log) / params.log_span, 0.0, 1.0);
    return vec4<f32>(normalized, 0.0, 0.0, 1.0);
}
"#;

pub const LUMINANCE_DOWNSAMPLE_TECHNIQUE: &str = r#"{
    "shader": "../shaders/luminance_downsample.wgsl",
    "category": "fullscreen",
    "cull": "none",
    "depth_test": false,
    "depth_write": false
}"#;

pub const LUMINANCE_DOWNSAMPLE_SHADER: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position.xy, 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    let base = vec2<i32>(position.xy) * 2;
    let sum = textureLoad(source, base, 0).r
        + textureLoad(source, base + vec2<i32>(1, 0), 0).r
        + textureLoad(source, base + vec2<i32>(0, 1), 0).r
        + textureLoad(source, base + vec2<i32>(1, 1), 0).r;
    return vec4<f32>(sum * 0.25, 0.0, 0.0, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryAssetIo;
    use crate::backend::headless::ResourceClass;

    const RANGE: LuminanceRange = LuminanceRange {
        min_log: -8.0,
        max_log: 4.0,
    };

    fn load(latency: u32, size: (u32, u32)) -> (ResourceCache, HeadlessBackend, LuminancePyramid) {
        let cache = ResourceCache::new(
            MemoryAssetIo::new()
                .with_file("shaders/luminance_extract.wgsl", LUMINANCE_EXTRACT_SHADER)
                .with_file("shaders/luminance_downsample.wgsl", LUMINANCE_DOWNSAMPLE_SHADER)
                .with_file("techniques/extract.json", LUMINANCE_EXTRACT_TECHNIQUE)
                .with_file("techniques/downsample.json", LUMINANCE_DOWNSAMPLE_TECHNIQUE),
        );
        let mut backend = HeadlessBackend::new(size.0, size.1);
        let extract = pollster::block_on(FullscreenResources::load(&cache, "techniques/extract.json")).unwrap();
        let downsample = pollster::block_on(FullscreenResources::load(&cache, "techniques/downsample.json")).unwrap();
        let pyramid = LuminancePyramid::new(&mut backend, extract, downsample, RANGE, latency, size).unwrap();
        (cache, backend, pyramid)
    }

    fn hdr_view(backend: &mut HeadlessBackend) -> TextureViewHandle {
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: Some("HDR".into()),
                format: TextureFormat::Rgba16Float,
                ..Default::default()
            })
            .unwrap();
        backend.create_texture_view(texture).unwrap()
    }

    #[test]
    fn top_level_is_the_largest_fitting_power_of_two() {
        assert_eq!(pyramid_top_size(1280, 720), 512);
        assert_eq!(pyramid_top_size(256, 256), 256);
        assert_eq!(pyramid_top_size(1, 900), 1);
        assert_eq!(pyramid_sizes(40, 33), vec![32, 16, 8, 4, 2, 1]);
    }

    #[test]
    fn uniform_luminance_reduces_to_itself() {
        let luminance = 0.18;
        let size = 64;
        let values = vec![RANGE.encode(luminance); size * size];
        let reduced = reduce_log_luminance(&values, size);
        let decoded = RANGE.decode(reduced);
        assert!((decoded - luminance).abs() / luminance < 1e-3, "{decoded}");
    }

    #[test]
    fn reduction_averages_in_log_space() {
        let values = [RANGE.encode(1.0), RANGE.encode(4.0), RANGE.encode(1.0), RANGE.encode(4.0)];
        let decoded = RANGE.decode(reduce_log_luminance(&values, 2));
        assert!((decoded - 2.0).abs() < 1e-2, "{decoded}");
    }

    #[test]
    fn readback_arrives_after_the_configured_latency() {
        let (cache, mut backend, mut pyramid) = load(2, (256, 128));
        assert_eq!(pyramid.level_sizes(), vec![128, 64, 32, 16, 8, 4, 2, 1]);

        let luminance = 0.5f32;
        backend.script_texture_contents("Luminance Average", RANGE.encode(luminance).to_le_bytes().to_vec());
        let hdr = hdr_view(&mut backend);

        let mut results = Vec::new();
        for frame in 0..4 {
            backend.begin_frame().unwrap();
            results.push(pyramid.measure(&mut backend, hdr, frame).unwrap());
            backend.end_frame().unwrap();
        }
        assert_eq!(results[0], None);
        assert_eq!(results[1], None);
        let measured = results[2].unwrap();
        assert!((measured - luminance).abs() < 1e-3, "{measured}");
        assert!(results[3].is_some());

        pyramid.release(&cache, &mut backend);
        cache.flush_unloads(&mut backend);
        assert_eq!(backend.live_count(ResourceClass::Buffer), 0);
    }

    #[test]
    fn abandoned_requests_free_their_slot() {
        let (cache, mut backend, mut pyramid) = load(1, (64, 64));
        let hdr = hdr_view(&mut backend);

        backend.begin_frame().unwrap();
        assert_eq!(pyramid.measure(&mut backend, hdr, 0).unwrap(), None);
        backend.abandon_frame();
        pyramid.discard_pending(0);

        for frame in 1..3 {
            backend.begin_frame().unwrap();
            pyramid.measure(&mut backend, hdr, frame).unwrap();
            backend.end_frame().unwrap();
        }
        assert!(pyramid.latest().is_some());
        pyramid.release(&cache, &mut backend);
    }

    #[test]
    fn each_level_is_a_pass() {
        let (cache, mut backend, mut pyramid) = load(2, (16, 16));
        let hdr = hdr_view(&mut backend);
        pyramid.measure(&mut backend, hdr, 0).unwrap();

        let labels = backend.pass_labels();
        assert_eq!(labels.iter().filter(|l| *l == "Luminance Extract").count(), 1);
        assert_eq!(labels.iter().filter(|l| *l == "Luminance Downsample").count(), 4);
        pyramid.release(&cache, &mut backend);
    }
}
