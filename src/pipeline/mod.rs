//! Deferred rendering pipeline
//!
//! Every frame runs the same fixed sequence of passes:
//! 1. G-Buffer - the solid category into albedo, normal, emissive and linear depth
//! 2. Lighting - one HDR pass: the full-screen light accumulation, the skybox
//!    over background pixels, then the sky category
//! 3. Transparency - the transparent category blended over the lit image
//! 4. Post-processing - ambient occlusion, tone mapping with automatic
//!    exposure, FXAA into the swapchain
//!
//! A frame goes `begin_frame` → `generate_frame` → `end_frame` and ends either
//! complete (presented) or aborted (the acquired image is dropped and the last
//! presented image stays on screen).

mod fullscreen;
mod gbuffer_pass;
mod layouts;
mod lighting_pass;
pub mod postprocess;
mod render_target;
mod sky_pass;
mod transparency_pass;

pub use fullscreen::{FullscreenPass, FullscreenResources};
pub use gbuffer_pass::{GBufferPass, GBUFFER_SHADER, GBUFFER_TECHNIQUE};
pub use layouts::{CameraBinding, DefaultTextures, GpuLayouts};
pub use lighting_pass::{LightingPass, LIGHTING_SHADER, LIGHTING_TECHNIQUE};
pub use render_target::{DepthTarget, RenderTarget};
pub use sky_pass::{SkyPass, SKYBOX_SHADER, SKYBOX_TECHNIQUE};
pub use transparency_pass::{TransparencyPass, FORWARD_SHADER, FORWARD_TECHNIQUE};

use glam::Vec3;
use serde::Deserialize;

use crate::assets::{AssetResult, Handle, ResourceCache};
use crate::backend::*;
use crate::draw::{DrawRegistry, DrawStats, PassTargets};
use crate::error::{EngineError, EngineResult};
use crate::resources::Cubemap;
use crate::scene::{Camera, GpuLightData};
use postprocess::{
    FxaaStage, SsaoSettings, SsaoStage, TonemapResources, TonemapSettings, TonemapStage, FXAA_SHADER, FXAA_TECHNIQUE,
    LUMINANCE_DOWNSAMPLE_SHADER, LUMINANCE_DOWNSAMPLE_TECHNIQUE, LUMINANCE_EXTRACT_SHADER, LUMINANCE_EXTRACT_TECHNIQUE,
    SSAO_SHADER, SSAO_TECHNIQUE, TONEMAP_SHADER, TONEMAP_TECHNIQUE,
};

pub const OPAQUE_TECHNIQUE_PATH: &str = "builtin://techniques/opaque.json";
pub const TRANSPARENT_TECHNIQUE_PATH: &str = "builtin://techniques/transparent.json";
pub const DEFAULT_MATERIAL_PATH: &str = "builtin://materials/default.json";
pub const GLASS_MATERIAL_PATH: &str = "builtin://materials/glass.json";

const DEFAULT_MATERIAL: &str = r#"{
    "technique": "../techniques/opaque.json",
    "base_color": [0.8, 0.8, 0.8, 1.0],
    "roughness": 0.6
}"#;

const GLASS_MATERIAL: &str = r#"{
    "technique": "../techniques/transparent.json",
    "base_color": [0.6, 0.8, 1.0, 0.35],
    "roughness": 0.05
}"#;

/// Shaders, techniques and materials compiled into the crate.
pub fn builtin_files() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("builtin://shaders/gbuffer.wgsl", GBUFFER_SHADER.as_bytes()),
        ("builtin://shaders/forward.wgsl", FORWARD_SHADER.as_bytes()),
        ("builtin://shaders/lighting.wgsl", LIGHTING_SHADER.as_bytes()),
        ("builtin://shaders/skybox.wgsl", SKYBOX_SHADER.as_bytes()),
        ("builtin://shaders/ssao.wgsl", SSAO_SHADER.as_bytes()),
        ("builtin://shaders/tonemap.wgsl", TONEMAP_SHADER.as_bytes()),
        ("builtin://shaders/luminance_extract.wgsl", LUMINANCE_EXTRACT_SHADER.as_bytes()),
        ("builtin://shaders/luminance_downsample.wgsl", LUMINANCE_DOWNSAMPLE_SHADER.as_bytes()),
        ("builtin://shaders/fxaa.wgsl", FXAA_SHADER.as_bytes()),
        (OPAQUE_TECHNIQUE_PATH, GBUFFER_TECHNIQUE.as_bytes()),
        (TRANSPARENT_TECHNIQUE_PATH, FORWARD_TECHNIQUE.as_bytes()),
        ("builtin://techniques/lighting.json", LIGHTING_TECHNIQUE.as_bytes()),
        ("builtin://techniques/skybox.json", SKYBOX_TECHNIQUE.as_bytes()),
        ("builtin://techniques/ssao.json", SSAO_TECHNIQUE.as_bytes()),
        ("builtin://techniques/tonemap.json", TONEMAP_TECHNIQUE.as_bytes()),
        ("builtin://techniques/luminance_extract.json", LUMINANCE_EXTRACT_TECHNIQUE.as_bytes()),
        ("builtin://techniques/luminance_downsample.json", LUMINANCE_DOWNSAMPLE_TECHNIQUE.as_bytes()),
        ("builtin://techniques/fxaa.json", FXAA_TECHNIQUE.as_bytes()),
        (DEFAULT_MATERIAL_PATH, DEFAULT_MATERIAL.as_bytes()),
        (GLASS_MATERIAL_PATH, GLASS_MATERIAL.as_bytes()),
    ]
}

/// Technique of every full-screen pass
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PassTechniques {
    pub lighting: String,
    pub skybox: String,
    pub ssao: String,
    pub tonemap: String,
    pub luminance_extract: String,
    pub luminance_downsample: String,
    pub fxaa: String,
}

impl Default for PassTechniques {
    fn default() -> Self {
        Self {
            lighting: "builtin://techniques/lighting.json".into(),
            skybox: "builtin://techniques/skybox.json".into(),
            ssao: "builtin://techniques/ssao.json".into(),
            tonemap: "builtin://techniques/tonemap.json".into(),
            luminance_extract: "builtin://techniques/luminance_extract.json".into(),
            luminance_downsample: "builtin://techniques/luminance_downsample.json".into(),
            fxaa: "builtin://techniques/fxaa.json".into(),
        }
    }
}

/// Configuration for the Deferred pipeline
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    /// Samples of the scene targets: 1, 2, 4 or 8
    pub msaa_samples: u32,
    pub enable_ssao: bool,
    pub enable_fxaa: bool,
    /// Cubemap descriptor drawn behind the scene
    pub skybox: Option<String>,
    pub ambient: [f32; 3],
    pub ssao: SsaoSettings,
    pub tonemap: TonemapSettings,
    pub techniques: PassTechniques,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            msaa_samples: 1,
            enable_ssao: true,
            enable_fxaa: true,
            skybox: None,
            ambient: [0.03, 0.03, 0.04],
            ssao: SsaoSettings::default(),
            tonemap: TonemapSettings::default(),
            techniques: PassTechniques::default(),
        }
    }
}

impl DeferredConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !matches!(self.msaa_samples, 1 | 2 | 4 | 8) {
            return Err(EngineError::configuration(
                "Pipeline",
                format!("msaa_samples must be 1, 2, 4 or 8, got {}", self.msaa_samples),
            ));
        }
        Ok(())
    }
}

/// What the passes of one frame share.
pub struct SceneFrame<'a> {
    pub layouts: &'a GpuLayouts,
    pub camera: &'a CameraBinding,
    pub camera_position: Vec3,
    pub frame_index: u64,
    pub size: (u32, u32),
}

/// Per-frame input of `generate_frame`.
pub struct FrameInput<'a> {
    /// Composite camera; `None` aborts the frame
    pub camera: Option<Camera>,
    pub lights: &'a [GpuLightData],
    pub ambient: Vec3,
    /// Seconds since the previous frame
    pub dt: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Complete,
    Aborted,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub frame_index: u64,
    pub solid: DrawStats,
    pub sky: DrawStats,
    pub transparent: DrawStats,
    pub exposure: f32,
    pub luminance: Option<f32>,
}

enum FrameState {
    Idle,
    Recording(FrameContext),
    Complete,
    Aborted,
}

pub struct DeferredPipeline {
    cache: ResourceCache,
    config: DeferredConfig,
    size: (u32, u32),
    layouts: GpuLayouts,
    camera: CameraBinding,
    depth: DepthTarget,
    hdr: RenderTarget,
    gbuffer: GBufferPass,
    lighting: LightingPass,
    sky: SkyPass,
    ssao: SsaoStage,
    tonemap: TonemapStage,
    fxaa: FxaaStage,
    state: FrameState,
    frame_index: u64,
    stats: FrameStats,
}

impl DeferredPipeline {
    pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

    /// Load every pass technique, then create the targets at the surface size.
    pub async fn load(
        cache: &ResourceCache,
        backend: &mut dyn GraphicsBackend,
        config: DeferredConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let techniques = &config.techniques;
        let (lighting, ssao, tonemap, extract, downsample, fxaa, sky) = futures::join!(
            FullscreenResources::load(cache, &techniques.lighting),
            FullscreenResources::load(cache, &techniques.ssao),
            FullscreenResources::load(cache, &techniques.tonemap),
            FullscreenResources::load(cache, &techniques.luminance_extract),
            FullscreenResources::load(cache, &techniques.luminance_downsample),
            FullscreenResources::load(cache, &techniques.fxaa),
            load_skybox(cache, &techniques.skybox, config.skybox.as_deref()),
        );

        let mut loaded = Vec::with_capacity(6);
        let mut failure = None;
        for result in [lighting, ssao, tonemap, extract, downsample, fxaa] {
            match result {
                Ok(resources) => loaded.push(resources),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        let sky = sky.unwrap_or_else(|err| {
            failure.get_or_insert(err);
            None
        });
        if let Some(err) = failure {
            for resources in loaded {
                resources.release(cache);
            }
            if let Some((resources, cubemap)) = sky {
                resources.release(cache);
                cache.release(cubemap);
            }
            return Err(err.into());
        }
        let [lighting, ssao, tonemap, extract, downsample, fxaa]: [FullscreenResources; 6] = loaded
            .try_into()
            .map_err(|_| EngineError::configuration("Pipeline", "pass techniques missing"))?;

        let size = backend.surface_size();
        let samples = config.msaa_samples;
        let layouts = GpuLayouts::new(backend)
            .map_err(|err| EngineError::configuration("Pipeline", format!("scene bind group layouts: {err}")))?;
        let camera = CameraBinding::new(backend, &layouts)?;
        let depth = DepthTarget::new(backend, size.0, size.1, samples)?;
        let hdr = RenderTarget::new(backend, "HDR Color", Self::HDR_FORMAT, size.0, size.1, samples)?;
        let gbuffer = GBufferPass::new(backend, size.0, size.1, samples)?;
        let lighting = LightingPass::new(backend, lighting, &layouts)?;
        let sky = match sky {
            Some((resources, cubemap)) => SkyPass::new(backend, resources, cubemap, &layouts)?,
            None => SkyPass::without_skybox(),
        };
        let ssao = SsaoStage::new(backend, ssao, &layouts, config.ssao.clone(), config.enable_ssao, size)?;
        let tonemap = TonemapStage::new(
            backend,
            TonemapResources {
                tonemap,
                extract,
                downsample,
            },
            config.tonemap.clone(),
            size,
        )?;
        let fxaa = FxaaStage::new(backend, fxaa, config.enable_fxaa, config.tonemap.gamma, size)?;

        log::info!(
            "Deferred pipeline ready at {}x{} ({}x MSAA, SSAO {}, FXAA {}, skybox {})",
            size.0,
            size.1,
            samples,
            config.enable_ssao,
            config.enable_fxaa,
            sky.has_skybox()
        );

        Ok(Self {
            cache: cache.clone(),
            config,
            size,
            layouts,
            camera,
            depth,
            hdr,
            gbuffer,
            lighting,
            sky,
            ssao,
            tonemap,
            fxaa,
            state: FrameState::Idle,
            frame_index: 0,
            stats: FrameStats {
                exposure: 1.0,
                ..Default::default()
            },
        })
    }

    pub fn config(&self) -> &DeferredConfig {
        &self.config
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn layouts(&self) -> &GpuLayouts {
        &self.layouts
    }

    pub fn gbuffer(&self) -> &GBufferPass {
        &self.gbuffer
    }

    pub fn hdr(&self) -> &RenderTarget {
        &self.hdr
    }

    pub fn ssao(&self) -> &SsaoStage {
        &self.ssao
    }

    pub fn tonemap(&self) -> &TonemapStage {
        &self.tonemap
    }

    /// Counters of the last generated frame.
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn set_ssao_enabled(&mut self, enabled: bool) {
        self.config.enable_ssao = enabled;
        self.ssao.set_enabled(enabled);
    }

    pub fn set_fxaa_enabled(&mut self, backend: &mut dyn GraphicsBackend, enabled: bool) {
        self.config.enable_fxaa = enabled;
        self.fxaa.set_enabled(backend, enabled);
    }

    pub fn set_tonemap_settings(&mut self, backend: &mut dyn GraphicsBackend, settings: TonemapSettings) {
        self.tonemap.set_settings(backend, settings);
        self.config.tonemap = self.tonemap.settings().clone();
    }

    pub fn begin_frame(&mut self, backend: &mut dyn GraphicsBackend) -> EngineResult<()> {
        if !matches!(self.state, FrameState::Idle) {
            return Err(EngineError::configuration(
                "Frame",
                "begin_frame called before the previous frame ended",
            ));
        }
        let frame = backend.begin_frame()?;
        self.state = FrameState::Recording(frame);
        Ok(())
    }

    /// Record every pass of the frame. Errors abandon the frame.
    pub fn generate_frame(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        registry: &mut DrawRegistry,
        input: FrameInput<'_>,
    ) -> EngineResult<FrameOutcome> {
        let FrameState::Recording(frame) = self.state else {
            return Err(EngineError::configuration(
                "Frame",
                "generate_frame called outside begin_frame/end_frame",
            ));
        };

        let Some(camera) = input.camera else {
            log::debug!("Frame {} aborted: no main camera", self.frame_index);
            self.abort(backend);
            return Ok(FrameOutcome::Aborted);
        };

        let result = match self.resize(backend, frame.width, frame.height) {
            Ok(()) => self.record(backend, registry, &camera, &input, frame.swapchain_view),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.state = FrameState::Complete;
                Ok(FrameOutcome::Complete)
            }
            Err(err) => {
                log::error!("Frame {} aborted: {err}", self.frame_index);
                self.abort(backend);
                Err(err)
            }
        }
    }

    fn abort(&mut self, backend: &mut dyn GraphicsBackend) {
        backend.abandon_frame();
        self.tonemap.frame_abandoned(self.frame_index);
        self.state = FrameState::Aborted;
    }

    fn record(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        registry: &mut DrawRegistry,
        camera: &Camera,
        input: &FrameInput<'_>,
        swapchain: TextureViewHandle,
    ) -> EngineResult<()> {
        let (width, height) = self.size;
        self.camera.update(backend, &camera.uniform_data(width, height));
        self.lighting.update_lights(backend, input.ambient, input.lights);

        let scene = SceneFrame {
            layouts: &self.layouts,
            camera: &self.camera,
            camera_position: camera.position,
            frame_index: self.frame_index,
            size: self.size,
        };

        let solid = self.gbuffer.execute(backend, &scene, registry, &self.depth);

        let hdr_targets = PassTargets {
            color_formats: vec![self.hdr.format()],
            depth_format: Some(DepthTarget::FORMAT),
            sample_count: self.hdr.sample_count(),
        };
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Lighting".into()),
            color_attachments: vec![self.hdr.color_attachment(LoadOp::Clear([0.0, 0.0, 0.0, 1.0]))],
            depth_stencil_attachment: Some(self.depth.read_only_attachment()),
        });
        backend.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        let lit = match self.lighting.record(backend, &scene, &self.gbuffer, &hdr_targets) {
            Ok(()) => self.sky.record(backend, &scene, registry, &hdr_targets),
            Err(err) => Err(err),
        };
        backend.end_render_pass();
        let sky = lit?;

        let transparent = TransparencyPass::execute(backend, &scene, registry, &self.hdr, &self.depth);

        let ambient_occlusion = self.ssao.apply(backend, &scene, &self.gbuffer)?;
        let tonemapped = self
            .tonemap
            .apply(backend, &self.hdr, ambient_occlusion, self.frame_index, input.dt)?;
        self.fxaa.apply(backend, tonemapped, swapchain)?;

        self.stats = FrameStats {
            frame_index: self.frame_index,
            solid,
            sky,
            transparent,
            exposure: self.tonemap.exposure(),
            luminance: self.tonemap.luminance(),
        };
        Ok(())
    }

    /// Present a complete frame. Returns how the frame ended.
    pub fn end_frame(&mut self, backend: &mut dyn GraphicsBackend) -> EngineResult<FrameOutcome> {
        let result = match std::mem::replace(&mut self.state, FrameState::Idle) {
            FrameState::Complete => backend.end_frame().map(|()| FrameOutcome::Complete).map_err(Into::into),
            FrameState::Aborted => Ok(FrameOutcome::Aborted),
            FrameState::Recording(_) => {
                log::warn!("Frame {} ended without being generated", self.frame_index);
                backend.abandon_frame();
                self.tonemap.frame_abandoned(self.frame_index);
                Ok(FrameOutcome::Aborted)
            }
            FrameState::Idle => {
                return Err(EngineError::configuration("Frame", "end_frame called without begin_frame"));
            }
        };
        self.frame_index += 1;
        result
    }

    /// Recreate every size-dependent target. Bind groups reading them are
    /// rebuilt on their next use.
    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> EngineResult<()> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == self.size {
            return Ok(());
        }
        self.depth.resize(backend, width, height)?;
        self.hdr.resize(backend, width, height)?;
        self.gbuffer.resize(backend, width, height)?;
        self.lighting.invalidate(backend);
        self.ssao.resize(backend, width, height)?;
        self.tonemap.resize(backend, width, height)?;
        self.fxaa.resize(backend, width, height);
        self.size = (width, height);
        log::info!("Deferred pipeline resized to {width}x{height}");
        Ok(())
    }

    pub fn release(self, backend: &mut dyn GraphicsBackend) {
        let cache = self.cache;
        self.fxaa.release(&cache, backend);
        self.tonemap.release(&cache, backend);
        self.ssao.release(&cache, backend);
        self.sky.release(&cache, backend);
        self.lighting.release(&cache, backend);
        self.gbuffer.destroy(backend);
        self.hdr.destroy(backend);
        self.depth.destroy(backend);
        self.camera.destroy(backend);
        self.layouts.destroy(backend);
    }
}

async fn load_skybox(
    cache: &ResourceCache,
    technique: &str,
    cubemap: Option<&str>,
) -> AssetResult<Option<(FullscreenResources, Handle<Cubemap>)>> {
    let Some(cubemap) = cubemap else {
        return Ok(None);
    };
    let cubemap = cache.fetch::<Cubemap>(cubemap).await?;
    match FullscreenResources::load(cache, technique).await {
        Ok(resources) => Ok(Some((resources, cubemap))),
        Err(err) => {
            cache.release(cubemap);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: DeferredConfig =
            serde_json::from_str(r#"{ "msaa_samples": 4, "tonemap": { "operator": "reinhard" } }"#).unwrap();
        assert_eq!(config.msaa_samples, 4);
        assert!(config.enable_ssao);
        assert_eq!(config.tonemap.operator, postprocess::TonemapOperator::Reinhard);
        assert_eq!(config.techniques, PassTechniques::default());
    }

    #[test]
    fn odd_sample_counts_are_rejected() {
        let config = DeferredConfig {
            msaa_samples: 3,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn every_builtin_technique_has_its_shader() {
        let files = builtin_files();
        let paths: Vec<&str> = files.iter().map(|(path, _)| *path).collect();
        for (path, bytes) in &files {
            if !path.starts_with("builtin://techniques/") {
                continue;
            }
            let descriptor: serde_json::Value = serde_json::from_slice(bytes).unwrap();
            let shader = descriptor["shader"].as_str().unwrap();
            let resolved = format!("builtin://shaders/{}", shader.trim_start_matches("../shaders/"));
            assert!(paths.contains(&resolved.as_str()), "{path} -> {resolved}");
        }
    }
}
