//! Post-processing chain: ambient occlusion, tone mapping with automatic
//! exposure, then anti-aliasing into the swapchain.

mod exposure;
mod fxaa;
mod luminance;
mod ssao;
mod tonemapping;

pub use exposure::{target_exposure, ExposureController, EXPOSURE_EPSILON, KEY_VALUE};
pub use fxaa::{FxaaStage, FXAA_SHADER, FXAA_TECHNIQUE};
pub use luminance::{
    pyramid_sizes, pyramid_top_size, reduce_log_luminance, LuminancePyramid, LuminanceRange,
    LUMINANCE_DOWNSAMPLE_SHADER, LUMINANCE_DOWNSAMPLE_TECHNIQUE, LUMINANCE_EPSILON, LUMINANCE_EXTRACT_SHADER,
    LUMINANCE_EXTRACT_TECHNIQUE,
};
pub use ssao::{ssao_kernel, SsaoSettings, SsaoStage, MAX_SSAO_SAMPLES, SSAO_SHADER, SSAO_TECHNIQUE};
pub use tonemapping::{
    TonemapOperator, TonemapResources, TonemapSettings, TonemapStage, TONEMAP_SHADER, TONEMAP_TECHNIQUE,
};
