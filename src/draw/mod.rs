//! Draw submission registry ("render manager")
//!
//! Renderable entities submit one draw key per mesh part. Each pass asks the
//! registry to render one category: keys are sorted, consecutive keys sharing a
//! material reuse the bound pipeline and material bind group, and every key
//! gets its own slot of per-draw transform uniforms.

mod key;
mod registry;

pub use key::{DrawKey, DrawKeyId};
pub use registry::DrawRegistry;

use glam::Vec3;
use serde::Deserialize;

use crate::backend::{BindGroupHandle, GraphicsBackend, TextureFormat};
use crate::pipeline::GpuLayouts;
use crate::resources::PipelineKey;

/// Pass a technique's draws belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawCategory {
    /// Opaque geometry written to the G-buffer
    #[default]
    Solid,
    /// Drawn over background pixels after lighting
    Sky,
    /// Blended over the lit image, back to front
    Transparent,
    /// Full-screen post-process techniques; never submitted by entities
    Fullscreen,
}

impl DrawCategory {
    pub const ALL: [DrawCategory; 4] = [
        DrawCategory::Solid,
        DrawCategory::Sky,
        DrawCategory::Transparent,
        DrawCategory::Fullscreen,
    ];

    pub fn sorts_back_to_front(self) -> bool {
        matches!(self, DrawCategory::Transparent)
    }
}

/// Why a key was left out of a frame. Skips are logged and counted, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingMesh,
    MissingMaterial,
    MissingTransform,
    MissingPart,
    PipelineUnavailable,
    BindFailed,
}

/// Counters of one `render_category` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrawStats {
    pub draw_calls: usize,
    pub skipped: usize,
    pub pipeline_binds: usize,
    pub material_binds: usize,
}

impl std::ops::AddAssign for DrawStats {
    fn add_assign(&mut self, rhs: Self) {
        self.draw_calls += rhs.draw_calls;
        self.skipped += rhs.skipped;
        self.pipeline_binds += rhs.pipeline_binds;
        self.material_binds += rhs.material_binds;
    }
}

/// Attachment layout of the pass a category is rendered into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassTargets {
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
}

impl PassTargets {
    pub fn pipeline_key(&self, layouts: &GpuLayouts) -> PipelineKey {
        PipelineKey {
            bind_group_layouts: layouts.scene_layouts(),
            color_formats: self.color_formats.clone(),
            depth_format: self.depth_format,
            sample_count: self.sample_count,
        }
    }
}

/// Everything a pass lends the registry while it renders a category.
pub struct DrawContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub layouts: &'a GpuLayouts,
    pub camera_bind_group: BindGroupHandle,
    pub camera_position: Vec3,
    pub targets: &'a PassTargets,
    pub frame_index: u64,
}
