//! Techniques: a shader program coupled with fixed-function state
//!
//! A technique also owns the per-draw uniform ring that carries object
//! transforms. Every draw within a frame gets its own slot, addressed through a
//! dynamic offset, so transforms written early in the frame are not overwritten
//! by later draws before submission.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::assets::{Asset, AssetError, AssetResult, LoadContext, ResourceKind};
use crate::backend::*;
use crate::draw::DrawCategory;
use crate::resources::ShaderSource;

const INITIAL_OBJECT_SLOTS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
    Additive,
    Multiply,
}

impl BlendMode {
    pub fn blend_state(&self) -> Option<BlendState> {
        match self {
            BlendMode::Opaque => None,
            BlendMode::Alpha => Some(BlendState::alpha_blending()),
            BlendMode::Additive => Some(BlendState::additive()),
            BlendMode::Multiply => Some(BlendState::multiply()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullFace {
    None,
    #[default]
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthCompare {
    #[default]
    Less,
    LessEqual,
    Equal,
    Always,
}

impl From<DepthCompare> for CompareFunction {
    fn from(compare: DepthCompare) -> Self {
        match compare {
            DepthCompare::Less => CompareFunction::Less,
            DepthCompare::LessEqual => CompareFunction::LessEqual,
            DepthCompare::Equal => CompareFunction::Equal,
            DepthCompare::Always => CompareFunction::Always,
        }
    }
}

/// Fixed-function state of a technique
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderState {
    pub category: DrawCategory,
    /// Lower priorities draw first within a category
    pub priority: i32,
    pub blend: BlendMode,
    pub cull: CullFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: DepthCompare,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            category: DrawCategory::Solid,
            priority: 0,
            blend: BlendMode::Opaque,
            cull: CullFace::Back,
            depth_test: true,
            depth_write: true,
            depth_compare: DepthCompare::Less,
        }
    }
}

impl RenderState {
    pub fn solid() -> Self {
        Self::default()
    }

    pub fn transparent() -> Self {
        Self {
            category: DrawCategory::Transparent,
            blend: BlendMode::Alpha,
            depth_write: false,
            ..Self::default()
        }
    }

    pub fn fullscreen() -> Self {
        Self {
            category: DrawCategory::Fullscreen,
            cull: CullFace::None,
            depth_test: false,
            depth_write: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TechniqueDescriptor {
    shader: String,
    #[serde(flatten)]
    state: RenderState,
}

/// Render target layout a pipeline is compiled against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
}

struct ObjectRing {
    buffer: BufferHandle,
    bind_group: BindGroupHandle,
    capacity: u32,
    slot_size: u32,
    cursor: u32,
    frame: u64,
}

impl ObjectRing {
    fn create(
        backend: &mut dyn GraphicsBackend,
        layout: BindGroupLayoutHandle,
        label: &str,
        capacity: u32,
    ) -> BackendResult<Self> {
        let alignment = backend.uniform_offset_alignment().max(1);
        let object_size = std::mem::size_of::<ObjectUniform>() as u32;
        let slot_size = object_size.div_ceil(alignment) * alignment;
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: Some(format!("{label} objects")),
            size: slot_size as u64 * capacity as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        let bind_group = match backend.create_bind_group(
            layout,
            &[(
                0,
                BindGroupEntry::Buffer {
                    buffer,
                    offset: 0,
                    size: Some(object_size as u64),
                },
            )],
        ) {
            Ok(bind_group) => bind_group,
            Err(err) => {
                backend.destroy_buffer(buffer);
                return Err(err);
            }
        };
        Ok(Self {
            buffer,
            bind_group,
            capacity,
            slot_size,
            cursor: 0,
            frame: u64::MAX,
        })
    }

    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_bind_group(self.bind_group);
        backend.destroy_buffer(self.buffer);
    }
}

#[derive(Default)]
struct TechniqueGpu {
    pipelines: HashMap<PipelineKey, RenderPipelineHandle>,
    objects: Option<ObjectRing>,
    // Outgrown rings still referenced by this frame's recorded draws.
    retired: Vec<ObjectRing>,
}

pub struct Technique {
    name: String,
    shader: Arc<ShaderSource>,
    state: RenderState,
    gpu: Mutex<TechniqueGpu>,
}

impl Technique {
    pub fn new(name: &str, shader: Arc<ShaderSource>, state: RenderState) -> Self {
        Self {
            name: name.to_string(),
            shader,
            state,
            gpu: Mutex::new(TechniqueGpu::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    pub fn category(&self) -> DrawCategory {
        self.state.category
    }

    pub fn priority(&self) -> i32 {
        self.state.priority
    }

    pub fn shader(&self) -> &ShaderSource {
        &self.shader
    }

    /// Pipeline for the given target layout, compiled on first request.
    pub fn pipeline(
        &self,
        backend: &mut dyn GraphicsBackend,
        key: &PipelineKey,
    ) -> BackendResult<RenderPipelineHandle> {
        let mut gpu = self.gpu.lock();
        if let Some(pipeline) = gpu.pipelines.get(key) {
            return Ok(*pipeline);
        }

        log::debug!(
            "Compiling pipeline for technique {} ({} color targets, {} samples)",
            self.name,
            key.color_formats.len(),
            key.sample_count
        );
        let state = &self.state;
        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(self.name.clone()),
            vertex_shader: self.shader.source.clone(),
            fragment_shader: Some(self.shader.source.clone()),
            vertex_layouts: vec![Vertex::layout()],
            bind_group_layouts: key.bind_group_layouts.clone(),
            cull_mode: match state.cull {
                CullFace::None => CullMode::None,
                CullFace::Back => CullMode::Back,
                CullFace::Front => CullMode::Front,
            },
            depth_stencil: key.depth_format.map(|format| DepthStencilState {
                format,
                depth_write_enabled: state.depth_write,
                depth_compare: if state.depth_test {
                    state.depth_compare.into()
                } else {
                    CompareFunction::Always
                },
            }),
            color_targets: key
                .color_formats
                .iter()
                .map(|&format| ColorTargetState {
                    format,
                    blend: state.blend.blend_state(),
                    write_mask: ColorWrites::ALL,
                })
                .collect(),
            sample_count: key.sample_count,
        })?;
        gpu.pipelines.insert(key.clone(), pipeline);
        Ok(pipeline)
    }

    /// Write one object's uniforms into a fresh slot of this frame.
    /// Returns the bind group and dynamic offset to bind before the draw.
    pub fn push_object(
        &self,
        backend: &mut dyn GraphicsBackend,
        object_layout: BindGroupLayoutHandle,
        frame_index: u64,
        object: &ObjectUniform,
    ) -> BackendResult<(BindGroupHandle, u32)> {
        let mut gpu = self.gpu.lock();
        let gpu = &mut *gpu;

        let mut ring = match gpu.objects.take() {
            Some(ring) => ring,
            None => ObjectRing::create(backend, object_layout, &self.name, INITIAL_OBJECT_SLOTS)?,
        };

        if ring.frame != frame_index {
            ring.frame = frame_index;
            ring.cursor = 0;
            for old in gpu.retired.drain(..) {
                old.destroy(backend);
            }
        }

        if ring.cursor == ring.capacity {
            let grown = match ObjectRing::create(backend, object_layout, &self.name, ring.capacity * 2) {
                Ok(grown) => grown,
                Err(err) => {
                    gpu.objects = Some(ring);
                    return Err(err);
                }
            };
            log::debug!(
                "Technique {} object ring grown to {} slots",
                self.name,
                grown.capacity
            );
            let frame = ring.frame;
            gpu.retired.push(ring);
            ring = grown;
            ring.frame = frame;
        }

        let offset = ring.cursor * ring.slot_size;
        backend.write_buffer(ring.buffer, offset as u64, bytemuck::bytes_of(object));
        ring.cursor += 1;
        let bind_group = ring.bind_group;
        gpu.objects = Some(ring);
        Ok((bind_group, offset))
    }

    pub fn compiled_pipelines(&self) -> usize {
        self.gpu.lock().pipelines.len()
    }
}

impl Asset for Technique {
    const KIND: ResourceKind = ResourceKind::Technique;

    fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
        async move {
            let descriptor: TechniqueDescriptor =
                serde_json::from_slice(&bytes).map_err(|e| AssetError::decode(ctx.path(), e))?;
            let shader = ctx
                .fetch::<ShaderSource>(&ctx.resolve(&descriptor.shader))
                .await?;
            Ok(Technique::new(ctx.path(), shader, descriptor.state))
        }
        .boxed()
    }

    fn is_gpu_resident(&self) -> bool {
        let gpu = self.gpu.lock();
        !gpu.pipelines.is_empty() || gpu.objects.is_some()
    }

    fn unload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        let mut gpu = self.gpu.lock();
        for (_, pipeline) in gpu.pipelines.drain() {
            backend.destroy_render_pipeline(pipeline);
        }
        if let Some(ring) = gpu.objects.take() {
            ring.destroy(backend);
        }
        for ring in gpu.retired.drain(..) {
            ring.destroy(backend);
        }
        Ok(())
    }
}
