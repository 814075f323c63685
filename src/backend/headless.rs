//! Headless GPU backend.
//!
//! Performs no GPU work. Every pass and command is recorded so callers can
//! inspect what a frame would have submitted, resources are tracked so leaks
//! and double frees show up, and buffer readbacks return whatever texture
//! contents were scripted beforehand.

use std::collections::{HashMap, HashSet};

use crate::backend::traits::*;
use crate::backend::types::*;

/// A command recorded inside a render pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    SetPipeline(RenderPipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
        offsets: Vec<u32>,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        format: IndexFormat,
    },
    SetViewport {
        width: f32,
        height: f32,
    },
    Draw {
        vertices: std::ops::Range<u32>,
        instances: std::ops::Range<u32>,
    },
    DrawIndexed {
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    },
}

impl RecordedCommand {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }
        )
    }
}

/// A render pass as it was recorded.
#[derive(Debug, Clone)]
pub struct RecordedPass {
    pub label: Option<String>,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
    pub commands: Vec<RecordedCommand>,
}

impl RecordedPass {
    pub fn draw_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    pub fn pipeline_binds(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::SetPipeline(_)))
            .count()
    }
}

/// Resource classes tracked for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Buffer,
    Texture,
    TextureView,
    Sampler,
    BindGroupLayout,
    BindGroup,
    RenderPipeline,
}

#[derive(Debug)]
struct HeadlessBuffer {
    data: Vec<u8>,
}

/// Backend that records instead of rendering.
#[derive(Debug)]
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    format: TextureFormat,
    next_id: u64,
    frame_open: bool,
    swapchain_view: TextureViewHandle,

    live: HashMap<ResourceClass, HashSet<u64>>,
    buffers: HashMap<u64, HeadlessBuffer>,
    textures: HashMap<u64, TextureDescriptor>,
    pipeline_labels: HashMap<u64, Option<String>>,
    scripted_contents: HashMap<String, Vec<u8>>,
    queued_maps: Vec<u64>,
    ready_maps: HashSet<u64>,
    failing_pipelines: HashSet<String>,

    current_pass: Option<RecordedPass>,
    passes: Vec<RecordedPass>,
    frames_presented: u64,
    frames_abandoned: u64,
}

impl HeadlessBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            format: TextureFormat::Bgra8UnormSrgb,
            next_id: 1,
            frame_open: false,
            swapchain_view: TextureViewHandle(0),
            live: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            pipeline_labels: HashMap::new(),
            scripted_contents: HashMap::new(),
            queued_maps: Vec::new(),
            ready_maps: HashSet::new(),
            failing_pipelines: HashSet::new(),
            current_pass: None,
            passes: Vec::new(),
            frames_presented: 0,
            frames_abandoned: 0,
        }
    }

    fn allocate(&mut self, class: ResourceClass) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.live.entry(class).or_default().insert(id);
        id
    }

    fn release(&mut self, class: ResourceClass, id: u64) {
        let removed = self.live.get_mut(&class).is_some_and(|set| set.remove(&id));
        if !removed {
            log::warn!("HeadlessBackend: destroying unknown {class:?} {id}");
        }
    }

    fn record(&mut self, command: RecordedCommand) {
        match self.current_pass.as_mut() {
            Some(pass) => pass.commands.push(command),
            None => log::warn!("HeadlessBackend: command {command:?} outside of a render pass"),
        }
    }

    /// Number of live resources of a class.
    pub fn live_count(&self, class: ResourceClass) -> usize {
        self.live.get(&class).map_or(0, HashSet::len)
    }

    /// Passes recorded since the last `take_passes`.
    pub fn passes(&self) -> &[RecordedPass] {
        &self.passes
    }

    pub fn take_passes(&mut self) -> Vec<RecordedPass> {
        std::mem::take(&mut self.passes)
    }

    /// Labels of recorded passes, in submission order.
    pub fn pass_labels(&self) -> Vec<String> {
        self.passes
            .iter()
            .map(|p| p.label.clone().unwrap_or_default())
            .collect()
    }

    /// First recorded pass with the given label.
    pub fn pass(&self, label: &str) -> Option<&RecordedPass> {
        self.passes.iter().find(|p| p.label.as_deref() == Some(label))
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn frames_abandoned(&self) -> u64 {
        self.frames_abandoned
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Label a pipeline was created with.
    pub fn pipeline_label(&self, pipeline: RenderPipelineHandle) -> Option<&str> {
        self.pipeline_labels.get(&pipeline.0).and_then(|l| l.as_deref())
    }

    /// Last bytes written to a buffer.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    /// Contents reported when a texture with this label is copied into a buffer.
    pub fn script_texture_contents(&mut self, label: impl Into<String>, bytes: Vec<u8>) {
        self.scripted_contents.insert(label.into(), bytes);
    }

    /// Make pipeline creation fail for every descriptor carrying this label.
    pub fn fail_pipelines_labelled(&mut self, label: impl Into<String>) {
        self.failing_pipelines.insert(label.into());
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless"
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.width = width;
            self.height = height;
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        self.frame_open = true;
        let id = self.next_id;
        self.next_id += 1;
        self.swapchain_view = TextureViewHandle(id);
        Ok(FrameContext {
            swapchain_view: self.swapchain_view,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if let Some(pass) = self.current_pass.take() {
            log::warn!("HeadlessBackend: pass {:?} left open at end of frame", pass.label);
            self.passes.push(pass);
        }
        self.ready_maps.extend(self.queued_maps.drain(..));
        self.frame_open = false;
        self.frames_presented += 1;
        log::trace!("HeadlessBackend: presented frame {}", self.frames_presented);
        Ok(())
    }

    fn abandon_frame(&mut self) {
        self.current_pass = None;
        self.queued_maps.clear();
        self.frame_open = false;
        self.frames_abandoned += 1;
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.format
    }

    fn uniform_offset_alignment(&self) -> u32 {
        256
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!("HeadlessBackend: creating buffer {:?} (size: {})", desc.label, desc.size);
        let id = self.allocate(ResourceClass::Buffer);
        self.buffers.insert(
            id,
            HeadlessBuffer {
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, data);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let Some(buf) = self.buffers.get_mut(&buffer.0) else {
            log::warn!("HeadlessBackend: write to unknown buffer {}", buffer.0);
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if buf.data.len() < end {
            buf.data.resize(end, 0);
        }
        buf.data[start..end].copy_from_slice(data);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{}, {} samples)",
            desc.label,
            desc.width,
            desc.height,
            desc.sample_count
        );
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        let id = self.allocate(ResourceClass::Texture);
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        Ok(TextureViewHandle(self.allocate(ResourceClass::TextureView)))
    }

    fn write_texture(&mut self, texture: TextureHandle, layer: u32, data: &[u8], width: u32, height: u32) {
        log::trace!(
            "HeadlessBackend: write_texture {} layer {} ({}x{}) len={}",
            texture.0,
            layer,
            width,
            height,
            data.len()
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        Ok(SamplerHandle(self.allocate(ResourceClass::Sampler)))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        log::trace!("HeadlessBackend: creating layout with {} entries", entries.len());
        Ok(BindGroupLayoutHandle(self.allocate(ResourceClass::BindGroupLayout)))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let layout_live = self
            .live
            .get(&ResourceClass::BindGroupLayout)
            .is_some_and(|set| set.contains(&layout.0));
        if !layout_live {
            return Err(BackendError::InvalidHandle {
                kind: "bind group layout",
                id: layout.0,
            });
        }
        for (_, entry) in entries {
            let (class, id, kind) = match entry {
                BindGroupEntry::Buffer { buffer, .. } => (ResourceClass::Buffer, buffer.0, "buffer"),
                BindGroupEntry::Texture(view) => (ResourceClass::TextureView, view.0, "texture view"),
                BindGroupEntry::Sampler(sampler) => (ResourceClass::Sampler, sampler.0, "sampler"),
            };
            if !self.live.get(&class).is_some_and(|set| set.contains(&id)) {
                return Err(BackendError::InvalidHandle { kind, id });
            }
        }
        Ok(BindGroupHandle(self.allocate(ResourceClass::BindGroup)))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if let Some(label) = &desc.label {
            if self.failing_pipelines.contains(label) {
                return Err(BackendError::PipelineCreationFailed(format!(
                    "{label} rejected by headless backend"
                )));
            }
        }
        log::trace!("HeadlessBackend: creating pipeline {:?}", desc.label);
        let id = self.allocate(ResourceClass::RenderPipeline);
        self.pipeline_labels.insert(id, desc.label.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if !self.frame_open {
            log::warn!("HeadlessBackend: render pass {:?} outside of a frame", desc.label);
        }
        if let Some(open) = self.current_pass.take() {
            self.passes.push(open);
        }
        self.current_pass = Some(RecordedPass {
            label: desc.label.clone(),
            color_attachments: desc.color_attachments.clone(),
            depth_stencil_attachment: desc.depth_stencil_attachment.clone(),
            commands: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) {
        if let Some(pass) = self.current_pass.take() {
            self.passes.push(pass);
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(RecordedCommand::SetPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle, dynamic_offsets: &[u32]) {
        self.record(RecordedCommand::SetBindGroup {
            index,
            bind_group,
            offsets: dynamic_offsets.to_vec(),
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, _offset: u64) {
        self.record(RecordedCommand::SetVertexBuffer { slot, buffer });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _offset: u64, format: IndexFormat) {
        self.record(RecordedCommand::SetIndexBuffer { buffer, format });
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.record(RecordedCommand::SetViewport { width, height });
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        self.record(RecordedCommand::Draw { vertices, instances });
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        self.record(RecordedCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn copy_texture_to_buffer(
        &mut self,
        texture: TextureHandle,
        buffer: BufferHandle,
        width: u32,
        height: u32,
    ) {
        let Some(desc) = self.textures.get(&texture.0) else {
            return;
        };
        let len = (width * height * desc.format.bytes_per_pixel()) as usize;
        let contents = desc
            .label
            .as_ref()
            .and_then(|label| self.scripted_contents.get(label))
            .cloned()
            .unwrap_or_else(|| vec![0; len]);
        self.write_buffer(buffer, 0, &contents);
    }

    fn map_buffer_read(&mut self, buffer: BufferHandle) {
        if !self.queued_maps.contains(&buffer.0) && !self.ready_maps.contains(&buffer.0) {
            self.queued_maps.push(buffer.0);
        }
    }

    fn try_read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Option<Vec<u8>>> {
        if !self.ready_maps.remove(&buffer.0) {
            return Ok(None);
        }
        self.buffers
            .get(&buffer.0)
            .map(|b| Some(b.data.clone()))
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
        self.ready_maps.remove(&buffer.0);
        self.release(ResourceClass::Buffer, buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.release(ResourceClass::Texture, texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.release(ResourceClass::TextureView, view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.release(ResourceClass::Sampler, sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.release(ResourceClass::BindGroup, bind_group.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.pipeline_labels.remove(&pipeline.0);
        self.release(ResourceClass::RenderPipeline, pipeline.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_passes_and_draws() {
        let mut backend = HeadlessBackend::new(64, 64);
        let frame = backend.begin_frame().unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Test Pass".into()),
            color_attachments: vec![ColorAttachment {
                view: frame.swapchain_view,
                resolve_target: None,
                load_op: LoadOp::Clear([0.0; 4]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        backend.end_frame().unwrap();

        assert_eq!(backend.pass_labels(), vec!["Test Pass".to_string()]);
        assert_eq!(backend.pass("Test Pass").unwrap().draw_count(), 1);
        assert_eq!(backend.frames_presented(), 1);
    }

    #[test]
    fn tracks_resource_lifetimes() {
        let mut backend = HeadlessBackend::default();
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: Some("t".into()),
                width: 4,
                height: 4,
                ..Default::default()
            })
            .unwrap();
        let view = backend.create_texture_view(texture).unwrap();
        assert_eq!(backend.live_count(ResourceClass::Texture), 1);
        backend.destroy_texture_view(view);
        backend.destroy_texture(texture);
        assert_eq!(backend.live_count(ResourceClass::Texture), 0);
        assert_eq!(backend.live_count(ResourceClass::TextureView), 0);
    }

    #[test]
    fn readback_becomes_available_after_submission() {
        let mut backend = HeadlessBackend::default();
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: Some("probe".into()),
                format: TextureFormat::R32Float,
                ..Default::default()
            })
            .unwrap();
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 4,
                usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            })
            .unwrap();
        backend.script_texture_contents("probe", 0.25f32.to_le_bytes().to_vec());

        backend.begin_frame().unwrap();
        backend.copy_texture_to_buffer(texture, buffer, 1, 1);
        backend.map_buffer_read(buffer);
        assert_eq!(backend.try_read_buffer(buffer).unwrap(), None);
        backend.end_frame().unwrap();

        let bytes = backend.try_read_buffer(buffer).unwrap().unwrap();
        assert_eq!(bytes, 0.25f32.to_le_bytes().to_vec());
        assert_eq!(backend.try_read_buffer(buffer).unwrap(), None);
    }
}
