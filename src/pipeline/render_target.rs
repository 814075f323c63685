//! Render targets with optional multisample backing
//!
//! Passes write the render view; later passes sample the sample view, which is
//! always single-sample. A multisampled target resolves into its sample texture
//! when the writing pass ends.

use crate::backend::*;

pub struct RenderTarget {
    label: String,
    format: TextureFormat,
    width: u32,
    height: u32,
    sample_count: u32,
    usage: TextureUsage,
    texture: TextureHandle,
    view: TextureViewHandle,
    msaa: Option<(TextureHandle, TextureViewHandle)>,
}

impl RenderTarget {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        format: TextureFormat,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> BackendResult<Self> {
        Self::with_usage(
            backend,
            label,
            format,
            width,
            height,
            sample_count,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
    }

    pub fn with_usage(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        format: TextureFormat,
        width: u32,
        height: u32,
        sample_count: u32,
        usage: TextureUsage,
    ) -> BackendResult<Self> {
        let (texture, view) = create_texture(backend, label, format, width, height, 1, usage)?;
        let msaa = if sample_count > 1 {
            let msaa_label = format!("{label} (MSAA)");
            match create_texture(
                backend,
                &msaa_label,
                format,
                width,
                height,
                sample_count,
                TextureUsage::RENDER_ATTACHMENT,
            ) {
                Ok(msaa) => Some(msaa),
                Err(err) => {
                    backend.destroy_texture_view(view);
                    backend.destroy_texture(texture);
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(Self {
            label: label.to_string(),
            format,
            width,
            height,
            sample_count: sample_count.max(1),
            usage,
            texture,
            view,
            msaa,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Single-sample texture, the one sampled and copied from.
    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    /// View passes render into.
    pub fn render_view(&self) -> TextureViewHandle {
        self.msaa.map_or(self.view, |(_, view)| view)
    }

    /// Single-sample view for reading.
    pub fn sample_view(&self) -> TextureViewHandle {
        self.view
    }

    pub fn resolve_target(&self) -> Option<TextureViewHandle> {
        self.msaa.map(|_| self.view)
    }

    pub fn color_attachment(&self, load_op: LoadOp) -> ColorAttachment {
        ColorAttachment {
            view: self.render_view(),
            resolve_target: self.resolve_target(),
            load_op,
            store_op: StoreOp::Store,
        }
    }

    /// Recreate at a new size. Views handed out before are invalid afterwards.
    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> BackendResult<()> {
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        let resized = Self::with_usage(
            backend,
            &self.label,
            self.format,
            width,
            height,
            self.sample_count,
            self.usage,
        )?;
        let old = std::mem::replace(self, resized);
        old.destroy(backend);
        Ok(())
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        if let Some((texture, view)) = self.msaa {
            backend.destroy_texture_view(view);
            backend.destroy_texture(texture);
        }
        backend.destroy_texture_view(self.view);
        backend.destroy_texture(self.texture);
    }
}

/// Depth-stencil buffer shared by the scene passes. Never sampled, so it is
/// created directly at the scene sample count.
pub struct DepthTarget {
    format: TextureFormat,
    width: u32,
    height: u32,
    sample_count: u32,
    texture: TextureHandle,
    view: TextureViewHandle,
}

impl DepthTarget {
    pub const FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;

    pub fn new(backend: &mut dyn GraphicsBackend, width: u32, height: u32, sample_count: u32) -> BackendResult<Self> {
        let (texture, view) = create_texture(
            backend,
            "Depth Stencil",
            Self::FORMAT,
            width,
            height,
            sample_count,
            TextureUsage::RENDER_ATTACHMENT,
        )?;
        Ok(Self {
            format: Self::FORMAT,
            width,
            height,
            sample_count: sample_count.max(1),
            texture,
            view,
        })
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn view(&self) -> TextureViewHandle {
        self.view
    }

    pub fn clear_attachment(&self) -> DepthStencilAttachment {
        DepthStencilAttachment {
            view: self.view,
            depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
            depth_store_op: StoreOp::Store,
            depth_clear_value: 1.0,
            depth_read_only: false,
        }
    }

    pub fn read_only_attachment(&self) -> DepthStencilAttachment {
        DepthStencilAttachment {
            view: self.view,
            depth_load_op: LoadOp::Load,
            depth_store_op: StoreOp::Store,
            depth_clear_value: 1.0,
            depth_read_only: true,
        }
    }

    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> BackendResult<()> {
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        let resized = Self::new(backend, width, height, self.sample_count)?;
        let old = std::mem::replace(self, resized);
        old.destroy(backend);
        Ok(())
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture_view(self.view);
        backend.destroy_texture(self.texture);
    }
}

fn create_texture(
    backend: &mut dyn GraphicsBackend,
    label: &str,
    format: TextureFormat,
    width: u32,
    height: u32,
    sample_count: u32,
    usage: TextureUsage,
) -> BackendResult<(TextureHandle, TextureViewHandle)> {
    let texture = backend.create_texture(&TextureDescriptor {
        label: Some(label.to_string()),
        width: width.max(1),
        height: height.max(1),
        sample_count: sample_count.max(1),
        format,
        usage,
        ..Default::default()
    })?;
    match backend.create_texture_view(texture) {
        Ok(view) => Ok((texture, view)),
        Err(err) => {
            backend.destroy_texture(texture);
            Err(err)
        }
    }
}
