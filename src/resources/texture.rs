//! Texture loading and management

use futures::future::{BoxFuture, FutureExt};
use image::{DynamicImage, GenericImageView};
use parking_lot::Mutex;

use crate::assets::{Asset, AssetError, AssetResult, LoadContext, ResourceKind};
use crate::backend::*;

/// Decoded texture data
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Decode an image file. `srgb` selects the color space the texels are stored in.
    pub fn from_bytes(bytes: &[u8], name: &str, srgb: bool) -> AssetResult<Self> {
        let img = image::load_from_memory(bytes).map_err(|e| AssetError::decode(name, e))?;
        Ok(Self::from_image(img, name, srgb))
    }

    fn from_image(img: DynamicImage, name: &str, srgb: bool) -> Self {
        let (width, height) = img.dimensions();
        let rgba = img.to_rgba8();

        Self {
            width,
            height,
            format: if srgb {
                TextureFormat::Rgba8UnormSrgb
            } else {
                TextureFormat::Rgba8Unorm
            },
            data: rgba.into_raw(),
            name: name.to_string(),
        }
    }

    /// Create a solid color texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    pub fn black() -> Self {
        Self::solid_color([0, 0, 0, 255], "black")
    }

    /// Tangent-space normal map pointing straight out of the surface
    pub fn default_normal() -> Self {
        Self {
            format: TextureFormat::Rgba8Unorm,
            ..Self::solid_color([128, 128, 255, 255], "default_normal")
        }
    }

    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                let color = if is_even { color1 } else { color2 };
                data.extend_from_slice(&color);
            }
        }

        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8UnormSrgb,
            data,
            name: "checkerboard".to_string(),
        }
    }
}

/// Textures whose file stem ends in `_normal` or `_n` hold vectors, not colors,
/// and are stored linear.
pub fn is_linear_texture_path(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.split('.').next().unwrap_or(file);
    stem.ends_with("_normal") || stem.ends_with("_n")
}

/// GPU texture with its default view
#[derive(Debug)]
pub struct GpuTexture {
    pub handle: TextureHandle,
    pub view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl GpuTexture {
    /// Create and upload a 2D texture
    pub fn create(backend: &mut dyn GraphicsBackend, data: &TextureData) -> BackendResult<Self> {
        Self::create_layers(backend, TextureDimension::D2, std::slice::from_ref(data))
    }

    /// Create and upload a cube texture from six square faces in +X, -X, +Y, -Y, +Z, -Z order
    pub fn create_cube(backend: &mut dyn GraphicsBackend, faces: &[TextureData]) -> BackendResult<Self> {
        if faces.len() != 6 {
            return Err(BackendError::TextureCreationFailed(format!(
                "cubemap needs 6 faces, got {}",
                faces.len()
            )));
        }
        Self::create_layers(backend, TextureDimension::Cube, faces)
    }

    fn create_layers(
        backend: &mut dyn GraphicsBackend,
        dimension: TextureDimension,
        layers: &[TextureData],
    ) -> BackendResult<Self> {
        let Some(first) = layers.first() else {
            return Err(BackendError::TextureCreationFailed("no texture data".into()));
        };
        let handle = backend.create_texture(&TextureDescriptor {
            label: Some(first.name.clone()),
            width: first.width,
            height: first.height,
            depth: layers.len() as u32,
            dimension,
            format: first.format,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;

        for (layer, data) in layers.iter().enumerate() {
            backend.write_texture(handle, layer as u32, &data.data, data.width, data.height);
        }
        let view = match backend.create_texture_view(handle) {
            Ok(view) => view,
            Err(err) => {
                backend.destroy_texture(handle);
                return Err(err);
            }
        };

        Ok(Self {
            handle,
            view,
            width: first.width,
            height: first.height,
            format: first.format,
        })
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture_view(self.view);
        backend.destroy_texture(self.handle);
    }
}

/// A 2D texture resource
pub struct Texture {
    data: TextureData,
    gpu: Mutex<Option<GpuTexture>>,
}

impl Texture {
    pub fn from_data(data: TextureData) -> Self {
        Self {
            data,
            gpu: Mutex::new(None),
        }
    }

    pub fn data(&self) -> &TextureData {
        &self.data
    }

    /// View of the uploaded texture, uploading it on first use.
    pub fn view(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<TextureViewHandle> {
        let mut gpu = self.gpu.lock();
        if let Some(texture) = gpu.as_ref() {
            return Ok(texture.view);
        }
        let texture = GpuTexture::create(backend, &self.data)?;
        let view = texture.view;
        *gpu = Some(texture);
        Ok(view)
    }
}

impl Asset for Texture {
    const KIND: ResourceKind = ResourceKind::Texture;

    fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
        async move {
            let srgb = !is_linear_texture_path(ctx.path());
            let data = TextureData::from_bytes(&bytes, ctx.path(), srgb)?;
            log::debug!("Decoded texture {} ({}x{})", ctx.path(), data.width, data.height);
            Ok(Texture::from_data(data))
        }
        .boxed()
    }

    fn is_gpu_resident(&self) -> bool {
        self.gpu.lock().is_some()
    }

    fn unload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        if let Some(texture) = self.gpu.lock().take() {
            texture.destroy(backend);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::ResourceClass;

    #[test]
    fn normal_maps_are_linear() {
        assert!(is_linear_texture_path("textures/brick_normal.png"));
        assert!(is_linear_texture_path("brick_n.jpg"));
        assert!(!is_linear_texture_path("textures/brick.png"));
        assert!(!is_linear_texture_path("normals/brick.png"));
    }

    #[test]
    fn decodes_png_bytes() {
        let mut bytes = Vec::new();
        let img = image::RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();

        let data = TextureData::from_bytes(&bytes, "tiny.png", true).unwrap();
        assert_eq!((data.width, data.height), (2, 3));
        assert_eq!(data.format, TextureFormat::Rgba8UnormSrgb);
        assert_eq!(&data.data[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = TextureData::from_bytes(b"not an image", "bad.png", true).unwrap_err();
        assert!(matches!(err, AssetError::Decode { .. }));
    }

    #[test]
    fn upload_happens_once_and_unload_frees() {
        let mut backend = HeadlessBackend::default();
        let texture = Texture::from_data(TextureData::checkerboard(16, [0; 4], [255; 4]));
        let a = texture.view(&mut backend).unwrap();
        let b = texture.view(&mut backend).unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.live_count(ResourceClass::Texture), 1);

        texture.unload(&mut backend).unwrap();
        assert_eq!(backend.live_count(ResourceClass::Texture), 0);
        assert_eq!(backend.live_count(ResourceClass::TextureView), 0);
    }
}
