//! Cube textures for skyboxes and environment lookups

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::assets::{Asset, AssetError, AssetResult, LoadContext, ResourceKind};
use crate::backend::*;
use crate::resources::{GpuTexture, TextureData};

/// On-disk cubemap descriptor: six image paths relative to the descriptor.
#[derive(Debug, Deserialize)]
struct CubemapDescriptor {
    /// +X, -X, +Y, -Y, +Z, -Z
    faces: [String; 6],
}

pub struct Cubemap {
    name: String,
    faces: Vec<TextureData>,
    gpu: Mutex<Option<GpuTexture>>,
}

impl Cubemap {
    /// Build from six decoded faces. All faces must be square and of one size.
    pub fn from_faces(name: &str, faces: Vec<TextureData>) -> AssetResult<Self> {
        if faces.len() != 6 {
            return Err(AssetError::decode(name, format!("expected 6 faces, got {}", faces.len())));
        }
        let size = faces[0].width;
        if let Some(face) = faces.iter().find(|f| f.width != size || f.height != size) {
            return Err(AssetError::decode(
                name,
                format!(
                    "face {} is {}x{}, expected {size}x{size}",
                    face.name, face.width, face.height
                ),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            faces,
            gpu: Mutex::new(None),
        })
    }

    /// 1x1 cube of a single color
    pub fn solid_color(name: &str, color: [u8; 4]) -> Self {
        let faces = (0..6)
            .map(|i| TextureData::solid_color(color, &format!("{name}[{i}]")))
            .collect();
        Self {
            name: name.to_string(),
            faces,
            gpu: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.faces.first().map_or(0, |f| f.width)
    }

    /// Cube view of the uploaded texture, uploading it on first use.
    pub fn view(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<TextureViewHandle> {
        let mut gpu = self.gpu.lock();
        if let Some(texture) = gpu.as_ref() {
            return Ok(texture.view);
        }
        let texture = GpuTexture::create_cube(backend, &self.faces)?;
        let view = texture.view;
        *gpu = Some(texture);
        Ok(view)
    }
}

impl Asset for Cubemap {
    const KIND: ResourceKind = ResourceKind::Cubemap;

    fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
        async move {
            let descriptor: CubemapDescriptor =
                serde_json::from_slice(&bytes).map_err(|e| AssetError::decode(ctx.path(), e))?;

            let reads = descriptor.faces.iter().map(|face| {
                let path = ctx.resolve(face);
                let ctx = &ctx;
                async move {
                    let bytes = ctx.read(&path).await?;
                    TextureData::from_bytes(&bytes, &path, true)
                }
            });
            let faces = futures::future::try_join_all(reads).await?;

            Cubemap::from_faces(ctx.path(), faces)
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

    #[test]
    fn faces_must_share_one_square_size() {
        let mut faces: Vec<TextureData> = (0..6).map(|_| TextureData::white()).collect();
        faces[3] = TextureData::checkerboard(4, [0; 4], [255; 4]);
        let err = Cubemap::from_faces("sky.json", faces).err().unwrap();
        assert!(matches!(err, AssetError::Decode { .. }));
    }

    #[test]
    fn solid_cube_uploads_six_layers() {
        let mut backend = HeadlessBackend::default();
        let cube = Cubemap::solid_color("black", [0, 0, 0, 255]);
        let _view = cube.view(&mut backend).unwrap();
        assert!(cube.is_gpu_resident());
        assert_eq!(cube.size(), 1);
        cube.unload(&mut backend).unwrap();
        assert!(!cube.is_gpu_resident());
    }
}
