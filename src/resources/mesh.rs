//! Meshes: CPU geometry split into parts, uploaded lazily on first draw

use std::io::Cursor;

use futures::future::{BoxFuture, FutureExt};
use glam::{Vec2, Vec3, Vec4};
use parking_lot::Mutex;

use crate::assets::{Asset, AssetError, AssetResult, LoadContext, ResourceKind};
use crate::backend::*;

/// Path the shared full-screen quad is registered under.
pub const FULLSCREEN_QUAD_PATH: &str = "builtin://fullscreen_quad";

/// Axis-aligned bounds of a mesh part in object space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        let mut any = false;
        for p in points {
            min = min.min(p);
            max = max.max(p);
            any = true;
        }
        if any {
            Self { min, max }
        } else {
            Self {
                min: Vec3::ZERO,
                max: Vec3::ZERO,
            }
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}

/// One independently drawable piece of a mesh
#[derive(Debug, Clone)]
pub struct MeshPart {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub bounds: Bounds,
}

impl MeshPart {
    pub fn new(name: &str, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let bounds = Bounds::from_points(vertices.iter().map(|v| v.position));
        Self {
            name: name.to_string(),
            vertices,
            indices,
            bounds,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Unit cube centered at the origin
    pub fn cube() -> Self {
        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, right) in faces {
            let up = normal.cross(right);
            let base = vertices.len() as u32;
            let corners = [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)];
            for (u, v) in corners {
                vertices.push(Vertex {
                    position: normal * 0.5 + right * u + up * v,
                    normal,
                    uv: Vec2::new(u + 0.5, 0.5 - v),
                    tangent: right.extend(1.0),
                });
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::new("cube", vertices, indices)
    }

    /// UV sphere of diameter 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        for ring in 0..=rings {
            let phi = ring as f32 * std::f32::consts::PI / rings as f32;
            for segment in 0..=segments {
                let theta = segment as f32 * std::f32::consts::TAU / segments as f32;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                vertices.push(Vertex {
                    position: normal * 0.5,
                    normal,
                    uv: Vec2::new(segment as f32 / segments as f32, ring as f32 / rings as f32),
                    tangent: Vec4::new(-theta.sin(), 0.0, theta.cos(), 1.0),
                });
            }
        }

        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                indices.extend_from_slice(&[current, next, current + 1, current + 1, next, next + 1]);
            }
        }

        Self::new("sphere", vertices, indices)
    }

    /// Subdivided plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let subdivisions = subdivisions.max(1);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let u = x as f32 / subdivisions as f32;
                let v = z as f32 / subdivisions as f32;
                vertices.push(Vertex {
                    position: Vec3::new((u - 0.5) * width, 0.0, (v - 0.5) * depth),
                    normal: Vec3::Y,
                    uv: Vec2::new(u, v),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
        }

        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                indices.extend_from_slice(&[current, next, current + 1, current + 1, next, next + 1]);
            }
        }

        Self::new("plane", vertices, indices)
    }

    /// Capped cylinder along Y
    pub fn cylinder(radius: f32, height: f32, segments: u32) -> Self {
        let segments = segments.max(3);
        let half = height / 2.0;
        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        for i in 0..=segments {
            let angle = i as f32 * std::f32::consts::TAU / segments as f32;
            let normal = Vec3::new(angle.cos(), 0.0, angle.sin());
            let tangent = Vec4::new(-angle.sin(), 0.0, angle.cos(), 1.0);
            let u = i as f32 / segments as f32;
            for (y, v) in [(-half, 1.0), (half, 0.0)] {
                vertices.push(Vertex {
                    position: Vec3::new(normal.x * radius, y, normal.z * radius),
                    normal,
                    uv: Vec2::new(u, v),
                    tangent,
                });
            }
        }
        for i in 0..segments {
            let base = i * 2;
            indices.extend_from_slice(&[base, base + 2, base + 1, base + 1, base + 2, base + 3]);
        }

        for (y, normal) in [(half, Vec3::Y), (-half, -Vec3::Y)] {
            let center = vertices.len() as u32;
            vertices.push(Vertex {
                position: Vec3::new(0.0, y, 0.0),
                normal,
                uv: Vec2::splat(0.5),
                tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
            });
            for i in 0..=segments {
                let angle = i as f32 * std::f32::consts::TAU / segments as f32;
                vertices.push(Vertex {
                    position: Vec3::new(angle.cos() * radius, y, angle.sin() * radius),
                    normal,
                    uv: Vec2::new(0.5 + angle.cos() * 0.5, 0.5 + angle.sin() * 0.5),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
            for i in 0..segments {
                let a = center + 1 + i;
                if normal.y > 0.0 {
                    indices.extend_from_slice(&[center, a + 1, a]);
                } else {
                    indices.extend_from_slice(&[center, a, a + 1]);
                }
            }
        }

        Self::new("cylinder", vertices, indices)
    }

    /// Two triangles covering clip space; uv (0,0) is the top-left corner.
    pub fn fullscreen_quad() -> Self {
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
        let vertices = corners
            .iter()
            .map(|&(x, y)| Vertex {
                position: Vec3::new(x, y, 0.0),
                normal: Vec3::Z,
                uv: Vec2::new((x + 1.0) * 0.5, (1.0 - y) * 0.5),
                tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
            })
            .collect();
        Self::new("fullscreen_quad", vertices, vec![0, 1, 2, 0, 2, 3])
    }
}

#[derive(Debug)]
struct GpuMeshPart {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    index_count: u32,
}

/// A mesh resource: one or more parts sharing a name
#[derive(Debug)]
pub struct Mesh {
    name: String,
    parts: Vec<MeshPart>,
    gpu: Mutex<Option<Vec<GpuMeshPart>>>,
}

impl Mesh {
    pub fn from_parts(name: &str, parts: Vec<MeshPart>) -> Self {
        Self {
            name: name.to_string(),
            parts,
            gpu: Mutex::new(None),
        }
    }

    pub fn fullscreen_quad() -> Self {
        Self::from_parts("fullscreen_quad", vec![MeshPart::fullscreen_quad()])
    }

    /// Decode a Wavefront OBJ file; every object or group becomes a part.
    pub fn from_obj_bytes(name: &str, bytes: &[u8]) -> AssetResult<Self> {
        let mut reader = Cursor::new(bytes);
        let (models, _materials) = tobj::load_obj_buf(
            &mut reader,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
            // Material libraries are resolved by our own material resources.
            |_| Err(tobj::LoadError::OpenFileFailed),
        )
        .map_err(|e| AssetError::decode(name, e))?;

        if models.is_empty() {
            return Err(AssetError::decode(name, "no geometry in OBJ file"));
        }

        let parts = models
            .iter()
            .map(|model| Self::part_from_obj(model))
            .collect::<Vec<_>>();

        log::debug!(
            "Loaded OBJ {} with {} parts, {} triangles",
            name,
            parts.len(),
            parts.iter().map(MeshPart::triangle_count).sum::<usize>()
        );

        Ok(Self::from_parts(name, parts))
    }

    fn part_from_obj(model: &tobj::Model) -> MeshPart {
        let mesh = &model.mesh;
        let vertex_count = mesh.positions.len() / 3;
        let position = |i: usize| {
            Vec3::new(
                mesh.positions[i * 3],
                mesh.positions[i * 3 + 1],
                mesh.positions[i * 3 + 2],
            )
        };

        let normals: Vec<Vec3> = if mesh.normals.len() == mesh.positions.len() {
            (0..vertex_count)
                .map(|i| {
                    Vec3::new(mesh.normals[i * 3], mesh.normals[i * 3 + 1], mesh.normals[i * 3 + 2])
                })
                .collect()
        } else {
            // Accumulate area-weighted face normals.
            let mut accumulated = vec![Vec3::ZERO; vertex_count];
            for tri in mesh.indices.chunks_exact(3) {
                let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
                let face = (position(b) - position(a)).cross(position(c) - position(a));
                for i in [a, b, c] {
                    accumulated[i] += face;
                }
            }
            accumulated
                .into_iter()
                .map(|n| n.try_normalize().unwrap_or(Vec3::Y))
                .collect()
        };

        let vertices = (0..vertex_count)
            .map(|i| {
                let normal = normals[i];
                let uv = if mesh.texcoords.len() >= (i + 1) * 2 {
                    Vec2::new(mesh.texcoords[i * 2], 1.0 - mesh.texcoords[i * 2 + 1])
                } else {
                    Vec2::ZERO
                };
                let reference = if normal.y.abs() > 0.9 { Vec3::X } else { Vec3::Y };
                let tangent = reference.cross(normal).normalize_or_zero();
                Vertex {
                    position: position(i),
                    normal,
                    uv,
                    tangent: tangent.extend(1.0),
                }
            })
            .collect();

        MeshPart::new(&model.name, vertices, mesh.indices.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> &[MeshPart] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Create vertex and index buffers if they do not exist yet.
    pub fn ensure_uploaded(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        let mut gpu = self.gpu.lock();
        if gpu.is_some() {
            return Ok(());
        }

        let mut uploaded = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let vertex_buffer = backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some(format!("{} / {} vertices", self.name, part.name)),
                    size: std::mem::size_of_val(part.vertices.as_slice()) as u64,
                    usage: BufferUsage::VERTEX,
                    mapped_at_creation: false,
                },
                bytemuck::cast_slice(&part.vertices),
            )?;
            let index_buffer = backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some(format!("{} / {} indices", self.name, part.name)),
                    size: std::mem::size_of_val(part.indices.as_slice()) as u64,
                    usage: BufferUsage::INDEX,
                    mapped_at_creation: false,
                },
                bytemuck::cast_slice(&part.indices),
            )?;
            uploaded.push(GpuMeshPart {
                vertex_buffer,
                index_buffer,
                index_count: part.indices.len() as u32,
            });
        }
        *gpu = Some(uploaded);
        Ok(())
    }

    /// Bind one part's buffers and issue its draw.
    pub fn draw_part(&self, backend: &mut dyn GraphicsBackend, part: usize) -> BackendResult<()> {
        self.ensure_uploaded(backend)?;
        let gpu = self.gpu.lock();
        let Some(gpu_part) = gpu.as_ref().and_then(|parts| parts.get(part)) else {
            return Err(BackendError::InvalidHandle {
                kind: "mesh part",
                id: part as u64,
            });
        };
        backend.set_vertex_buffer(0, gpu_part.vertex_buffer, 0);
        backend.set_index_buffer(gpu_part.index_buffer, 0, IndexFormat::Uint32);
        backend.draw_indexed(0..gpu_part.index_count, 0, 0..1);
        Ok(())
    }
}

impl Asset for Mesh {
    const KIND: ResourceKind = ResourceKind::Mesh;

    fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
        async move { Mesh::from_obj_bytes(ctx.path(), &bytes) }.boxed()
    }

    fn is_gpu_resident(&self) -> bool {
        self.gpu.lock().is_some()
    }

    fn unload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        if let Some(parts) = self.gpu.lock().take() {
            for part in parts {
                backend.destroy_buffer(part.vertex_buffer);
                backend.destroy_buffer(part.index_buffer);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::ResourceClass;

    const TRIANGLE_OBJ: &str = "o tri\nv 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n";

    #[test]
    fn generated_parts_have_consistent_indices() {
        for part in [
            MeshPart::cube(),
            MeshPart::sphere(8, 6),
            MeshPart::plane(2.0, 2.0, 3),
            MeshPart::cylinder(0.5, 1.0, 8),
            MeshPart::fullscreen_quad(),
        ] {
            assert_eq!(part.indices.len() % 3, 0, "{}", part.name);
            assert!(
                part.indices.iter().all(|&i| (i as usize) < part.vertices.len()),
                "{}",
                part.name
            );
        }
        assert_eq!(MeshPart::cube().triangle_count(), 12);
    }

    #[test]
    fn cube_bounds_are_centered() {
        let cube = MeshPart::cube();
        assert!(cube.bounds.center().length() < 1e-6);
        assert_eq!(cube.bounds.max, Vec3::splat(0.5));
    }

    #[test]
    fn obj_without_normals_gets_face_normals() {
        let mesh = Mesh::from_obj_bytes("tri.obj", TRIANGLE_OBJ.as_bytes()).unwrap();
        assert_eq!(mesh.part_count(), 1);
        let part = &mesh.parts()[0];
        assert_eq!(part.triangle_count(), 1);
        assert!(part.vertices.iter().all(|v| (v.normal - Vec3::Z).length() < 1e-5));
    }

    #[test]
    fn invalid_obj_is_a_decode_error() {
        let err = Mesh::from_obj_bytes("empty.obj", b"# nothing here\nv 0 0 0\n").unwrap_err();
        assert!(matches!(err, AssetError::Decode { .. }));
    }

    #[test]
    fn upload_and_unload_balance() {
        let mut backend = HeadlessBackend::default();
        let mesh = Mesh::from_parts("pair", vec![MeshPart::cube(), MeshPart::plane(1.0, 1.0, 1)]);
        assert!(!mesh.is_gpu_resident());
        mesh.ensure_uploaded(&mut backend).unwrap();
        mesh.ensure_uploaded(&mut backend).unwrap();
        assert_eq!(backend.live_count(ResourceClass::Buffer), 4);
        mesh.unload(&mut backend).unwrap();
        assert_eq!(backend.live_count(ResourceClass::Buffer), 0);
        assert!(!mesh.is_gpu_resident());
    }
}
