//! Byte sources for the resource cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::{AssetError, AssetResult};

/// Asynchronous reader the cache pulls raw resource bytes from.
pub trait AssetIo: Send + Sync + 'static {
    fn read(&self, path: &str) -> BoxFuture<'static, AssetResult<Vec<u8>>>;
}

/// Reads resources from a directory on disk.
#[derive(Debug, Clone)]
pub struct FileAssetIo {
    root: PathBuf,
}

impl FileAssetIo {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetIo for FileAssetIo {
    fn read(&self, path: &str) -> BoxFuture<'static, AssetResult<Vec<u8>>> {
        let full_path = self.root.join(path);
        let path = path.to_string();
        async move {
            std::fs::read(&full_path).map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => AssetError::NotFound(path),
                _ => AssetError::Io {
                    path,
                    message: err.to_string(),
                },
            })
        }
        .boxed()
    }
}

type Gate = Shared<oneshot::Receiver<()>>;

/// In-memory resource store, for procedural content and tests.
///
/// Counts reads per path and can hold reads of a path open until released,
/// which makes overlapping loads observable.
#[derive(Default)]
pub struct MemoryAssetIo {
    files: Mutex<HashMap<String, Arc<[u8]>>>,
    reads: Mutex<HashMap<String, usize>>,
    gates: Mutex<HashMap<String, Gate>>,
}

impl MemoryAssetIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        let bytes: Vec<u8> = bytes.into();
        self.files.lock().insert(path.into(), bytes.into());
    }

    pub fn with_file(self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(path, bytes);
        self
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().remove(path);
    }

    /// Number of reads issued for `path`.
    pub fn read_count(&self, path: &str) -> usize {
        self.reads.lock().get(path).copied().unwrap_or(0)
    }

    /// Keep reads of `path` pending until the returned sender fires or is dropped.
    pub fn hold(&self, path: impl Into<String>) -> oneshot::Sender<()> {
        let (sender, receiver) = oneshot::channel();
        self.gates.lock().insert(path.into(), receiver.shared());
        sender
    }
}

impl AssetIo for MemoryAssetIo {
    fn read(&self, path: &str) -> BoxFuture<'static, AssetResult<Vec<u8>>> {
        *self.reads.lock().entry(path.to_string()).or_default() += 1;
        let gate = self.gates.lock().get(path).cloned();
        let contents = self.files.lock().get(path).cloned();
        let path = path.to_string();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            contents
                .map(|bytes| bytes.to_vec())
                .ok_or(AssetError::NotFound(path))
        }
        .boxed()
    }
}

/// Serves a fixed table of compiled-in files and forwards every other path.
pub struct OverlayAssetIo {
    files: HashMap<&'static str, &'static [u8]>,
    fallback: Arc<dyn AssetIo>,
}

impl OverlayAssetIo {
    pub fn new(
        files: impl IntoIterator<Item = (&'static str, &'static [u8])>,
        fallback: Arc<dyn AssetIo>,
    ) -> Self {
        Self {
            files: files.into_iter().collect(),
            fallback,
        }
    }
}

impl AssetIo for OverlayAssetIo {
    fn read(&self, path: &str) -> BoxFuture<'static, AssetResult<Vec<u8>>> {
        match self.files.get(path) {
            Some(bytes) => futures::future::ready(Ok(bytes.to_vec())).boxed(),
            None => self.fallback.read(path),
        }
    }
}

impl<T: AssetIo + ?Sized> AssetIo for Arc<T> {
    fn read(&self, path: &str) -> BoxFuture<'static, AssetResult<Vec<u8>>> {
        (**self).read(path)
    }
}
