use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// One counted reference to a cached resource.
///
/// Handles are deliberately not `Clone`: each one corresponds to exactly one
/// fetch and must be given back with [`super::ResourceCache::release`].
pub struct Handle<A> {
    path: Arc<str>,
    asset: Arc<A>,
}

impl<A> Handle<A> {
    pub(crate) fn new(path: Arc<str>, asset: Arc<A>) -> Self {
        Self { path, asset }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn shared_path(&self) -> Arc<str> {
        self.path.clone()
    }

    /// An uncounted pointer to the resource, for holders that do not own a reference.
    pub fn share(&self) -> Arc<A> {
        self.asset.clone()
    }

    /// Whether two handles point at the same cached instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.asset, &b.asset)
    }
}

impl<A> Deref for Handle<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.asset
    }
}

impl<A> fmt::Debug for Handle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("path", &self.path).finish()
    }
}
