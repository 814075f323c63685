use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::{Asset, AssetError, AssetIo, AssetResult, Handle, ResourceKind};
use crate::backend::{BackendResult, GraphicsBackend};

trait ErasedAsset: Send + Sync {
    fn kind(&self) -> ResourceKind;
    fn gpu_resident(&self) -> bool;
    fn unload_erased(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<A: Asset> ErasedAsset for A {
    fn kind(&self) -> ResourceKind {
        A::KIND
    }

    fn gpu_resident(&self) -> bool {
        self.is_gpu_resident()
    }

    fn unload_erased(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        self.unload(backend)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type ErasedArc = Arc<dyn ErasedAsset>;
type LoadOutcome = AssetResult<(Arc<str>, ErasedArc)>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

fn downcast<A: Asset>(path: &str, asset: ErasedArc) -> AssetResult<Arc<A>> {
    let found = asset.kind();
    asset
        .into_any()
        .downcast::<A>()
        .map_err(|_| AssetError::KindMismatch {
            path: path.to_string(),
            expected: A::KIND,
            found,
        })
}

fn same_instance<A: Asset>(erased: &ErasedArc, typed: &Arc<A>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(erased) as *const (),
        Arc::as_ptr(typed) as *const (),
    )
}

struct CacheEntry {
    path: Arc<str>,
    kind: ResourceKind,
    asset: ErasedArc,
    ref_count: usize,
    /// Fetches that joined the load but have not picked up their reference yet.
    unclaimed: usize,
    /// Load that produced the entry; 0 for registered resources.
    load_id: u64,
    dependencies: Vec<Arc<str>>,
}

struct InFlight {
    id: u64,
    kind: ResourceKind,
    load: SharedLoad,
    /// Live fetches subscribed to this load.
    waiters: usize,
    /// In-flight loads this one is currently waiting on.
    awaiting: Vec<Arc<str>>,
}

struct PendingUnload {
    path: Arc<str>,
    asset: ErasedArc,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Arc<str>, CacheEntry>,
    in_flight: HashMap<Arc<str>, InFlight>,
    // Edges recorded while the parent is still loading.
    pending_dependencies: HashMap<Arc<str>, Vec<Arc<str>>>,
    pending_unloads: Vec<PendingUnload>,
    loads_started: u64,
    loads_failed: u64,
    unloads_performed: u64,
}

impl CacheState {
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut visited = std::collections::HashSet::new();
        while let Some(path) = stack.pop() {
            if path == to {
                return true;
            }
            if !visited.insert(path) {
                continue;
            }
            let edges = self
                .entries
                .get(path)
                .map(|e| e.dependencies.as_slice())
                .into_iter()
                .chain(self.pending_dependencies.get(path).map(Vec::as_slice));
            for deps in edges {
                stack.extend(deps.iter().map(|d| &**d));
            }
        }
        false
    }

    /// Whether the in-flight load of `from` waits, directly or through other
    /// in-flight loads, on `to`.
    fn waits_on(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut visited = std::collections::HashSet::new();
        while let Some(path) = stack.pop() {
            if path == to {
                return true;
            }
            if !visited.insert(path) {
                continue;
            }
            if let Some(in_flight) = self.in_flight.get(path) {
                stack.extend(in_flight.awaiting.iter().map(|d| &**d));
            }
        }
        false
    }

    /// Drop an entry nobody references, queue its unload and hand back the
    /// dependencies it owned.
    fn evict(&mut self, path: &str) -> Vec<Arc<str>> {
        match self.entries.remove(path) {
            Some(entry) => {
                log::debug!("Resource {path} unreferenced, queueing unload");
                self.pending_unloads.push(PendingUnload {
                    path: entry.path,
                    asset: entry.asset,
                });
                entry.dependencies
            }
            None => Vec::new(),
        }
    }

    fn release_all(&mut self, paths: Vec<Arc<str>>) {
        let mut stack = paths;
        while let Some(path) = stack.pop() {
            let Some(entry) = self.entries.get_mut(&*path) else {
                log::warn!("Release of resource {path} that is not cached");
                continue;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 && entry.unclaimed == 0 {
                stack.extend(self.evict(&path));
            }
        }
    }
}

/// A fetch subscribed to an in-flight load. Dropping it before the load
/// resolves gives its slot back, so cancelled fetches never hold a reference.
struct Subscription<'a> {
    cache: &'a ResourceCache,
    path: Arc<str>,
    load_id: u64,
    done: bool,
}

impl Subscription<'_> {
    /// Turn the subscription into one counted reference on the settled entry.
    fn claim(mut self) -> AssetResult<()> {
        self.done = true;
        let mut state = self.cache.state.lock();
        match state.entries.get_mut(&*self.path) {
            Some(entry) if entry.load_id == self.load_id && entry.unclaimed > 0 => {
                entry.unclaimed -= 1;
                entry.ref_count += 1;
                Ok(())
            }
            _ => Err(AssetError::Conflict(self.path.to_string())),
        }
    }

    fn settled_with_error(mut self) {
        self.done = true;
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.cache.abandon(&self.path, self.load_id);
        }
    }
}

/// Snapshot of cache activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub cached: usize,
    pub in_flight: usize,
    pub pending_unloads: usize,
    pub loads_started: u64,
    pub loads_failed: u64,
    pub unloads_performed: u64,
}

/// Shared, path-addressed resource cache. Cloning yields another reference to
/// the same cache.
#[derive(Clone)]
pub struct ResourceCache {
    state: Arc<Mutex<CacheState>>,
    io: Arc<dyn AssetIo>,
}

impl ResourceCache {
    pub fn new(io: impl AssetIo) -> Self {
        Self::with_shared_io(Arc::new(io))
    }

    pub fn with_shared_io(io: Arc<dyn AssetIo>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            io,
        }
    }

    /// Fetch a resource, loading it if nobody holds it yet.
    ///
    /// Returns the cached instance when present; joins the running load when one
    /// is in flight for `path`. Each successful call adds one reference.
    pub async fn fetch<A: Asset>(&self, path: &str) -> AssetResult<Handle<A>> {
        let (path, asset) = self.acquire::<A>(path, Vec::new()).await?;
        Ok(Handle::new(path, asset))
    }

    async fn acquire<A: Asset>(
        &self,
        path: &str,
        chain: Vec<Arc<str>>,
    ) -> AssetResult<(Arc<str>, Arc<A>)> {
        let (subscription, load) = {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get_mut(path) {
                if entry.kind != A::KIND {
                    return Err(AssetError::KindMismatch {
                        path: path.to_string(),
                        expected: A::KIND,
                        found: entry.kind,
                    });
                }
                let asset = downcast::<A>(path, entry.asset.clone())?;
                entry.ref_count += 1;
                log::debug!("Cache hit for {} (refs: {})", path, entry.ref_count);
                return Ok((entry.path.clone(), asset));
            }

            let parent = chain.last().cloned();
            if let Some(parent) = &parent {
                if state.waits_on(path, parent) {
                    return Err(AssetError::DependencyCycle(path.to_string()));
                }
            }

            let key: Arc<str> = Arc::from(path);
            let (load_id, load) = match state.in_flight.get_mut(path) {
                Some(in_flight) if in_flight.kind != A::KIND => {
                    return Err(AssetError::KindMismatch {
                        path: path.to_string(),
                        expected: A::KIND,
                        found: in_flight.kind,
                    });
                }
                Some(in_flight) => {
                    in_flight.waiters += 1;
                    (in_flight.id, in_flight.load.clone())
                }
                None => {
                    state.loads_started += 1;
                    let id = state.loads_started;
                    let load = self.start_load::<A>(key.clone(), chain);
                    state.in_flight.insert(
                        key.clone(),
                        InFlight {
                            id,
                            kind: A::KIND,
                            load: load.clone(),
                            waiters: 1,
                            awaiting: Vec::new(),
                        },
                    );
                    (id, load)
                }
            };

            if let Some(in_flight) = parent.and_then(|parent| state.in_flight.get_mut(&parent)) {
                in_flight.awaiting.push(key.clone());
            }
            let subscription = Subscription {
                cache: self,
                path: key,
                load_id,
                done: false,
            };
            (subscription, load)
        };

        match load.await {
            Ok((path, asset)) => {
                let asset = downcast::<A>(&path, asset)?;
                subscription.claim()?;
                Ok((path, asset))
            }
            Err(err) => {
                subscription.settled_with_error();
                Err(err)
            }
        }
    }

    /// A subscribed fetch went away before picking up its reference.
    fn abandon(&self, path: &str, load_id: u64) {
        let mut state = self.state.lock();
        if let Some(in_flight) = state.in_flight.get_mut(path) {
            if in_flight.id == load_id {
                // The load stays registered; the next fetch of `path` drives it on.
                in_flight.waiters = in_flight.waiters.saturating_sub(1);
            }
            return;
        }
        let Some(entry) = state.entries.get_mut(path) else {
            return;
        };
        if entry.load_id != load_id || entry.unclaimed == 0 {
            return;
        }
        entry.unclaimed -= 1;
        if entry.ref_count == 0 && entry.unclaimed == 0 {
            let dependencies = state.evict(path);
            state.release_all(dependencies);
        }
    }

    fn start_load<A: Asset>(&self, path: Arc<str>, chain: Vec<Arc<str>>) -> SharedLoad {
        let cache = self.clone();
        async move {
            log::debug!("Loading {path}");
            let outcome = match cache.io.read(&path).await {
                Ok(bytes) => {
                    let ctx = LoadContext {
                        cache: cache.clone(),
                        path: path.clone(),
                        chain,
                    };
                    A::load(ctx, bytes)
                        .await
                        .map(|asset| Arc::new(asset) as ErasedArc)
                }
                Err(err) => Err(err),
            };
            cache.settle(path, outcome)
        }
        .boxed()
        .shared()
    }

    /// Publish the result of a load exactly once. Each live subscriber picks up
    /// its own reference afterwards; with none left the resource is evicted
    /// right away.
    fn settle(&self, path: Arc<str>, outcome: AssetResult<ErasedArc>) -> LoadOutcome {
        let (result, orphaned) = {
            let mut state = self.state.lock();
            let (load_id, waiters) = state.in_flight.remove(&path).map_or((0, 0), |f| (f.id, f.waiters));
            let dependencies = state.pending_dependencies.remove(&path).unwrap_or_default();
            match outcome {
                Ok(asset) if !state.entries.contains_key(&path) => {
                    state.entries.insert(
                        path.clone(),
                        CacheEntry {
                            path: path.clone(),
                            kind: asset.kind(),
                            asset: asset.clone(),
                            ref_count: 0,
                            unclaimed: waiters,
                            load_id,
                            dependencies,
                        },
                    );
                    if waiters == 0 {
                        log::debug!("Load of {path} finished with nobody waiting");
                        let dependencies = state.evict(&path);
                        state.release_all(dependencies);
                    }
                    (Ok((path.clone(), asset)), Vec::new())
                }
                Ok(_) => {
                    state.loads_failed += 1;
                    (Err(AssetError::Conflict(path.to_string())), dependencies)
                }
                Err(err) => {
                    state.loads_failed += 1;
                    (Err(err), dependencies)
                }
            }
        };

        if let Err(err) = &result {
            log::warn!("Failed to load {path}: {err}");
        }
        if !orphaned.is_empty() {
            self.state.lock().release_all(orphaned);
        }
        result
    }

    /// Give back one reference. At zero the resource leaves the cache, its
    /// dependencies are released and its unload is queued for [`Self::flush_unloads`].
    pub fn release<A: Asset>(&self, handle: Handle<A>) {
        self.release_path(handle.path());
    }

    fn release_path(&self, path: &str) {
        self.state.lock().release_all(vec![Arc::from(path)]);
    }

    /// Run queued unloads on the render thread. Failures are logged, not returned.
    pub fn flush_unloads(&self, backend: &mut dyn GraphicsBackend) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending_unloads);
        let count = pending.len();
        for PendingUnload { path, asset } in pending {
            if let Err(err) = asset.unload_erased(backend) {
                log::error!("Failed to unload {path}: {err}");
            }
        }
        self.state.lock().unloads_performed += count as u64;
        count
    }

    /// Bind an already-built resource to `path`.
    ///
    /// Registering the instance already bound to `path` adds a reference;
    /// a different instance is a conflict.
    pub fn register<A: Asset>(&self, path: &str, asset: Arc<A>) -> AssetResult<Handle<A>> {
        let mut state = self.state.lock();
        if state.in_flight.contains_key(path) {
            return Err(AssetError::Conflict(path.to_string()));
        }
        if let Some(entry) = state.entries.get_mut(path) {
            if !same_instance(&entry.asset, &asset) {
                return Err(AssetError::Conflict(path.to_string()));
            }
            entry.ref_count += 1;
            return Ok(Handle::new(entry.path.clone(), asset));
        }
        let key: Arc<str> = Arc::from(path);
        state.entries.insert(
            key.clone(),
            CacheEntry {
                path: key.clone(),
                kind: A::KIND,
                asset: asset.clone(),
                ref_count: 1,
                unclaimed: 0,
                load_id: 0,
                dependencies: Vec::new(),
            },
        );
        Ok(Handle::new(key, asset))
    }

    /// Make `parent` own the reference held by `child`; it is released together
    /// with the parent.
    pub fn register_dependency<B: Asset>(&self, parent: &str, child: Handle<B>) -> AssetResult<()> {
        let child_path = child.shared_path();
        let outcome = {
            let mut state = self.state.lock();
            if *child_path == *parent || state.reaches(&child_path, parent) {
                Err(AssetError::DependencyCycle(parent.to_string()))
            } else if let Some(entry) = state.entries.get_mut(parent) {
                entry.dependencies.push(child_path);
                Ok(())
            } else if let Some((key, _)) = state.in_flight.get_key_value(parent) {
                let key = key.clone();
                state.pending_dependencies.entry(key).or_default().push(child_path);
                Ok(())
            } else {
                Err(AssetError::NotFound(parent.to_string()))
            }
        };
        if outcome.is_err() {
            self.release(child);
        }
        outcome
    }

    fn record_load_dependency(&self, parent: &Arc<str>, child: Arc<str>) {
        let mut state = self.state.lock();
        if state.in_flight.contains_key(parent) {
            state
                .pending_dependencies
                .entry(parent.clone())
                .or_default()
                .push(child);
        } else {
            drop(state);
            log::warn!("Dependency {child} of {parent} resolved after its parent settled");
            self.release_path(&child);
        }
    }

    pub fn ref_count(&self, path: &str) -> Option<usize> {
        self.state.lock().entries.get(path).map(|e| e.ref_count)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    pub fn is_loading(&self, path: &str) -> bool {
        self.state.lock().in_flight.contains_key(path)
    }

    pub fn kind(&self, path: &str) -> Option<ResourceKind> {
        self.state.lock().entries.get(path).map(|e| e.kind)
    }

    pub fn dependencies(&self, path: &str) -> Vec<String> {
        self.state
            .lock()
            .entries
            .get(path)
            .map(|e| e.dependencies.iter().map(|d| d.to_string()).collect())
            .unwrap_or_default()
    }

    /// `None` when the path is not cached.
    pub fn is_gpu_resident(&self, path: &str) -> Option<bool> {
        self.state
            .lock()
            .entries
            .get(path)
            .map(|e| e.asset.gpu_resident())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            cached: state.entries.len(),
            in_flight: state.in_flight.len(),
            pending_unloads: state.pending_unloads.len(),
            loads_started: state.loads_started,
            loads_failed: state.loads_failed,
            unloads_performed: state.unloads_performed,
        }
    }
}

/// Handed to [`Asset::load`]; fetches made through it become dependencies of
/// the resource being loaded.
pub struct LoadContext {
    cache: ResourceCache,
    path: Arc<str>,
    chain: Vec<Arc<str>>,
}

impl LoadContext {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Resolve a path written inside this resource against its directory.
    /// Absolute paths and `scheme://` paths are returned unchanged.
    pub fn resolve(&self, relative: &str) -> String {
        resolve_path(&self.path, relative)
    }

    /// Fetch a dependency. The reference is owned by the resource being loaded.
    pub async fn fetch<B: Asset>(&self, path: &str) -> AssetResult<Arc<B>> {
        if *self.path == *path || self.chain.iter().any(|p| **p == *path) {
            return Err(AssetError::DependencyCycle(path.to_string()));
        }
        let mut chain = self.chain.clone();
        chain.push(self.path.clone());
        let (child_path, asset) = self.cache.acquire::<B>(path, chain).await?;
        self.cache.record_load_dependency(&self.path, child_path);
        Ok(asset)
    }

    /// Read raw bytes of a companion file without caching it.
    pub async fn read(&self, path: &str) -> AssetResult<Vec<u8>> {
        self.cache.io.read(path).await
    }
}

pub(crate) fn resolve_path(base: &str, relative: &str) -> String {
    if relative.starts_with('/') || relative.contains("://") {
        return relative.to_string();
    }
    let (scheme, base_path) = match base.find("://") {
        Some(i) => base.split_at(i + 3),
        None => ("", base),
    };
    let mut segments: Vec<&str> = base_path.split('/').collect();
    segments.pop();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }
    format!("{scheme}{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryAssetIo;
    use crate::backend::HeadlessBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn relative_paths_resolve_against_the_parent_directory() {
        assert_eq!(resolve_path("materials/red.json", "../t.png"), "t.png");
        assert_eq!(resolve_path("materials/red.json", "red.png"), "materials/red.png");
        assert_eq!(resolve_path("red.json", "red.png"), "red.png");
        assert_eq!(resolve_path("builtin://techniques/sky.json", "builtin://shaders/sky.wgsl"), "builtin://shaders/sky.wgsl");
        assert_eq!(resolve_path("builtin://techniques/sky.json", "sky.wgsl"), "builtin://techniques/sky.wgsl");
    }

    /// Text resource whose lines `dep:<path>` are fetched as dependencies.
    struct Note {
        text: String,
        unloads: AtomicUsize,
    }

    impl Asset for Note {
        const KIND: ResourceKind = ResourceKind::Shader;

        fn load(ctx: LoadContext, bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
            async move {
                let text = String::from_utf8(bytes).map_err(|e| AssetError::decode(ctx.path(), e))?;
                for line in text.lines() {
                    if let Some(dep) = line.strip_prefix("dep:") {
                        ctx.fetch::<Note>(dep).await?;
                    }
                    if line == "fail" {
                        return Err(AssetError::decode(ctx.path(), "asked to fail"));
                    }
                }
                Ok(Note {
                    text,
                    unloads: AtomicUsize::new(0),
                })
            }
            .boxed()
        }

        fn unload(&self, _backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Blob;

    impl Asset for Blob {
        const KIND: ResourceKind = ResourceKind::Texture;

        fn load(_ctx: LoadContext, _bytes: Vec<u8>) -> BoxFuture<'static, AssetResult<Self>> {
            async { Ok(Blob) }.boxed()
        }
    }

    fn cache_with(files: &[(&str, &str)]) -> (ResourceCache, Arc<MemoryAssetIo>) {
        let io = Arc::new(MemoryAssetIo::new());
        for (path, text) in files {
            io.insert(*path, text.as_bytes().to_vec());
        }
        (ResourceCache::with_shared_io(io.clone()), io)
    }

    #[test]
    fn repeated_fetches_share_one_instance() {
        let (cache, io) = cache_with(&[("a.txt", "hello")]);
        let handles: Vec<Handle<Note>> = (0..3)
            .map(|_| pollster::block_on(cache.fetch::<Note>("a.txt")).unwrap())
            .collect();

        assert!(handles.iter().all(|h| Handle::ptr_eq(h, &handles[0])));
        assert_eq!(cache.ref_count("a.txt"), Some(3));
        assert_eq!(io.read_count("a.txt"), 1);
        assert_eq!(handles[0].text, "hello");
    }

    #[test]
    fn last_release_unloads_exactly_once() {
        let (cache, _io) = cache_with(&[("a.txt", "hello")]);
        let mut backend = HeadlessBackend::default();
        let first = pollster::block_on(cache.fetch::<Note>("a.txt")).unwrap();
        let second = pollster::block_on(cache.fetch::<Note>("a.txt")).unwrap();
        let note = first.share();

        cache.release(first);
        assert_eq!(cache.flush_unloads(&mut backend), 0);
        assert_eq!(cache.ref_count("a.txt"), Some(1));

        cache.release(second);
        assert_eq!(cache.flush_unloads(&mut backend), 1);
        assert_eq!(cache.flush_unloads(&mut backend), 0);
        assert_eq!(note.unloads.load(Ordering::SeqCst), 1);
        assert!(!cache.contains("a.txt"));
    }

    #[test]
    fn overlapping_fetches_collapse_into_one_load() {
        let (cache, io) = cache_with(&[("slow.txt", "slow")]);
        let gate = io.hold("slow.txt");

        let (a, b, ()) = pollster::block_on(async {
            futures::join!(
                cache.fetch::<Note>("slow.txt"),
                cache.fetch::<Note>("slow.txt"),
                async {
                    let _ = gate.send(());
                }
            )
        });
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Handle::ptr_eq(&a, &b));
        assert_eq!(io.read_count("slow.txt"), 1);
        assert_eq!(cache.stats().loads_started, 1);
        assert_eq!(cache.ref_count("slow.txt"), Some(2));
        assert!(!cache.is_loading("slow.txt"));
    }

    #[test]
    fn dropped_fetch_holds_no_reference() {
        let (cache, io) = cache_with(&[("slow.txt", "slow")]);
        let mut backend = HeadlessBackend::default();
        let gate = io.hold("slow.txt");

        let mut abandoned = Box::pin(cache.fetch::<Note>("slow.txt"));
        assert!(abandoned.as_mut().now_or_never().is_none());
        drop(abandoned);
        assert!(cache.is_loading("slow.txt"));

        let _ = gate.send(());
        let handle = pollster::block_on(cache.fetch::<Note>("slow.txt")).unwrap();
        assert_eq!(cache.ref_count("slow.txt"), Some(1));
        assert_eq!(cache.stats().loads_started, 1);

        cache.release(handle);
        assert!(!cache.contains("slow.txt"));
        assert_eq!(cache.flush_unloads(&mut backend), 1);
    }

    #[test]
    fn fetch_dropped_after_the_load_settles_gives_its_reference_back() {
        let (cache, io) = cache_with(&[("slow.txt", "slow")]);
        let gate = io.hold("slow.txt");

        let mut kept = Box::pin(cache.fetch::<Note>("slow.txt"));
        let mut dropped = Box::pin(cache.fetch::<Note>("slow.txt"));
        assert!(kept.as_mut().now_or_never().is_none());
        assert!(dropped.as_mut().now_or_never().is_none());

        let _ = gate.send(());
        let handle = kept.as_mut().now_or_never().unwrap().unwrap();
        assert!(cache.contains("slow.txt"));
        drop(dropped);
        assert_eq!(cache.ref_count("slow.txt"), Some(1));

        cache.release(handle);
        assert!(!cache.contains("slow.txt"));
        assert_eq!(cache.stats().pending_unloads, 1);
    }

    #[test]
    fn crossed_loads_in_flight_fail_instead_of_hanging() {
        let (cache, io) = cache_with(&[("a.txt", "dep:b.txt"), ("b.txt", "dep:a.txt")]);
        let gate_a = io.hold("a.txt");
        let gate_b = io.hold("b.txt");

        let mut a = Box::pin(cache.fetch::<Note>("a.txt"));
        let mut b = Box::pin(cache.fetch::<Note>("b.txt"));
        assert!(a.as_mut().now_or_never().is_none());
        assert!(b.as_mut().now_or_never().is_none());

        let _ = gate_a.send(());
        assert!(a.as_mut().now_or_never().is_none());
        let _ = gate_b.send(());
        let b = b.as_mut().now_or_never().unwrap();
        let a = a.as_mut().now_or_never().unwrap();

        assert_eq!(b.unwrap_err(), AssetError::DependencyCycle("a.txt".into()));
        assert_eq!(a.unwrap_err(), AssetError::DependencyCycle("a.txt".into()));
        let stats = cache.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.cached, 0);
    }

    #[test]
    fn missing_resource_is_not_found() {
        let (cache, _io) = cache_with(&[]);
        let err = pollster::block_on(cache.fetch::<Note>("nope.txt")).unwrap_err();
        assert_eq!(err, AssetError::NotFound("nope.txt".into()));
        assert!(!cache.contains("nope.txt"));
        assert!(!cache.is_loading("nope.txt"));
    }

    #[test]
    fn registering_a_different_instance_conflicts() {
        let (cache, _io) = cache_with(&[]);
        let note = Arc::new(Note {
            text: "procedural".into(),
            unloads: AtomicUsize::new(0),
        });
        let first = cache.register("gen://note", note.clone()).unwrap();
        let again = cache.register("gen://note", note).unwrap();
        assert!(Handle::ptr_eq(&first, &again));
        assert_eq!(cache.ref_count("gen://note"), Some(2));

        let other = Arc::new(Note {
            text: "other".into(),
            unloads: AtomicUsize::new(0),
        });
        assert_eq!(
            cache.register("gen://note", other).unwrap_err(),
            AssetError::Conflict("gen://note".into())
        );
    }

    #[test]
    fn dependencies_are_released_with_their_parent() {
        let (cache, _io) = cache_with(&[("parent.txt", "dep:child.txt"), ("child.txt", "leaf")]);
        let mut backend = HeadlessBackend::default();
        let parent = pollster::block_on(cache.fetch::<Note>("parent.txt")).unwrap();

        assert_eq!(cache.dependencies("parent.txt"), vec!["child.txt".to_string()]);
        assert_eq!(cache.ref_count("child.txt"), Some(1));

        cache.release(parent);
        assert_eq!(cache.flush_unloads(&mut backend), 2);
        assert!(!cache.contains("child.txt"));
    }

    #[test]
    fn failed_load_releases_fetched_dependencies() {
        let (cache, _io) = cache_with(&[("broken.txt", "dep:child.txt\nfail"), ("child.txt", "leaf")]);
        let err = pollster::block_on(cache.fetch::<Note>("broken.txt")).unwrap_err();
        assert!(matches!(err, AssetError::Decode { .. }));
        assert!(!cache.contains("broken.txt"));
        assert!(!cache.contains("child.txt"));
        assert_eq!(cache.stats().pending_unloads, 1);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let (cache, _io) = cache_with(&[("a.txt", "dep:b.txt"), ("b.txt", "dep:a.txt")]);
        let err = pollster::block_on(cache.fetch::<Note>("a.txt")).unwrap_err();
        assert_eq!(err, AssetError::DependencyCycle("a.txt".into()));
    }

    #[test]
    fn explicit_dependency_edges_follow_the_parent() {
        let (cache, _io) = cache_with(&[("a.txt", "a"), ("b.txt", "b")]);
        let mut backend = HeadlessBackend::default();
        let a = pollster::block_on(cache.fetch::<Note>("a.txt")).unwrap();
        let b = pollster::block_on(cache.fetch::<Note>("b.txt")).unwrap();

        cache.register_dependency("a.txt", b).unwrap();
        let again = pollster::block_on(cache.fetch::<Note>("b.txt")).unwrap();
        assert_eq!(
            cache.register_dependency("b.txt", again).unwrap_err(),
            AssetError::DependencyCycle("b.txt".into())
        );
        assert_eq!(cache.ref_count("b.txt"), Some(1));

        cache.release(a);
        assert_eq!(cache.flush_unloads(&mut backend), 2);
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let (cache, _io) = cache_with(&[("a.txt", "a")]);
        let _note = pollster::block_on(cache.fetch::<Note>("a.txt")).unwrap();
        let err = pollster::block_on(cache.fetch::<Blob>("a.txt")).unwrap_err();
        assert!(matches!(err, AssetError::KindMismatch { .. }));
        assert_eq!(cache.ref_count("a.txt"), Some(1));
    }
}
