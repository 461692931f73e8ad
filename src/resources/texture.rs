//! Texture data and its native texture object

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use image::DynamicImage;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{PendingLoad, Pool, Poolable, ResourceId};
use crate::backend::{SamplerParams, TextureFilter, TextureHandle, WrapMode};
use crate::finalizer::DeferredFinalizer;
use crate::target::{TargetId, TargetLink};

bitflags! {
    /// Parts of a texture that changed since the last upload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureChanges: u8 {
        const PIXELS = 1 << 0;
        const SAMPLER = 1 << 1;
    }
}

/// Native texture object; dropping it queues the handle.
#[derive(Debug)]
pub(crate) struct NativeTexture {
    pub(crate) handle: TextureHandle,
    pub(crate) width: u32,
    pub(crate) height: u32,
    finalizer: Arc<DeferredFinalizer>,
}

impl NativeTexture {
    pub(crate) fn new(
        handle: TextureHandle,
        width: u32,
        height: u32,
        finalizer: Arc<DeferredFinalizer>,
    ) -> Self {
        Self {
            handle,
            width,
            height,
            finalizer,
        }
    }
}

impl Drop for NativeTexture {
    fn drop(&mut self) {
        self.finalizer.queue_free(self.handle);
    }
}

/// Source image, sampling parameters and upload state of a texture.
#[derive(Debug, Default)]
pub struct TextureData {
    pub source: Option<DynamicImage>,
    pub sampler: SamplerParams,
    pub changes: TextureChanges,
    pub keep_data_on_load: bool,
    pub(crate) loaded: bool,
    pub(crate) pending: PendingLoad,
    pub(crate) native: Option<NativeTexture>,
    // Declared after `native` so the texture is queued before its framebuffer.
    pub(crate) target: Option<TargetLink>,
}

impl TextureData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_image(image: DynamicImage) -> Self {
        let mut data = Self::new();
        data.set_source(image);
        data
    }

    pub fn set_source(&mut self, image: DynamicImage) {
        self.source = Some(image);
        self.changes |= TextureChanges::PIXELS;
    }

    pub fn set_filters(&mut self, min: TextureFilter, mag: TextureFilter) {
        self.sampler.min_filter = min;
        self.sampler.mag_filter = mag;
        self.changes |= TextureChanges::SAMPLER;
    }

    pub fn set_wrap(&mut self, u: WrapMode, v: WrapMode) {
        self.sampler.wrap_u = u;
        self.sampler.wrap_v = v;
        self.changes |= TextureChanges::SAMPLER;
    }

    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Size of the uploaded storage, which may differ from the source
    /// after power-of-two resampling.
    pub fn native_size(&self) -> Option<(u32, u32)> {
        self.native.as_ref().map(|n| (n.width, n.height))
    }

    /// The render target this texture is a destination of.
    pub fn render_target(&self) -> Option<TargetId> {
        self.target.as_ref().map(|link| link.id)
    }
}

impl Poolable for TextureData {
    fn new_empty() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.source = None;
        self.sampler = SamplerParams::default();
        self.changes = TextureChanges::empty();
        self.keep_data_on_load = false;
        self.loaded = false;
        self.pending = PendingLoad::default();
        self.native = None;
        self.target = None;
    }
}

/// Shared handle to a texture.
#[derive(Debug, Clone)]
pub struct Texture {
    id: ResourceId,
    inner: Arc<RwLock<TextureData>>,
}

impl Texture {
    pub fn new(data: TextureData) -> Self {
        Self {
            id: ResourceId::next(),
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// An empty texture, typically used as a render target destination.
    pub fn empty() -> Self {
        Self::new(TextureData::new())
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TextureData> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TextureData> {
        self.inner.write()
    }

    pub fn ptr_eq(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Return the data to a pool if this is the last handle.
    pub fn recycle(self, pool: &Pool<TextureData>) {
        if let Ok(lock) = Arc::try_unwrap(self.inner) {
            pool.release(lock.into_inner());
        }
    }

    pub fn downgrade(&self) -> WeakTexture {
        WeakTexture {
            id: self.id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning texture handle.
#[derive(Debug, Clone)]
pub struct WeakTexture {
    id: ResourceId,
    inner: Weak<RwLock<TextureData>>,
}

impl WeakTexture {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Texture> {
        self.inner.upgrade().map(|inner| Texture { id: self.id, inner })
    }
}
