//! Deferred deletion of native handles.
//!
//! Resource objects can be dropped on any thread, but native handles may
//! only be deleted on the render thread. Dropping a resource therefore does
//! not call into the backend: its handles are appended to the free list of
//! their kind, and the render thread deletes everything queued at the start
//! of the next frame, before any command of that frame runs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    DeferredFinalizer                      │
//! │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐  │
//! │  │ meshes │ │shaders │ │textures│ │  fbos  │ │  rbos  │  │
//! │  └────────┘ └────────┘ └────────┘ └────────┘ └────────┘  │
//! └──────────────────────────────────────────────────────────┘
//!
//! On Drop(resource), any thread:
//!   1. Don't call the backend
//!   2. queue_free(handle) appends to the list of its kind
//!
//! At the start of RunFrame, render thread:
//!   1. Swap all lists out under the lock
//!   2. Delete every handle through the backend
//! ```
//!
//! A handle is only queued once the last owner of the resource is gone.
//! Commands hold owners of every resource they reference, so a queued
//! handle is never referenced by a pending command.
//!
//! Once the render thread has stopped the finalizer is closed. Handles
//! dropped after that are not queued: they leak with the native context.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::backend::{
    BufferHandle, FramebufferHandle, NativeBackend, NativeHandle, ProgramHandle,
    RenderbufferHandle, ResourceKind, TextureHandle,
};
use crate::target::TargetId;

/// Handles pending deletion, one append-only list per resource kind.
#[derive(Debug, Default)]
struct FreeLists {
    meshes: Vec<BufferHandle>,
    shaders: Vec<ProgramHandle>,
    textures: Vec<TextureHandle>,
    framebuffers: Vec<FramebufferHandle>,
    renderbuffers: Vec<RenderbufferHandle>,
}

impl FreeLists {
    fn push(&mut self, handle: NativeHandle) {
        match handle {
            NativeHandle::Buffer(h) => self.meshes.push(h),
            NativeHandle::Program(h) => self.shaders.push(h),
            NativeHandle::Texture(h) => self.textures.push(h),
            NativeHandle::Framebuffer(h) => self.framebuffers.push(h),
            NativeHandle::Renderbuffer(h) => self.renderbuffers.push(h),
        }
    }

    fn len(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Mesh => self.meshes.len(),
            ResourceKind::Shader => self.shaders.len(),
            ResourceKind::Texture => self.textures.len(),
            ResourceKind::Framebuffer => self.framebuffers.len(),
            ResourceKind::Renderbuffer => self.renderbuffers.len(),
        }
    }
}

/// Batches native-handle deletions until a safe point on the render thread.
pub struct DeferredFinalizer {
    lists: Mutex<FreeLists>,
    /// Render targets whose framebuffer was queued since the last frame.
    released_targets: Mutex<Vec<TargetId>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DeferredFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredFinalizer")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

impl DeferredFinalizer {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(FreeLists::default()),
            released_targets: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a handle for deletion at the next frame start.
    ///
    /// Safe to call from any thread.
    pub fn queue_free(&self, handle: impl Into<NativeHandle>) {
        let handle = handle.into();
        if self.is_closed() {
            log::debug!("DeferredFinalizer closed, {:?} leaks with the native context", handle);
            return;
        }
        self.lists.lock().push(handle);
    }

    /// Queue several handles under a single lock acquisition.
    pub fn queue_free_all(&self, handles: impl IntoIterator<Item = NativeHandle>) {
        if self.is_closed() {
            let leaked = handles.into_iter().count();
            log::debug!("DeferredFinalizer closed, {} handles leak with the native context", leaked);
            return;
        }
        let mut lists = self.lists.lock();
        for handle in handles {
            lists.push(handle);
        }
    }

    /// Record that a render target's framebuffer has been queued.
    pub(crate) fn queue_target_release(&self, id: TargetId) {
        if !self.is_closed() {
            self.released_targets.lock().push(id);
        }
    }

    /// Targets released since the last call.
    pub(crate) fn take_released_targets(&self) -> Vec<TargetId> {
        std::mem::take(&mut *self.released_targets.lock())
    }

    /// Stop accepting handles. Called once the render thread stops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Delete every queued handle through the backend and clear all lists.
    ///
    /// Must only be called on the render thread. Returns the number of
    /// handles deleted.
    pub fn flush_all(&self, backend: &mut dyn NativeBackend) -> usize {
        let lists = std::mem::take(&mut *self.lists.lock());

        let total = lists.meshes.len()
            + lists.shaders.len()
            + lists.textures.len()
            + lists.framebuffers.len()
            + lists.renderbuffers.len();
        if total == 0 {
            return 0;
        }

        // Framebuffers go before the attachments they reference.
        if !lists.framebuffers.is_empty() {
            backend.delete_framebuffers(&lists.framebuffers);
        }
        if !lists.renderbuffers.is_empty() {
            backend.delete_renderbuffers(&lists.renderbuffers);
        }
        if !lists.textures.is_empty() {
            backend.delete_textures(&lists.textures);
        }
        if !lists.meshes.is_empty() {
            backend.delete_buffers(&lists.meshes);
        }
        if !lists.shaders.is_empty() {
            backend.delete_programs(&lists.shaders);
        }

        log::debug!("DeferredFinalizer: deleted {} native handles", total);
        total
    }

    /// Number of handles currently pending deletion.
    pub fn pending_count(&self) -> usize {
        let lists = self.lists.lock();
        ResourceKind::ALL.iter().map(|kind| lists.len(*kind)).sum()
    }

    /// Number of handles of one kind pending deletion.
    pub fn pending(&self, kind: ResourceKind) -> usize {
        self.lists.lock().len(kind)
    }
}

impl Default for DeferredFinalizer {
    fn default() -> Self {
        Self::new()
    }
}
