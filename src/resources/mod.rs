//! Resource management
//!
//! GPU resources (meshes, textures, shaders) are shared handles over a
//! per-resource read/write lock. Callers mutate source data and change
//! flags under the write lock; the render thread takes the same lock while
//! it uploads, and is the only one that ever touches the native handles
//! stored inside.

mod mesh;
mod object;
mod pool;
mod shader;
mod texture;

pub use mesh::*;
pub use object::*;
pub use pool::*;
pub use shader::*;
pub use texture::*;

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;

/// Process-unique identity of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Upload bookkeeping shared by every resource kind.
///
/// `queued` is set while an upload command is waiting on the render thread;
/// further loads only register their completion signal.
#[derive(Debug, Default)]
pub(crate) struct PendingLoad {
    pub(crate) queued: bool,
    pub(crate) waiters: Vec<Sender<()>>,
}

impl PendingLoad {
    /// Finish the queued upload and hand back every waiting signal.
    pub(crate) fn complete(&mut self) -> Vec<Sender<()>> {
        self.queued = false;
        std::mem::take(&mut self.waiters)
    }
}
