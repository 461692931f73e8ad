//! Object pooling for resource data.
//!
//! Scenes that build and discard meshes every frame would otherwise
//! reallocate every slice each time. A [`Pool`] keeps released values
//! around with their `Vec` capacity intact and hands them back out on
//! [`acquire`](Pool::acquire).
//!
//! Releasing a value resets it, which drops any native handles it held.
//! Those handles go through the deferred finalizer like any other drop,
//! so a pool can be used from any thread.
//!
//! # Example
//!
//! ```
//! use lilium_render::resources::{Mesh, MeshPool};
//! use glam::Vec3;
//!
//! let pool = MeshPool::new(16);
//! let mut data = pool.acquire();
//! data.set_vertices(vec![Vec3::ZERO, Vec3::X, Vec3::Y]);
//!
//! let mesh = Mesh::new(data);
//! mesh.recycle(&pool);
//! assert_eq!(pool.len(), 1);
//! assert!(pool.acquire().vertices.capacity() >= 3);
//! ```

use parking_lot::Mutex;

use super::{MeshData, ShaderData, TextureData};

/// Trait for types that can be pooled and reused.
///
/// Implementors must be able to create an empty instance and clear their
/// contents while preserving allocated capacity.
pub trait Poolable {
    /// Create a new empty instance.
    fn new_empty() -> Self;

    /// Reset the value to an empty state, preserving allocated capacity.
    ///
    /// For example, call `Vec::clear()` rather than replacing with a new `Vec`.
    fn reset(&mut self);
}

/// A thread-safe free list of reusable values.
#[derive(Debug)]
pub struct Pool<T: Poolable> {
    free: Mutex<Vec<T>>,
    max_size: usize,
}

pub type MeshPool = Pool<MeshData>;
pub type TexturePool = Pool<TextureData>;
pub type ShaderPool = Pool<ShaderData>;

impl<T: Poolable> Pool<T> {
    /// Create a pool that keeps at most `max_size` released values.
    pub fn new(max_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_size,
        }
    }

    /// Take a value out of the pool, or create an empty one.
    pub fn acquire(&self) -> T {
        self.free.lock().pop().unwrap_or_else(T::new_empty)
    }

    /// Reset a value and return it to the pool.
    ///
    /// When the pool is full the value is dropped instead.
    pub fn release(&self, mut value: T) {
        value.reset();
        let mut free = self.free.lock();
        if free.len() < self.max_size {
            free.push(value);
        }
    }

    /// Number of values waiting to be reused.
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pooled value.
    pub fn clear(&self) {
        self.free.lock().clear();
    }
}

impl<T: Poolable> Default for Pool<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

/// One pool per resource kind.
#[derive(Debug, Default)]
pub struct ResourcePools {
    pub meshes: MeshPool,
    pub textures: TexturePool,
    pub shaders: ShaderPool,
}
