//! Shader program data

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{PendingLoad, Pool, Poolable, ResourceId};
use crate::backend::{ProgramHandle, UniformValue};
use crate::finalizer::DeferredFinalizer;

/// Linked native program; dropping it queues the handle.
#[derive(Debug)]
pub(crate) struct NativeProgram {
    pub(crate) handle: ProgramHandle,
    finalizer: Arc<DeferredFinalizer>,
}

impl NativeProgram {
    pub(crate) fn new(handle: ProgramHandle, finalizer: Arc<DeferredFinalizer>) -> Self {
        Self { handle, finalizer }
    }
}

impl Drop for NativeProgram {
    fn drop(&mut self) {
        self.finalizer.queue_free(self.handle);
    }
}

/// Sources, uniform inputs and upload state of a shader.
///
/// Compiler and linker logs are appended to `error`. A shader with a
/// non-empty error is never uploaded again and every draw using it is
/// skipped.
#[derive(Debug, Default)]
pub struct ShaderData {
    pub name: String,
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
    /// Uniform values set on every draw.
    pub inputs: BTreeMap<String, UniformValue>,
    pub changed: bool,
    pub keep_data_on_load: bool,
    pub(crate) error: String,
    pub(crate) loaded: bool,
    pub(crate) pending: PendingLoad,
    pub(crate) native: Option<NativeProgram>,
}

impl ShaderData {
    pub fn new(name: impl Into<String>, vertex: impl Into<Vec<u8>>, fragment: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            vertex: vertex.into(),
            fragment: fragment.into(),
            changed: true,
            ..Default::default()
        }
    }

    pub fn set_sources(&mut self, vertex: impl Into<Vec<u8>>, fragment: impl Into<Vec<u8>>) {
        self.vertex = vertex.into();
        self.fragment = fragment.into();
        self.changed = true;
    }

    pub fn set_input(&mut self, name: impl Into<String>, value: UniformValue) {
        self.inputs.insert(name.into(), value);
    }

    /// Accumulated compiler and linker output.
    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

impl Poolable for ShaderData {
    fn new_empty() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.name.clear();
        self.vertex.clear();
        self.fragment.clear();
        self.inputs.clear();
        self.changed = false;
        self.keep_data_on_load = false;
        self.error.clear();
        self.loaded = false;
        self.pending = PendingLoad::default();
        self.native = None;
    }
}

/// Shared handle to a shader.
#[derive(Debug, Clone)]
pub struct Shader {
    id: ResourceId,
    inner: Arc<RwLock<ShaderData>>,
}

impl Shader {
    pub fn new(data: ShaderData) -> Self {
        Self {
            id: ResourceId::next(),
            inner: Arc::new(RwLock::new(data)),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ShaderData> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ShaderData> {
        self.inner.write()
    }

    pub fn ptr_eq(&self, other: &Shader) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Return the data to a pool if this is the last handle.
    pub fn recycle(self, pool: &Pool<ShaderData>) {
        if let Ok(lock) = Arc::try_unwrap(self.inner) {
            pool.release(lock.into_inner());
        }
    }
}
