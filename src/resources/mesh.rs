//! Mesh data and its native buffers

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use glam::{Vec2, Vec3, Vec4};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{PendingLoad, Pool, Poolable, ResourceId};
use crate::backend::{BufferHandle, NativeHandle};
use crate::finalizer::DeferredFinalizer;

bitflags! {
    /// Fixed mesh slices that changed since the last upload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MeshChanges: u8 {
        const INDICES = 1 << 0;
        const VERTICES = 1 << 1;
        const COLORS = 1 << 2;
        const NORMALS = 1 << 3;
        const BARYCENTRIC = 1 << 4;
    }
}

/// One set of texture coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TexCoordSet {
    pub slice: Vec<Vec2>,
    pub changed: bool,
}

impl TexCoordSet {
    pub fn new(slice: Vec<Vec2>) -> Self {
        Self {
            slice,
            changed: true,
        }
    }
}

/// Data of a custom vertex attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttribData {
    Float(Vec<f32>),
    Vec2(Vec<Vec2>),
    Vec3(Vec<Vec3>),
    Vec4(Vec<Vec4>),
}

impl AttribData {
    /// Number of float components per vertex.
    pub fn components(&self) -> u32 {
        match self {
            AttribData::Float(_) => 1,
            AttribData::Vec2(_) => 2,
            AttribData::Vec3(_) => 3,
            AttribData::Vec4(_) => 4,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AttribData::Float(v) => v.len(),
            AttribData::Vec2(v) => v.len(),
            AttribData::Vec3(v) => v.len(),
            AttribData::Vec4(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get attribute data as bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttribData::Float(v) => bytemuck::cast_slice(v),
            AttribData::Vec2(v) => bytemuck::cast_slice(v),
            AttribData::Vec3(v) => bytemuck::cast_slice(v),
            AttribData::Vec4(v) => bytemuck::cast_slice(v),
        }
    }

    fn release(&mut self) {
        match self {
            AttribData::Float(v) => *v = Vec::new(),
            AttribData::Vec2(v) => *v = Vec::new(),
            AttribData::Vec3(v) => *v = Vec::new(),
            AttribData::Vec4(v) => *v = Vec::new(),
        }
    }
}

/// A named custom vertex attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttrib {
    pub data: AttribData,
    pub changed: bool,
}

impl VertexAttrib {
    pub fn new(data: AttribData) -> Self {
        Self {
            data,
            changed: true,
        }
    }
}

/// Native buffers of an uploaded mesh.
///
/// Dropping it queues every buffer with the finalizer.
#[derive(Debug)]
pub(crate) struct NativeMesh {
    pub(crate) indices: Option<BufferHandle>,
    pub(crate) vertices: Option<BufferHandle>,
    pub(crate) colors: Option<BufferHandle>,
    pub(crate) normals: Option<BufferHandle>,
    pub(crate) barycentric: Option<BufferHandle>,
    pub(crate) texcoords: Vec<Option<BufferHandle>>,
    pub(crate) attributes: BTreeMap<String, (BufferHandle, u32)>,
    pub(crate) vertex_count: u32,
    pub(crate) index_count: u32,
    finalizer: Arc<DeferredFinalizer>,
}

impl NativeMesh {
    pub(crate) fn new(finalizer: Arc<DeferredFinalizer>) -> Self {
        Self {
            indices: None,
            vertices: None,
            colors: None,
            normals: None,
            barycentric: None,
            texcoords: Vec::new(),
            attributes: BTreeMap::new(),
            vertex_count: 0,
            index_count: 0,
            finalizer,
        }
    }

    fn buffers(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        [
            self.indices,
            self.vertices,
            self.colors,
            self.normals,
            self.barycentric,
        ]
        .into_iter()
        .chain(self.texcoords.iter().copied())
        .flatten()
        .chain(self.attributes.values().map(|(buffer, _)| *buffer))
    }
}

impl Drop for NativeMesh {
    fn drop(&mut self) {
        let buffers: Vec<NativeHandle> = self.buffers().map(NativeHandle::from).collect();
        if !buffers.is_empty() {
            self.finalizer.queue_free_all(buffers);
        }
    }
}

/// Source data and upload state of a mesh.
///
/// Slices are edited directly or through the setters; the setters also
/// raise the matching change flag. After a load without
/// `keep_data_on_load` the slices are released and only the native
/// buffers remain.
#[derive(Debug, Default)]
pub struct MeshData {
    pub indices: Vec<u32>,
    pub vertices: Vec<Vec3>,
    pub colors: Vec<Vec4>,
    pub normals: Vec<Vec3>,
    pub barycentric: Vec<Vec3>,
    pub texcoords: Vec<TexCoordSet>,
    pub attributes: BTreeMap<String, VertexAttrib>,
    pub changes: MeshChanges,
    pub keep_data_on_load: bool,
    pub(crate) loaded: bool,
    pub(crate) pending: PendingLoad,
    pub(crate) native: Option<NativeMesh>,
}

impl MeshData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_indices(&mut self, indices: Vec<u32>) {
        self.indices = indices;
        self.changes |= MeshChanges::INDICES;
    }

    pub fn set_vertices(&mut self, vertices: Vec<Vec3>) {
        self.vertices = vertices;
        self.changes |= MeshChanges::VERTICES;
    }

    pub fn set_colors(&mut self, colors: Vec<Vec4>) {
        self.colors = colors;
        self.changes |= MeshChanges::COLORS;
    }

    pub fn set_normals(&mut self, normals: Vec<Vec3>) {
        self.normals = normals;
        self.changes |= MeshChanges::NORMALS;
    }

    pub fn set_barycentric(&mut self, barycentric: Vec<Vec3>) {
        self.barycentric = barycentric;
        self.changes |= MeshChanges::BARYCENTRIC;
    }

    pub fn add_texcoords(&mut self, slice: Vec<Vec2>) {
        self.texcoords.push(TexCoordSet::new(slice));
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, data: AttribData) {
        self.attributes.insert(name.into(), VertexAttrib::new(data));
    }

    /// Remove a custom attribute. Its buffer is freed at the next upload.
    pub fn remove_attribute(&mut self, name: &str) -> Option<VertexAttrib> {
        self.attributes.remove(name)
    }

    /// Whether any slice changed since the last upload.
    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
            || self.texcoords.iter().any(|set| set.changed)
            || self.attributes.values().any(|attr| attr.changed)
            || self.has_stale_buffers()
    }

    /// Uploaded buffers left over from removed texcoord sets or attributes.
    fn has_stale_buffers(&self) -> bool {
        self.native.as_ref().is_some_and(|native| {
            native.texcoords.len() > self.texcoords.len()
                || native
                    .attributes
                    .keys()
                    .any(|name| !self.attributes.contains_key(name))
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Vertex count of the uploaded buffers, or of the source data when
    /// not loaded yet.
    pub fn vertex_count(&self) -> usize {
        match &self.native {
            Some(native) if self.loaded => native.vertex_count as usize,
            _ => self.vertices.len(),
        }
    }

    /// Forget all change flags.
    pub(crate) fn clear_changes(&mut self) {
        self.changes = MeshChanges::empty();
        for set in &mut self.texcoords {
            set.changed = false;
        }
        for attr in self.attributes.values_mut() {
            attr.changed = false;
        }
    }

    /// Release source slices after an upload.
    pub(crate) fn release_data(&mut self) {
        self.indices = Vec::new();
        self.vertices = Vec::new();
        self.colors = Vec::new();
        self.normals = Vec::new();
        self.barycentric = Vec::new();
        for set in &mut self.texcoords {
            set.slice = Vec::new();
        }
        for attr in self.attributes.values_mut() {
            attr.data.release();
        }
    }
}

impl Poolable for MeshData {
    fn new_empty() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.indices.clear();
        self.vertices.clear();
        self.colors.clear();
        self.normals.clear();
        self.barycentric.clear();
        self.texcoords.clear();
        self.attributes.clear();
        self.changes = MeshChanges::empty();
        self.keep_data_on_load = false;
        self.loaded = false;
        self.pending = PendingLoad::default();
        self.native = None;
    }
}

/// Shared handle to a mesh.
#[derive(Debug, Clone)]
pub struct Mesh {
    id: ResourceId,
    inner: Arc<RwLock<MeshData>>,
}

impl Mesh {
    pub fn new(data: MeshData) -> Self {
        Self {
            id: ResourceId::next(),
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Build a mesh from vertices, with the vertex slice marked changed.
    pub fn from_vertices(vertices: Vec<Vec3>) -> Self {
        let mut data = MeshData::new();
        data.set_vertices(vertices);
        Self::new(data)
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MeshData> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, MeshData> {
        self.inner.write()
    }

    pub fn ptr_eq(&self, other: &Mesh) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Return the data to a pool if this is the last handle.
    ///
    /// Other handles keep the mesh alive and it is simply dropped here.
    pub fn recycle(self, pool: &Pool<MeshData>) {
        if let Ok(lock) = Arc::try_unwrap(self.inner) {
            pool.release(lock.into_inner());
        }
    }
}
