//! Drawable objects, their fixed-function state and cameras

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::Mat4;

use super::{Mesh, Shader, Texture};
use crate::backend::{
    BlendEquations, BlendFunc, ColorWrites, CompareFunction, CullMode, StencilFace,
};

/// Blending configuration of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlendState {
    pub color: [f32; 4],
    pub func: BlendFunc,
    pub equations: BlendEquations,
}

/// Fixed-function state applied before a draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawState {
    pub color_writes: ColorWrites,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub stencil_test: bool,
    pub stencil_front: StencilFace,
    pub stencil_back: StencilFace,
    /// `None` disables blending.
    pub blend: Option<BlendState>,
    pub cull: CullMode,
}

impl Default for DrawState {
    fn default() -> Self {
        Self {
            color_writes: ColorWrites::ALL,
            depth_test: true,
            depth_write: true,
            depth_func: CompareFunction::Less,
            stencil_test: false,
            stencil_front: StencilFace::default(),
            stencil_back: StencilFace::default(),
            blend: None,
            cull: CullMode::Back,
        }
    }
}

/// Result slot of an object's occlusion query.
///
/// Written by the render thread when the query resolves, read by anyone.
#[derive(Debug)]
pub struct OcclusionResult {
    samples: AtomicU64,
}

impl OcclusionResult {
    const UNRESOLVED: u64 = u64::MAX;

    pub fn new() -> Self {
        Self {
            samples: AtomicU64::new(Self::UNRESOLVED),
        }
    }

    /// Samples that passed the depth test in the last resolved query.
    pub fn get(&self) -> Option<u64> {
        match self.samples.load(Ordering::Acquire) {
            Self::UNRESOLVED => None,
            samples => Some(samples),
        }
    }

    pub(crate) fn store(&self, samples: u64) {
        self.samples
            .store(samples.min(Self::UNRESOLVED - 1), Ordering::Release);
    }
}

impl Default for OcclusionResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to draw one thing.
#[derive(Debug, Clone)]
pub struct Object {
    pub shader: Option<Shader>,
    pub meshes: Vec<Mesh>,
    pub textures: Vec<Texture>,
    pub state: DrawState,
    pub transform: Mat4,
    /// Wrap draws in an occlusion query when the backend supports it.
    pub occlusion_test: bool,
    occlusion: Arc<OcclusionResult>,
}

impl Object {
    pub fn new(shader: Shader) -> Self {
        Self {
            shader: Some(shader),
            ..Default::default()
        }
    }

    pub fn with_mesh(mut self, mesh: Mesh) -> Self {
        self.meshes.push(mesh);
        self
    }

    pub fn with_texture(mut self, texture: Texture) -> Self {
        self.textures.push(texture);
        self
    }

    pub fn with_state(mut self, state: DrawState) -> Self {
        self.state = state;
        self
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_occlusion_test(mut self) -> Self {
        self.occlusion_test = true;
        self
    }

    /// Samples that passed in the last resolved occlusion query.
    pub fn samples_passed(&self) -> Option<u64> {
        self.occlusion.get()
    }

    pub(crate) fn occlusion_slot(&self) -> &Arc<OcclusionResult> {
        &self.occlusion
    }
}

impl Default for Object {
    fn default() -> Self {
        Self {
            shader: None,
            meshes: Vec::new(),
            textures: Vec::new(),
            state: DrawState::default(),
            transform: Mat4::IDENTITY,
            occlusion_test: false,
            occlusion: Arc::new(OcclusionResult::new()),
        }
    }
}

/// View and projection of a draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Camera {
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        Self { view, projection }
    }

    /// Right-handed perspective camera looking from `eye` at `target`.
    pub fn perspective(eye: glam::Vec3, target: glam::Vec3, fov_y: f32, aspect: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, glam::Vec3::Y),
            projection: Mat4::perspective_rh(fov_y, aspect, 0.1, 1000.0),
        }
    }

    /// Model-view-projection matrix for `model`.
    pub fn mvp(&self, model: Mat4) -> Mat4 {
        self.projection * self.view * model
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occlusion_result() {
        let slot = OcclusionResult::new();
        assert_eq!(slot.get(), None);
        slot.store(0);
        assert_eq!(slot.get(), Some(0));
        slot.store(128);
        assert_eq!(slot.get(), Some(128));
    }

    #[test]
    fn test_object_clone_shares_occlusion_slot() {
        let object = Object::default().with_occlusion_test();
        let copy = object.clone();
        object.occlusion_slot().store(7);
        assert_eq!(copy.samples_passed(), Some(7));
    }

    #[test]
    fn test_identity_camera_mvp() {
        let camera = Camera::default();
        let model = Mat4::from_translation(glam::Vec3::X);
        assert_eq!(camera.mvp(model), model);
    }
}
