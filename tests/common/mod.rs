//! Common utilities for renderer integration tests.
//!
//! Every test drives a spawned render thread over a [`DummyBackend`] and
//! inspects what reached the backend through its shared recorder.

#![allow(dead_code)]

use std::sync::Arc;

use glam::{Vec3, Vec4};
use parking_lot::Mutex;

use lilium_render::backend::{DummyBackend, Recorder};
use lilium_render::{
    Camera, Mesh, MeshData, Object, RenderThread, RenderThreadHandle, Renderer, RendererConfig,
    Shader, ShaderData,
};

/// Vertex stage used by every test shader.
pub const VERTEX_SOURCE: &str = "attribute vec3 Vertex; uniform mat4 MVP; void main() {}";
/// Fragment stage used by every test shader.
pub const FRAGMENT_SOURCE: &str = "void main() { gl_FragColor = vec4(1.0); }";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A spawned render thread over a dummy backend.
pub struct TestContext {
    pub renderer: Renderer,
    pub recorder: Arc<Mutex<Recorder>>,
    handle: Option<RenderThreadHandle>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_backend(DummyBackend::new(), RendererConfig::default())
    }

    pub fn with_config(config: RendererConfig) -> Self {
        Self::with_backend(DummyBackend::new(), config)
    }

    pub fn with_backend(backend: DummyBackend, config: RendererConfig) -> Self {
        init_logger();
        let recorder = backend.recorder_handle();
        let (renderer, handle) =
            RenderThread::spawn(Box::new(backend), config).expect("spawn render thread");
        Self {
            renderer,
            recorder,
            handle: Some(handle),
        }
    }

    /// Run one frame on the main canvas.
    pub fn frame(&self) -> lilium_render::FrameStats {
        self.renderer
            .render()
            .expect("render")
            .expect("spawned render thread reports stats")
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.recorder.lock().count_calls(name)
    }

    /// Stop the render thread, flushing pending frees.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn triangle_vertices() -> Vec<Vec3> {
    vec![Vec3::ZERO, Vec3::X, Vec3::Y]
}

pub fn triangle_mesh() -> Mesh {
    let mut data = MeshData::new();
    data.set_vertices(triangle_vertices());
    data.set_colors(vec![Vec4::ONE; 3]);
    Mesh::new(data)
}

pub fn flat_shader(name: &str) -> Shader {
    Shader::new(ShaderData::new(name, VERTEX_SOURCE, FRAGMENT_SOURCE))
}

pub fn triangle_object() -> Object {
    Object::new(flat_shader("flat")).with_mesh(triangle_mesh())
}

pub fn camera() -> Camera {
    Camera::default()
}
