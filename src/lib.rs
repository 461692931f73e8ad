//! # Lilium Render
//!
//! Command execution and GPU resource lifecycle for a scene renderer.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`Renderer`] - Cloneable handle for clearing, drawing, loading resources
//!   and rendering to textures from any thread
//! - [`RenderThread`] - The single thread that owns the native backend and
//!   executes queued commands frame by frame
//! - [`GraphicsStateCache`] - Mirror of bound pipeline state that elides
//!   redundant native calls
//! - [`DeferredFinalizer`] - Per-kind free lists for native handles released
//!   by dropped resources
//! - [`NativeBackend`] - Trait for native graphics API implementations, with
//!   a recording [`DummyBackend`] for tests and headless use
//!
//! ## Example
//!
//! ```
//! use lilium_render::backend::{DummyBackend, Rect};
//! use lilium_render::{RenderThread, RendererConfig};
//!
//! let (renderer, handle) =
//!     RenderThread::spawn(Box::new(DummyBackend::new()), RendererConfig::default()).unwrap();
//! renderer.clear(Rect::from_size(640, 480), [0.0, 0.0, 0.0, 1.0]).unwrap();
//! let stats = renderer.render().unwrap();
//! assert_eq!(stats.map(|s| s.frame), Some(1));
//! handle.shutdown();
//! ```

use std::time::Duration;

pub mod backend;
pub mod command;
pub mod error;
pub mod finalizer;
pub mod loader;
pub mod query;
pub mod renderer;
pub mod resources;
pub mod state;
pub mod target;
pub mod thread;

pub use backend::{BackendError, DeviceCapabilities, NativeBackend, Rect};
#[cfg(feature = "dummy")]
pub use backend::DummyBackend;
pub use command::{CommandQueue, RenderCommand, RenderContext};
pub use error::{RenderError, RenderResult};
pub use finalizer::DeferredFinalizer;
pub use query::{OcclusionQueryManager, QueryScope};
pub use renderer::{DrawOutcome, Renderer, SkipReason};
pub use resources::{
    Camera, DrawState, Mesh, MeshData, Object, ResourceId, Shader, ShaderData, Texture,
    TextureData,
};
pub use state::{GraphicsStateCache, PipelineState};
pub use target::{RenderTargetConfig, TargetId};
pub use thread::{FrameStats, RenderThread, RenderThreadHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the render subsystem.
///
/// Only logs the version; kept for symmetry with the other engine crates.
pub fn init() {
    log::info!("Lilium Render v{} initialized", VERSION);
}

/// Configuration of the render thread and its caller handles
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Capacity of each command lane; submission blocks when full
    pub queue_capacity: usize,
    /// Read back the context state before each frame and restore it after
    pub preserve_external_state: bool,
    /// Wait for main-canvas occlusion queries at the end of every frame
    pub wait_queries_on_render: bool,
    /// Sleep between polls while waiting on occlusion queries
    pub query_poll_interval: Duration,
    /// Skip native state calls that would not change anything
    pub elide_redundant_state: bool,
    /// Log driver errors reported during a frame
    pub log_driver_errors: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            preserve_external_state: false,
            wait_queries_on_render: true,
            query_poll_interval: Duration::from_micros(250),
            elide_redundant_state: true,
            log_driver_errors: true,
        }
    }
}

impl RendererConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Cooperate with another renderer sharing the same context.
    pub fn with_preserve_external_state(mut self, preserve: bool) -> Self {
        self.preserve_external_state = preserve;
        self
    }

    pub fn with_wait_queries_on_render(mut self, wait: bool) -> Self {
        self.wait_queries_on_render = wait;
        self
    }

    /// Values below [`query::MIN_POLL_INTERVAL`] are raised to it.
    pub fn with_query_poll_interval(mut self, interval: Duration) -> Self {
        self.query_poll_interval = interval.max(query::MIN_POLL_INTERVAL);
        self
    }

    /// Disable to issue every state call, for debugging the cache.
    pub fn with_elide_redundant_state(mut self, elide: bool) -> Self {
        self.elide_redundant_state = elide;
        self
    }

    pub fn with_log_driver_errors(mut self, log: bool) -> Self {
        self.log_driver_errors = log;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.queue_capacity, 1024);
        assert!(config.wait_queries_on_render);
        assert!(!config.preserve_external_state);
    }

    #[test]
    fn test_poll_interval_floor() {
        let config = RendererConfig::default().with_query_poll_interval(Duration::from_micros(10));
        assert_eq!(config.query_poll_interval, query::MIN_POLL_INTERVAL);
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend::new();
        assert!(backend.name() == "Dummy");
    }
}
