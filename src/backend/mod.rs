//! Backend abstraction layer
//!
//! Provides the native backend trait the engine drives and the types shared
//! with implementations.

pub mod traits;
pub mod types;

#[cfg(feature = "dummy")]
pub mod dummy;

pub use traits::*;
pub use types::*;

#[cfg(feature = "dummy")]
pub use dummy::{DummyBackend, NativeCall, Recorder};
