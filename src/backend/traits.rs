//! Native graphics backend abstraction
//!
//! The engine never talks to a graphics API directly. Everything it needs
//! from the driver goes through [`NativeBackend`], and only the render
//! thread ever holds the backend.

use crate::backend::types::*;
use crate::state::PipelineState;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to allocate {0} handle")]
    HandleAllocationFailed(&'static str),
    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Graphics context lost")]
    ContextLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw native identifier.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw native identifier.
            pub const fn raw(self) -> u64 {
                self.0
            }

            /// View a batch of handles as raw identifiers, for batched deletes.
            pub fn raw_slice(handles: &[Self]) -> &[u64] {
                bytemuck::cast_slice(handles)
            }
        }
    };
}

native_handle!(
    /// Handle to a native vertex or index buffer
    BufferHandle
);
native_handle!(
    /// Handle to a native texture object
    TextureHandle
);
native_handle!(
    /// Handle to an individual compiled shader stage
    ShaderHandle
);
native_handle!(
    /// Handle to a linked shader program
    ProgramHandle
);
native_handle!(
    /// Handle to a framebuffer object
    FramebufferHandle
);
native_handle!(
    /// Handle to a renderbuffer object
    RenderbufferHandle
);
native_handle!(
    /// Handle to an occlusion query object
    QueryHandle
);

/// A native handle tagged with the free list it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeHandle {
    Buffer(BufferHandle),
    Program(ProgramHandle),
    Texture(TextureHandle),
    Framebuffer(FramebufferHandle),
    Renderbuffer(RenderbufferHandle),
}

impl NativeHandle {
    pub fn kind(&self) -> ResourceKind {
        match self {
            NativeHandle::Buffer(_) => ResourceKind::Mesh,
            NativeHandle::Program(_) => ResourceKind::Shader,
            NativeHandle::Texture(_) => ResourceKind::Texture,
            NativeHandle::Framebuffer(_) => ResourceKind::Framebuffer,
            NativeHandle::Renderbuffer(_) => ResourceKind::Renderbuffer,
        }
    }
}

impl From<BufferHandle> for NativeHandle {
    fn from(handle: BufferHandle) -> Self {
        NativeHandle::Buffer(handle)
    }
}

impl From<ProgramHandle> for NativeHandle {
    fn from(handle: ProgramHandle) -> Self {
        NativeHandle::Program(handle)
    }
}

impl From<TextureHandle> for NativeHandle {
    fn from(handle: TextureHandle) -> Self {
        NativeHandle::Texture(handle)
    }
}

impl From<FramebufferHandle> for NativeHandle {
    fn from(handle: FramebufferHandle) -> Self {
        NativeHandle::Framebuffer(handle)
    }
}

impl From<RenderbufferHandle> for NativeHandle {
    fn from(handle: RenderbufferHandle) -> Self {
        NativeHandle::Renderbuffer(handle)
    }
}

/// The native graphics API as seen by the engine.
///
/// Implementations wrap a single graphics context. The engine guarantees
/// that every method is called from the render thread only, so
/// implementations only need to be `Send` (to be moved onto that thread).
pub trait NativeBackend: Send {
    /// Human readable backend name
    fn name(&self) -> &str;

    /// Capabilities of the underlying context
    fn capabilities(&self) -> DeviceCapabilities;

    // Buffers

    fn create_buffer(&mut self) -> BackendResult<BufferHandle>;

    /// Replace the contents of a buffer
    fn upload_buffer(&mut self, buffer: BufferHandle, target: BufferTarget, data: &[u8]);

    fn delete_buffers(&mut self, buffers: &[BufferHandle]);

    // Textures

    fn create_texture(&mut self) -> BackendResult<TextureHandle>;

    /// Allocate texture storage, optionally filling it with tightly packed pixels
    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        storage: &TextureStorage,
        pixels: Option<&[u8]>,
    );

    fn set_sampler_params(&mut self, texture: TextureHandle, params: &SamplerParams);

    fn generate_mipmaps(&mut self, texture: TextureHandle);

    fn delete_textures(&mut self, textures: &[TextureHandle]);

    // Shaders

    /// Compile one shader stage, returning the compiler log on failure
    fn compile_shader(&mut self, stage: ShaderStage, source: &[u8]) -> Result<ShaderHandle, String>;

    /// Link a program from two compiled stages, returning the linker log on failure
    fn link_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> Result<ProgramHandle, String>;

    fn delete_shader(&mut self, shader: ShaderHandle);

    fn delete_programs(&mut self, programs: &[ProgramHandle]);

    // Framebuffers

    fn create_framebuffer(&mut self) -> BackendResult<FramebufferHandle>;

    fn create_renderbuffer(&mut self, storage: &TextureStorage)
        -> BackendResult<RenderbufferHandle>;

    fn attach_texture(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: Attachment,
        texture: TextureHandle,
    );

    fn attach_renderbuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: Attachment,
        renderbuffer: RenderbufferHandle,
    );

    /// Enable or disable the color draw buffer of a framebuffer
    fn set_draw_buffers(&mut self, framebuffer: FramebufferHandle, color: bool);

    fn framebuffer_status(&mut self, framebuffer: FramebufferHandle) -> FramebufferStatus;

    fn delete_framebuffers(&mut self, framebuffers: &[FramebufferHandle]);

    fn delete_renderbuffers(&mut self, renderbuffers: &[RenderbufferHandle]);

    // Pipeline state

    /// Bind a framebuffer, `None` selects the default one
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>);

    fn set_feature(&mut self, feature: Feature, enabled: bool);

    fn viewport(&mut self, rect: Rect);

    fn scissor(&mut self, rect: Rect);

    fn blend_color(&mut self, color: [f32; 4]);

    fn blend_func(&mut self, src: BlendFactor, dst: BlendFactor);

    fn blend_func_separate(&mut self, func: BlendFunc);

    fn blend_equation(&mut self, equation: BlendEquation);

    fn blend_equation_separate(&mut self, equations: BlendEquations);

    fn depth_func(&mut self, func: CompareFunction);

    fn depth_mask(&mut self, write: bool);

    fn color_mask(&mut self, mask: ColorWrites);

    fn stencil_func(&mut self, face: Face, test: StencilTest);

    fn stencil_op(&mut self, face: Face, ops: StencilOps);

    fn stencil_mask(&mut self, face: Face, mask: u32);

    fn cull_face(&mut self, face: Face);

    fn use_program(&mut self, program: Option<ProgramHandle>);

    fn clear_color(&mut self, color: [f32; 4]);

    fn clear_depth(&mut self, depth: f32);

    fn clear_stencil(&mut self, stencil: i32);

    // Drawing

    fn clear(&mut self, buffers: ClearBuffers);

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>);

    fn set_uniform(&mut self, program: ProgramHandle, name: &str, value: UniformValue);

    /// Bind a vertex buffer to a named program attribute
    fn bind_attribute(
        &mut self,
        program: ProgramHandle,
        name: &str,
        buffer: BufferHandle,
        components: u32,
    );

    /// Draw `count` vertices, indexed when an index buffer is given
    fn draw(&mut self, index_buffer: Option<BufferHandle>, count: u32);

    // Occlusion queries

    fn create_query(&mut self) -> BackendResult<QueryHandle>;

    fn begin_query(&mut self, query: QueryHandle);

    fn end_query(&mut self, query: QueryHandle);

    /// Non-blocking availability check
    fn query_result_available(&mut self, query: QueryHandle) -> bool;

    /// Number of samples that passed, only valid once available
    fn query_result(&mut self, query: QueryHandle) -> u64;

    fn delete_queries(&mut self, queries: &[QueryHandle]);

    // Frame

    /// Flush all issued commands to the device
    fn flush(&mut self);

    /// Read back the currently bound pipeline state from the context
    fn read_state(&mut self) -> PipelineState;

    /// Drain errors reported by the driver since the last call
    fn take_errors(&mut self) -> Vec<NativeError>;
}
