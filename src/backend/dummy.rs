//! Dummy native backend for testing and headless use.
//!
//! This backend doesn't talk to a GPU. It hands out handles, records every
//! native call and mirrors the state those calls would bind, so tests can
//! check what the engine actually submitted. Shader failures, framebuffer
//! completeness results and query latency can be scripted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::traits::*;
use super::types::*;
use crate::state::PipelineState;

/// A single recorded native call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCall {
    pub name: &'static str,
    pub args: String,
}

#[derive(Debug, Clone, Copy)]
struct QueryState {
    samples: u64,
    polls_remaining: u32,
    ended: bool,
}

/// Everything the dummy backend observed, shared with the test that created it.
#[derive(Debug)]
pub struct Recorder {
    calls: Vec<NativeCall>,
    bound: PipelineState,
    next_handle: u64,
    live: HashMap<ResourceKind, HashSet<u64>>,
    deleted: HashMap<ResourceKind, Vec<u64>>,
    live_queries: HashSet<u64>,
    queries: HashMap<u64, QueryState>,
    active_query: Option<u64>,
    attachments: HashMap<u64, Vec<(Attachment, u64)>>,
    buffer_uploads: Vec<(BufferHandle, BufferTarget, usize)>,
    texture_uploads: Vec<(TextureHandle, TextureStorage, bool)>,
    pending_errors: Vec<NativeError>,
    flushes: u64,
    // Scripted behaviour
    compile_error_marker: Option<String>,
    fail_link: bool,
    framebuffer_status: FramebufferStatus,
    query_latency: u32,
}

impl Recorder {
    fn new() -> Self {
        Self {
            calls: Vec::new(),
            bound: PipelineState::default(),
            next_handle: 1,
            live: HashMap::new(),
            deleted: HashMap::new(),
            live_queries: HashSet::new(),
            queries: HashMap::new(),
            active_query: None,
            attachments: HashMap::new(),
            buffer_uploads: Vec::new(),
            texture_uploads: Vec::new(),
            pending_errors: Vec::new(),
            flushes: 0,
            compile_error_marker: None,
            fail_link: false,
            framebuffer_status: FramebufferStatus::Complete,
            query_latency: 0,
        }
    }

    fn record(&mut self, name: &'static str, args: String) {
        log::trace!("DummyBackend: {} {}", name, args);
        self.calls.push(NativeCall { name, args });
    }

    fn allocate(&mut self, kind: ResourceKind) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        self.live.entry(kind).or_default().insert(raw);
        raw
    }

    fn release_all(&mut self, call: &'static str, kind: ResourceKind, raws: &[u64]) {
        self.record(call, format!("{raws:?}"));
        for raw in raws {
            self.release(kind, *raw);
        }
    }

    fn release(&mut self, kind: ResourceKind, raw: u64) {
        let was_live = self.live.entry(kind).or_default().remove(&raw);
        if !was_live {
            self.pending_errors.push(NativeError {
                code: 0x0501,
                message: format!("delete of unknown {:?} handle {}", kind, raw),
            });
        }
        self.deleted.entry(kind).or_default().push(raw);
    }

    /// All calls recorded so far, in submission order.
    pub fn calls(&self) -> &[NativeCall] {
        &self.calls
    }

    /// Number of recorded calls with the given name.
    pub fn count_calls(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| c.name == name).count()
    }

    /// Forget recorded calls, keeping handles and state.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Pipeline state as bound by the recorded calls.
    pub fn bound(&self) -> &PipelineState {
        &self.bound
    }

    /// Handles of `kind` that were created and not yet deleted.
    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.live.get(&kind).map_or(0, |set| set.len())
    }

    /// Handles of `kind` deleted so far, in deletion order.
    pub fn deleted(&self, kind: ResourceKind) -> &[u64] {
        self.deleted.get(&kind).map_or(&[], |v| v.as_slice())
    }

    pub fn live_queries(&self) -> usize {
        self.live_queries.len()
    }

    /// Attachments of a framebuffer as `(attachment, raw handle)`.
    pub fn attachments(&self, framebuffer: FramebufferHandle) -> &[(Attachment, u64)] {
        self.attachments
            .get(&framebuffer.raw())
            .map_or(&[], |v| v.as_slice())
    }

    pub fn buffer_uploads(&self) -> &[(BufferHandle, BufferTarget, usize)] {
        &self.buffer_uploads
    }

    /// Texture uploads as `(texture, storage, had pixel data)`.
    pub fn texture_uploads(&self) -> &[(TextureHandle, TextureStorage, bool)] {
        &self.texture_uploads
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Queue a driver error to be reported by the next `take_errors`.
    pub fn inject_error(&mut self, code: u32, message: &str) {
        self.pending_errors.push(NativeError {
            code,
            message: message.to_string(),
        });
    }

    /// Overwrite the bound state, as an external renderer sharing the context would.
    pub fn set_external_state(&mut self, state: PipelineState) {
        self.bound = state;
    }
}

/// Dummy native backend.
#[derive(Debug)]
pub struct DummyBackend {
    capabilities: DeviceCapabilities,
    recorder: Arc<Mutex<Recorder>>,
}

impl DummyBackend {
    /// Create a dummy backend with default capabilities.
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities {
            vendor: String::from("RedLilium"),
            renderer: String::from("Dummy Backend"),
            ..Default::default()
        })
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            recorder: Arc::new(Mutex::new(Recorder::new())),
        }
    }

    /// Fail compilation of every stage whose source contains `marker`.
    pub fn with_compile_error_marker(self, marker: &str) -> Self {
        self.recorder.lock().compile_error_marker = Some(marker.to_string());
        self
    }

    /// Fail every program link.
    pub fn with_link_failure(self) -> Self {
        self.recorder.lock().fail_link = true;
        self
    }

    /// Status reported by every framebuffer completeness check.
    pub fn with_framebuffer_status(self, status: FramebufferStatus) -> Self {
        self.recorder.lock().framebuffer_status = status;
        self
    }

    /// Number of availability polls before a query result becomes ready.
    pub fn with_query_latency(self, polls: u32) -> Self {
        self.recorder.lock().query_latency = polls;
        self
    }

    /// Lock the recorder.
    pub fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock()
    }

    /// Shared recorder handle that stays valid after the backend is moved away.
    pub fn recorder_handle(&self) -> Arc<Mutex<Recorder>> {
        Arc::clone(&self.recorder)
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn face_apply<T: Copy>(front: &mut T, back: &mut T, face: Face, value: T) {
    match face {
        Face::Front => *front = value,
        Face::Back => *back = value,
        Face::FrontAndBack => {
            *front = value;
            *back = value;
        }
    }
}

impl NativeBackend for DummyBackend {
    fn name(&self) -> &str {
        "Dummy"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn create_buffer(&mut self) -> BackendResult<BufferHandle> {
        let mut rec = self.recorder.lock();
        let raw = rec.allocate(ResourceKind::Mesh);
        rec.record("create_buffer", format!("{raw}"));
        Ok(BufferHandle::from_raw(raw))
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, target: BufferTarget, data: &[u8]) {
        let mut rec = self.recorder.lock();
        rec.record(
            "upload_buffer",
            format!("{} {:?} len={}", buffer.raw(), target, data.len()),
        );
        rec.buffer_uploads.push((buffer, target, data.len()));
    }

    fn delete_buffers(&mut self, buffers: &[BufferHandle]) {
        let mut rec = self.recorder.lock();
        rec.release_all("delete_buffers", ResourceKind::Mesh, BufferHandle::raw_slice(buffers));
    }

    fn create_texture(&mut self) -> BackendResult<TextureHandle> {
        let mut rec = self.recorder.lock();
        let raw = rec.allocate(ResourceKind::Texture);
        rec.record("create_texture", format!("{raw}"));
        Ok(TextureHandle::from_raw(raw))
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        storage: &TextureStorage,
        pixels: Option<&[u8]>,
    ) {
        let mut rec = self.recorder.lock();
        rec.record(
            "upload_texture",
            format!(
                "{} {}x{} {:?} pixels={}",
                texture.raw(),
                storage.width,
                storage.height,
                storage.format,
                pixels.map_or(0, |p| p.len())
            ),
        );
        rec.texture_uploads.push((texture, *storage, pixels.is_some()));
    }

    fn set_sampler_params(&mut self, texture: TextureHandle, params: &SamplerParams) {
        self.recorder
            .lock()
            .record("set_sampler_params", format!("{} {:?}", texture.raw(), params));
    }

    fn generate_mipmaps(&mut self, texture: TextureHandle) {
        self.recorder
            .lock()
            .record("generate_mipmaps", format!("{}", texture.raw()));
    }

    fn delete_textures(&mut self, textures: &[TextureHandle]) {
        let mut rec = self.recorder.lock();
        rec.release_all("delete_textures", ResourceKind::Texture, TextureHandle::raw_slice(textures));
    }

    fn compile_shader(&mut self, stage: ShaderStage, source: &[u8]) -> Result<ShaderHandle, String> {
        let mut rec = self.recorder.lock();
        rec.record("compile_shader", format!("{:?} len={}", stage, source.len()));
        let failed = rec.compile_error_marker.as_ref().is_some_and(|marker| {
            String::from_utf8_lossy(source).contains(marker.as_str())
        });
        if failed {
            return Err(format!("0:1: {:?} stage: syntax error", stage));
        }
        // Intermediate stages are not tracked in any free list.
        let raw = rec.next_handle;
        rec.next_handle += 1;
        Ok(ShaderHandle::from_raw(raw))
    }

    fn link_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> Result<ProgramHandle, String> {
        let mut rec = self.recorder.lock();
        rec.record(
            "link_program",
            format!("{} {}", vertex.raw(), fragment.raw()),
        );
        if rec.fail_link {
            return Err(String::from("error: unresolved varying"));
        }
        let raw = rec.allocate(ResourceKind::Shader);
        Ok(ProgramHandle::from_raw(raw))
    }

    fn delete_shader(&mut self, shader: ShaderHandle) {
        self.recorder
            .lock()
            .record("delete_shader", format!("{}", shader.raw()));
    }

    fn delete_programs(&mut self, programs: &[ProgramHandle]) {
        let mut rec = self.recorder.lock();
        rec.release_all("delete_programs", ResourceKind::Shader, ProgramHandle::raw_slice(programs));
    }

    fn create_framebuffer(&mut self) -> BackendResult<FramebufferHandle> {
        let mut rec = self.recorder.lock();
        let raw = rec.allocate(ResourceKind::Framebuffer);
        rec.record("create_framebuffer", format!("{raw}"));
        Ok(FramebufferHandle::from_raw(raw))
    }

    fn create_renderbuffer(
        &mut self,
        storage: &TextureStorage,
    ) -> BackendResult<RenderbufferHandle> {
        let mut rec = self.recorder.lock();
        let raw = rec.allocate(ResourceKind::Renderbuffer);
        rec.record(
            "create_renderbuffer",
            format!("{} {:?} samples={}", raw, storage.format, storage.samples),
        );
        Ok(RenderbufferHandle::from_raw(raw))
    }

    fn attach_texture(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: Attachment,
        texture: TextureHandle,
    ) {
        let mut rec = self.recorder.lock();
        rec.record(
            "attach_texture",
            format!("{} {:?} {}", framebuffer.raw(), attachment, texture.raw()),
        );
        rec.attachments
            .entry(framebuffer.raw())
            .or_default()
            .push((attachment, texture.raw()));
    }

    fn attach_renderbuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: Attachment,
        renderbuffer: RenderbufferHandle,
    ) {
        let mut rec = self.recorder.lock();
        rec.record(
            "attach_renderbuffer",
            format!("{} {:?} {}", framebuffer.raw(), attachment, renderbuffer.raw()),
        );
        rec.attachments
            .entry(framebuffer.raw())
            .or_default()
            .push((attachment, renderbuffer.raw()));
    }

    fn set_draw_buffers(&mut self, framebuffer: FramebufferHandle, color: bool) {
        self.recorder
            .lock()
            .record("set_draw_buffers", format!("{} color={}", framebuffer.raw(), color));
    }

    fn framebuffer_status(&mut self, framebuffer: FramebufferHandle) -> FramebufferStatus {
        let mut rec = self.recorder.lock();
        rec.record("framebuffer_status", format!("{}", framebuffer.raw()));
        rec.framebuffer_status
    }

    fn delete_framebuffers(&mut self, framebuffers: &[FramebufferHandle]) {
        let mut rec = self.recorder.lock();
        rec.release_all("delete_framebuffers", ResourceKind::Framebuffer, FramebufferHandle::raw_slice(framebuffers));
    }

    fn delete_renderbuffers(&mut self, renderbuffers: &[RenderbufferHandle]) {
        let mut rec = self.recorder.lock();
        rec.release_all("delete_renderbuffers", ResourceKind::Renderbuffer, RenderbufferHandle::raw_slice(renderbuffers));
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        let mut rec = self.recorder.lock();
        rec.record("bind_framebuffer", format!("{framebuffer:?}"));
        rec.bound.framebuffer = framebuffer;
    }

    fn set_feature(&mut self, feature: Feature, enabled: bool) {
        let mut rec = self.recorder.lock();
        rec.record("set_feature", format!("{feature:?} {enabled}"));
        let bound = &mut rec.bound;
        match feature {
            Feature::Blend => bound.blend = enabled,
            Feature::DepthTest => bound.depth_test = enabled,
            Feature::StencilTest => bound.stencil_test = enabled,
            Feature::CullFace => bound.cull = enabled,
            Feature::ScissorTest => bound.scissor_test = enabled,
        }
    }

    fn viewport(&mut self, rect: Rect) {
        let mut rec = self.recorder.lock();
        rec.record("viewport", format!("{rect:?}"));
        rec.bound.viewport = rect;
    }

    fn scissor(&mut self, rect: Rect) {
        let mut rec = self.recorder.lock();
        rec.record("scissor", format!("{rect:?}"));
        rec.bound.scissor = rect;
    }

    fn blend_color(&mut self, color: [f32; 4]) {
        let mut rec = self.recorder.lock();
        rec.record("blend_color", format!("{color:?}"));
        rec.bound.blend_color = color;
    }

    fn blend_func(&mut self, src: BlendFactor, dst: BlendFactor) {
        let mut rec = self.recorder.lock();
        rec.record("blend_func", format!("{src:?} {dst:?}"));
        rec.bound.blend_func = BlendFunc::uniform(src, dst);
    }

    fn blend_func_separate(&mut self, func: BlendFunc) {
        let mut rec = self.recorder.lock();
        rec.record("blend_func_separate", format!("{func:?}"));
        rec.bound.blend_func = func;
    }

    fn blend_equation(&mut self, equation: BlendEquation) {
        let mut rec = self.recorder.lock();
        rec.record("blend_equation", format!("{equation:?}"));
        rec.bound.blend_equations = BlendEquations::uniform(equation);
    }

    fn blend_equation_separate(&mut self, equations: BlendEquations) {
        let mut rec = self.recorder.lock();
        rec.record("blend_equation_separate", format!("{equations:?}"));
        rec.bound.blend_equations = equations;
    }

    fn depth_func(&mut self, func: CompareFunction) {
        let mut rec = self.recorder.lock();
        rec.record("depth_func", format!("{func:?}"));
        rec.bound.depth_func = func;
    }

    fn depth_mask(&mut self, write: bool) {
        let mut rec = self.recorder.lock();
        rec.record("depth_mask", format!("{write}"));
        rec.bound.depth_write = write;
    }

    fn color_mask(&mut self, mask: ColorWrites) {
        let mut rec = self.recorder.lock();
        rec.record("color_mask", format!("{mask:?}"));
        rec.bound.color_writes = mask;
    }

    fn stencil_func(&mut self, face: Face, test: StencilTest) {
        let mut rec = self.recorder.lock();
        rec.record("stencil_func", format!("{face:?} {test:?}"));
        let bound = &mut rec.bound;
        face_apply(
            &mut bound.stencil_front.test,
            &mut bound.stencil_back.test,
            face,
            test,
        );
    }

    fn stencil_op(&mut self, face: Face, ops: StencilOps) {
        let mut rec = self.recorder.lock();
        rec.record("stencil_op", format!("{face:?} {ops:?}"));
        let bound = &mut rec.bound;
        face_apply(
            &mut bound.stencil_front.ops,
            &mut bound.stencil_back.ops,
            face,
            ops,
        );
    }

    fn stencil_mask(&mut self, face: Face, mask: u32) {
        let mut rec = self.recorder.lock();
        rec.record("stencil_mask", format!("{face:?} {mask:#x}"));
        let bound = &mut rec.bound;
        face_apply(
            &mut bound.stencil_front.write_mask,
            &mut bound.stencil_back.write_mask,
            face,
            mask,
        );
    }

    fn cull_face(&mut self, face: Face) {
        let mut rec = self.recorder.lock();
        rec.record("cull_face", format!("{face:?}"));
        rec.bound.cull_face = face;
    }

    fn use_program(&mut self, program: Option<ProgramHandle>) {
        let mut rec = self.recorder.lock();
        rec.record("use_program", format!("{program:?}"));
        rec.bound.program = program;
    }

    fn clear_color(&mut self, color: [f32; 4]) {
        let mut rec = self.recorder.lock();
        rec.record("clear_color", format!("{color:?}"));
        rec.bound.clear_color = color;
    }

    fn clear_depth(&mut self, depth: f32) {
        let mut rec = self.recorder.lock();
        rec.record("clear_depth", format!("{depth}"));
        rec.bound.clear_depth = depth;
    }

    fn clear_stencil(&mut self, stencil: i32) {
        let mut rec = self.recorder.lock();
        rec.record("clear_stencil", format!("{stencil}"));
        rec.bound.clear_stencil = stencil;
    }

    fn clear(&mut self, buffers: ClearBuffers) {
        self.recorder.lock().record("clear", format!("{buffers:?}"));
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        self.recorder
            .lock()
            .record("bind_texture", format!("{unit} {texture:?}"));
    }

    fn set_uniform(&mut self, program: ProgramHandle, name: &str, value: UniformValue) {
        self.recorder
            .lock()
            .record("set_uniform", format!("{} {} {:?}", program.raw(), name, value));
    }

    fn bind_attribute(
        &mut self,
        program: ProgramHandle,
        name: &str,
        buffer: BufferHandle,
        components: u32,
    ) {
        self.recorder.lock().record(
            "bind_attribute",
            format!("{} {} {} x{}", program.raw(), name, buffer.raw(), components),
        );
    }

    fn draw(&mut self, index_buffer: Option<BufferHandle>, count: u32) {
        let mut rec = self.recorder.lock();
        rec.record("draw", format!("{index_buffer:?} count={count}"));
        if let Some(active) = rec.active_query {
            if let Some(query) = rec.queries.get_mut(&active) {
                query.samples += u64::from(count);
            }
        }
    }

    fn create_query(&mut self) -> BackendResult<QueryHandle> {
        let mut rec = self.recorder.lock();
        let raw = rec.next_handle;
        rec.next_handle += 1;
        rec.live_queries.insert(raw);
        rec.record("create_query", format!("{raw}"));
        Ok(QueryHandle::from_raw(raw))
    }

    fn begin_query(&mut self, query: QueryHandle) {
        let mut rec = self.recorder.lock();
        rec.record("begin_query", format!("{}", query.raw()));
        let latency = rec.query_latency;
        rec.queries.insert(
            query.raw(),
            QueryState {
                samples: 0,
                polls_remaining: latency,
                ended: false,
            },
        );
        rec.active_query = Some(query.raw());
    }

    fn end_query(&mut self, query: QueryHandle) {
        let mut rec = self.recorder.lock();
        rec.record("end_query", format!("{}", query.raw()));
        if let Some(state) = rec.queries.get_mut(&query.raw()) {
            state.ended = true;
        }
        rec.active_query = None;
    }

    fn query_result_available(&mut self, query: QueryHandle) -> bool {
        let mut rec = self.recorder.lock();
        rec.record("query_result_available", format!("{}", query.raw()));
        match rec.queries.get_mut(&query.raw()) {
            Some(state) if state.ended => {
                if state.polls_remaining == 0 {
                    true
                } else {
                    state.polls_remaining -= 1;
                    false
                }
            }
            _ => false,
        }
    }

    fn query_result(&mut self, query: QueryHandle) -> u64 {
        let mut rec = self.recorder.lock();
        rec.record("query_result", format!("{}", query.raw()));
        rec.queries.get(&query.raw()).map_or(0, |s| s.samples)
    }

    fn delete_queries(&mut self, queries: &[QueryHandle]) {
        let mut rec = self.recorder.lock();
        rec.record("delete_queries", format!("{queries:?}"));
        for query in queries {
            rec.live_queries.remove(&query.raw());
            rec.queries.remove(&query.raw());
        }
    }

    fn flush(&mut self) {
        let mut rec = self.recorder.lock();
        rec.record("flush", String::new());
        rec.flushes += 1;
    }

    fn read_state(&mut self) -> PipelineState {
        let mut rec = self.recorder.lock();
        rec.record("read_state", String::new());
        rec.bound
    }

    fn take_errors(&mut self) -> Vec<NativeError> {
        std::mem::take(&mut self.recorder.lock().pending_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_backend_name() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy");
        assert_eq!(backend.capabilities().renderer, "Dummy Backend");
    }

    #[test]
    fn test_handles_are_tracked() {
        let mut backend = DummyBackend::new();
        let a = backend.create_buffer().unwrap();
        let b = backend.create_buffer().unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.recorder().live_count(ResourceKind::Mesh), 2);

        backend.delete_buffers(&[a]);
        assert_eq!(backend.recorder().live_count(ResourceKind::Mesh), 1);
        assert_eq!(backend.recorder().deleted(ResourceKind::Mesh), &[a.raw()]);
    }

    #[test]
    fn test_double_delete_reports_error() {
        let mut backend = DummyBackend::new();
        let texture = backend.create_texture().unwrap();
        backend.delete_textures(&[texture]);
        backend.delete_textures(&[texture]);

        let errors = backend.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(backend.take_errors().is_empty());
    }

    #[test]
    fn test_scripted_compile_failure() {
        let mut backend = DummyBackend::new().with_compile_error_marker("#error");
        assert!(backend
            .compile_shader(ShaderStage::Vertex, b"void main() {}")
            .is_ok());
        assert!(backend
            .compile_shader(ShaderStage::Fragment, b"#error broken")
            .is_err());
    }

    #[test]
    fn test_query_latency() {
        let mut backend = DummyBackend::new().with_query_latency(2);
        let query = backend.create_query().unwrap();
        backend.begin_query(query);
        backend.draw(None, 3);
        backend.end_query(query);

        assert!(!backend.query_result_available(query));
        assert!(!backend.query_result_available(query));
        assert!(backend.query_result_available(query));
        assert_eq!(backend.query_result(query), 3);
    }
}
