//! Caller-side renderer handle.
//!
//! A [`Renderer`] is a cheap, cloneable handle to the render thread. It
//! either draws to the main canvas or, when returned from
//! [`Renderer::render_to_texture`], to a render target. All methods can be
//! called from any thread; they validate on the caller side and enqueue
//! commands for the render thread.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::backend::{ClearBuffers, ColorWrites, DeviceCapabilities, Feature, Rect, UniformValue};
use crate::command::{CommandQueue, RenderCommand, RenderContext};
use crate::error::{RenderError, RenderResult};
use crate::finalizer::DeferredFinalizer;
use crate::loader;
use crate::query::QueryScope;
use crate::resources::{
    Camera, DrawState, Mesh, Object, OcclusionResult, ResourcePools, Shader, Texture,
};
use crate::target::{self, FramebufferOwner, RenderTargetConfig, TargetBinding, TargetId, TargetState};
use crate::thread::{Control, FrameStats};
use crate::RendererConfig;

/// Why a draw was not submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyRect,
    NoShader,
    ShaderError,
    NoMeshes,
    /// A mesh that was never loaded has no vertices.
    EmptyMesh,
    /// Every destination texture of the target has been dropped.
    TargetReleased,
}

/// Result of [`Renderer::draw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Submitted,
    Skipped(SkipReason),
}

#[derive(Debug)]
struct Shared {
    uploads: CommandQueue,
    frames: CommandQueue,
    control: Option<Sender<Control>>,
    finalizer: Arc<DeferredFinalizer>,
    capabilities: DeviceCapabilities,
    config: RendererConfig,
    pools: ResourcePools,
}

/// Handle to a canvas rendered by the render thread.
#[derive(Debug, Clone)]
pub struct Renderer {
    shared: Arc<Shared>,
    target: Option<Arc<TargetState>>,
}

impl Renderer {
    pub(crate) fn new(
        uploads: CommandQueue,
        frames: CommandQueue,
        control: Option<Sender<Control>>,
        finalizer: Arc<DeferredFinalizer>,
        capabilities: DeviceCapabilities,
        config: RendererConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                uploads,
                frames,
                control,
                finalizer,
                capabilities,
                config,
                pools: ResourcePools::default(),
            }),
            target: None,
        }
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.shared.capabilities
    }

    pub fn config(&self) -> &RendererConfig {
        &self.shared.config
    }

    /// Pools for recycling resource data.
    pub fn pools(&self) -> &ResourcePools {
        &self.shared.pools
    }

    /// Native handles waiting for deletion at the next frame.
    pub fn pending_frees(&self) -> usize {
        self.shared.finalizer.pending_count()
    }

    /// The render target this canvas draws to, `None` for the main canvas.
    pub fn target_id(&self) -> Option<TargetId> {
        self.target.as_ref().map(|t| t.id)
    }

    /// Size of the render target.
    pub fn target_size(&self) -> Option<(u32, u32)> {
        self.target.as_ref().map(|t| (t.width, t.height))
    }

    /// Whether the target's framebuffer still exists.
    ///
    /// Always true for the main canvas.
    pub fn is_alive(&self) -> bool {
        self.target
            .as_ref()
            .map_or(true, |t| t.binding.upgrade().is_some())
    }

    /// Append a command to the frame lane.
    pub fn submit(&self, command: RenderCommand) -> RenderResult<()> {
        self.shared.frames.submit(command)
    }

    /// Append a command to the upload lane.
    pub fn submit_upload(&self, command: RenderCommand) -> RenderResult<()> {
        self.shared.uploads.submit(command)
    }

    // Loading

    pub fn load_mesh(&self, mesh: &Mesh, done: Option<Sender<()>>) -> RenderResult<()> {
        loader::load_mesh(&self.shared.uploads, mesh, done)
    }

    pub fn load_texture(&self, texture: &Texture, done: Option<Sender<()>>) -> RenderResult<()> {
        loader::load_texture(&self.shared.uploads, texture, done)
    }

    pub fn load_shader(&self, shader: &Shader, done: Option<Sender<()>>) -> RenderResult<()> {
        loader::load_shader(&self.shared.uploads, shader, done)
    }

    // Clearing

    /// Clear the color buffer inside `rect`.
    pub fn clear(&self, rect: Rect, color: [f32; 4]) -> RenderResult<()> {
        self.submit_clear(rect, "clear", ClearBuffers::COLOR, move |ctx| {
            ctx.state
                .set_color_writes(ctx.backend.as_mut(), ColorWrites::ALL);
            ctx.state.set_clear_color(ctx.backend.as_mut(), color);
        })
    }

    /// Clear the depth buffer inside `rect`.
    pub fn clear_depth(&self, rect: Rect, depth: f32) -> RenderResult<()> {
        self.submit_clear(rect, "clear_depth", ClearBuffers::DEPTH, move |ctx| {
            ctx.state.set_depth_write(ctx.backend.as_mut(), true);
            ctx.state.set_clear_depth(ctx.backend.as_mut(), depth);
        })
    }

    /// Clear the stencil buffer inside `rect`.
    pub fn clear_stencil(&self, rect: Rect, stencil: i32) -> RenderResult<()> {
        self.submit_clear(rect, "clear_stencil", ClearBuffers::STENCIL, move |ctx| {
            let bound = ctx.state.bound();
            let mut front = bound.stencil_front;
            let mut back = bound.stencil_back;
            front.write_mask = u32::MAX;
            back.write_mask = u32::MAX;
            ctx.state.set_stencil(ctx.backend.as_mut(), front, back);
            ctx.state.set_clear_stencil(ctx.backend.as_mut(), stencil);
        })
    }

    fn submit_clear(
        &self,
        rect: Rect,
        label: &'static str,
        buffers: ClearBuffers,
        prepare: impl FnOnce(&mut RenderContext) + Send + 'static,
    ) -> RenderResult<()> {
        if rect.is_empty() {
            return Ok(());
        }
        let owner = match self.target_owner() {
            Ok(owner) => owner,
            Err(reason) => {
                log::warn!("{} skipped: {:?}", label, reason);
                return Ok(());
            }
        };
        self.shared.frames.submit(RenderCommand::new(label, move |ctx| {
            let framebuffer = owner.as_ref().map(|o| o.framebuffer);
            ctx.state.bind_framebuffer(ctx.backend.as_mut(), framebuffer);
            ctx.state.set_scissor(ctx.backend.as_mut(), Some(rect));
            prepare(ctx);
            ctx.backend.clear(buffers);
        }))
    }

    // Drawing

    /// Draw an object inside `rect`.
    ///
    /// The shader, meshes and textures are loaded first and this call
    /// blocks until those uploads complete. Objects that cannot be drawn
    /// are skipped with a warning. Drawing a texture this canvas renders
    /// into is an error.
    pub fn draw(&self, rect: Rect, object: &Object, camera: &Camera) -> RenderResult<DrawOutcome> {
        if let Some(target) = &self.target {
            if let Some(texture) = object.textures.iter().find(|t| target.writes_to(t.id())) {
                return Err(RenderError::FeedbackLoop(texture.id().raw()));
            }
        }
        if rect.is_empty() {
            return Ok(DrawOutcome::Skipped(SkipReason::EmptyRect));
        }
        let Some(shader) = &object.shader else {
            return Ok(skip(SkipReason::NoShader));
        };
        if shader.read().has_error() {
            return Ok(skip(SkipReason::ShaderError));
        }
        if object.meshes.is_empty() {
            return Ok(skip(SkipReason::NoMeshes));
        }
        let empty_mesh = object.meshes.iter().any(|mesh| {
            let data = mesh.read();
            !data.is_loaded() && data.vertices.is_empty()
        });
        if empty_mesh {
            return Ok(skip(SkipReason::EmptyMesh));
        }
        let owner = match self.target_owner() {
            Ok(owner) => owner,
            Err(reason) => return Ok(skip(reason)),
        };

        self.load_and_wait(shader, object)?;
        if shader.read().has_error() {
            return Ok(skip(SkipReason::ShaderError));
        }

        let call = DrawCall {
            rect,
            shader: shader.clone(),
            meshes: object.meshes.clone(),
            textures: object.textures.clone(),
            state: object.state,
            model: object.transform,
            camera: *camera,
            occlusion: object
                .occlusion_test
                .then(|| Arc::clone(object.occlusion_slot())),
            target: owner,
        };
        self.shared
            .frames
            .submit(RenderCommand::new("draw", move |ctx| call.execute(ctx)))?;
        Ok(DrawOutcome::Submitted)
    }

    fn load_and_wait(&self, shader: &Shader, object: &Object) -> RenderResult<()> {
        let count = 1 + object.meshes.len() + object.textures.len();
        let (done, loaded) = crossbeam_channel::bounded(count);

        self.load_shader(shader, Some(done.clone()))?;
        for mesh in &object.meshes {
            self.load_mesh(mesh, Some(done.clone()))?;
        }
        for texture in &object.textures {
            self.load_texture(texture, Some(done.clone()))?;
        }
        drop(done);

        for _ in 0..count {
            loaded.recv().map_err(|_| RenderError::Disconnected)?;
        }
        Ok(())
    }

    // Queries and frames

    /// Block until the occlusion queries issued on this canvas resolve.
    ///
    /// Does nothing when the backend has no occlusion queries. Must not be
    /// called from the thread that runs frames of a manually hosted
    /// render thread.
    pub fn query_wait(&self) -> RenderResult<()> {
        if !self.shared.capabilities.occlusion_query {
            return Ok(());
        }
        let scope = match self.target_id() {
            Some(id) => QueryScope::Target(id),
            None => QueryScope::All,
        };
        let (done, finished) = crossbeam_channel::bounded(1);
        self.shared
            .uploads
            .submit(RenderCommand::new("query_wait", move |ctx| {
                ctx.queries.wait(ctx.backend.as_mut(), scope);
                loader::signal(&done);
            }))?;
        finished.recv().map_err(|_| RenderError::Disconnected)
    }

    /// Finish the current frame of this canvas.
    ///
    /// On the main canvas of a spawned render thread this runs a frame and
    /// blocks until it completes. With a manually hosted thread the host
    /// runs frames itself and `None` is returned. On a render target this
    /// queues finalization of the target and returns `None` immediately;
    /// finalization resolves the target's occlusion queries.
    pub fn render(&self) -> RenderResult<Option<FrameStats>> {
        if let Some(target) = &self.target {
            self.finalize_target(target)?;
            return Ok(None);
        }
        let Some(control) = &self.shared.control else {
            return Ok(None);
        };
        let (done, finished) = crossbeam_channel::bounded(1);
        control
            .send(Control::Frame(done))
            .map_err(|_| RenderError::Disconnected)?;
        let stats = finished.recv().map_err(|_| RenderError::Disconnected)?;
        Ok(Some(stats))
    }

    fn finalize_target(&self, target: &TargetState) -> RenderResult<()> {
        let Some(owner) = target.binding.upgrade() else {
            return Ok(());
        };
        let color = target.color.clone();
        self.shared
            .frames
            .submit(RenderCommand::new("finalize_target", move |ctx| {
                ctx.queries
                    .wait(ctx.backend.as_mut(), QueryScope::Target(owner.id));
                ctx.state.bind_framebuffer(ctx.backend.as_mut(), None);
                drop(owner);
                let Some(texture) = color.and_then(|weak| weak.upgrade()) else {
                    return;
                };
                let data = texture.read();
                if !data.sampler.min_filter.is_mipmapped() {
                    return;
                }
                if let Some(native) = &data.native {
                    ctx.backend.generate_mipmaps(native.handle);
                }
            }))
    }

    // Render to texture

    /// Create a render target and return a canvas drawing to it.
    ///
    /// Blocks until the render thread has built the framebuffer. The
    /// framebuffer stays alive while any destination texture is alive; a
    /// target without destination textures lives as long as the returned
    /// canvas and its clones.
    pub fn render_to_texture(&self, config: RenderTargetConfig) -> RenderResult<Renderer> {
        config.validate(&self.shared.capabilities)?;

        let id = TargetId::next();
        let destinations = config.destinations().iter().map(|t| t.id()).collect::<Vec<_>>();
        let color = config.color.as_ref().map(Texture::downgrade);
        let (width, height) = (config.width, config.height);

        let (reply, created) = crossbeam_channel::bounded(1);
        self.shared
            .uploads
            .submit(RenderCommand::new("create_render_target", move |ctx| {
                let result = target::create(ctx, &config, id);
                let _ = reply.send(result);
            }))?;
        let owner: Arc<FramebufferOwner> =
            created.recv().map_err(|_| RenderError::Disconnected)??;

        let binding = if destinations.is_empty() {
            TargetBinding::Owned(owner)
        } else {
            TargetBinding::Backed(Arc::downgrade(&owner))
        };
        Ok(Renderer {
            shared: Arc::clone(&self.shared),
            target: Some(Arc::new(TargetState {
                id,
                width,
                height,
                binding,
                destinations,
                color,
            })),
        })
    }

    fn target_owner(&self) -> Result<Option<Arc<FramebufferOwner>>, SkipReason> {
        match &self.target {
            None => Ok(None),
            Some(target) => target
                .binding
                .upgrade()
                .map(Some)
                .ok_or(SkipReason::TargetReleased),
        }
    }
}

fn skip(reason: SkipReason) -> DrawOutcome {
    log::warn!("Draw skipped: {:?}", reason);
    DrawOutcome::Skipped(reason)
}

/// Everything a draw command needs, owned by the command.
struct DrawCall {
    rect: Rect,
    shader: Shader,
    meshes: Vec<Mesh>,
    textures: Vec<Texture>,
    state: DrawState,
    model: glam::Mat4,
    camera: Camera,
    occlusion: Option<Arc<OcclusionResult>>,
    target: Option<Arc<FramebufferOwner>>,
}

impl DrawCall {
    fn execute(self, ctx: &mut RenderContext) {
        for texture in &self.textures {
            let source = texture.read().render_target();
            if let Some(id) = source {
                ctx.queries.wait(ctx.backend.as_mut(), QueryScope::Target(id));
            }
        }

        let shader = self.shader.read();
        let Some(program) = shader.native.as_ref().map(|n| n.handle) else {
            log::warn!("Draw dropped: shader '{}' is not linked", shader.name);
            ctx.stats.skipped_draws += 1;
            return;
        };

        let framebuffer = self.target.as_ref().map(|o| o.framebuffer);
        ctx.state.bind_framebuffer(ctx.backend.as_mut(), framebuffer);
        ctx.state.set_viewport(ctx.backend.as_mut(), self.rect);
        ctx.state.set_scissor(ctx.backend.as_mut(), Some(self.rect));
        apply_draw_state(ctx, &self.state);
        ctx.state.use_program(ctx.backend.as_mut(), Some(program));

        let backend = ctx.backend.as_mut();
        for (name, value) in &shader.inputs {
            backend.set_uniform(program, name, *value);
        }
        let matrices = [
            ("Model", self.model),
            ("View", self.camera.view),
            ("Projection", self.camera.projection),
            ("MVP", self.camera.mvp(self.model)),
        ];
        for (name, matrix) in matrices {
            backend.set_uniform(program, name, UniformValue::Mat4(matrix));
        }

        for (unit, texture) in self.textures.iter().enumerate() {
            let unit = unit as u32;
            let data = texture.read();
            backend.bind_texture(unit, data.native.as_ref().map(|n| n.handle));
            backend.set_uniform(program, &format!("Texture{}", unit), UniformValue::Sampler(unit));
        }

        let query = self.occlusion.as_ref().and_then(|slot| {
            ctx.queries
                .begin(ctx.backend.as_mut(), slot, self.target.as_ref().map(|o| o.id))
        });

        let backend = ctx.backend.as_mut();
        for mesh in &self.meshes {
            let data = mesh.read();
            let Some(native) = data.native.as_ref() else {
                continue;
            };
            if native.vertex_count == 0 {
                continue;
            }
            let fixed = [
                ("Vertex", native.vertices, 3),
                ("Color", native.colors, 4),
                ("Normal", native.normals, 3),
                ("Bary", native.barycentric, 3),
            ];
            for (name, buffer, components) in fixed {
                if let Some(buffer) = buffer {
                    backend.bind_attribute(program, name, buffer, components);
                }
            }
            for (index, buffer) in native.texcoords.iter().enumerate() {
                if let Some(buffer) = buffer {
                    backend.bind_attribute(program, &format!("TexCoord{}", index), *buffer, 2);
                }
            }
            for (name, (buffer, components)) in &native.attributes {
                backend.bind_attribute(program, name, *buffer, *components);
            }

            let count = match native.indices {
                Some(_) => native.index_count,
                None => native.vertex_count,
            };
            backend.draw(native.indices, count);
        }

        if let Some(query) = query {
            ctx.queries.end(ctx.backend.as_mut(), query);
        }
        ctx.stats.draws += 1;
    }
}

fn apply_draw_state(ctx: &mut RenderContext, state: &DrawState) {
    let backend = ctx.backend.as_mut();
    let cache = &mut ctx.state;

    cache.set_color_writes(backend, state.color_writes);

    cache.set_feature(backend, Feature::DepthTest, state.depth_test);
    cache.set_depth_write(backend, state.depth_write);
    cache.set_depth_func(backend, state.depth_func);

    cache.set_feature(backend, Feature::StencilTest, state.stencil_test);
    if state.stencil_test {
        cache.set_stencil(backend, state.stencil_front, state.stencil_back);
    }

    match &state.blend {
        Some(blend) => {
            cache.set_feature(backend, Feature::Blend, true);
            cache.set_blend_color(backend, blend.color);
            cache.set_blend_func(backend, blend.func);
            cache.set_blend_equations(backend, blend.equations);
        }
        None => cache.set_feature(backend, Feature::Blend, false),
    }

    cache.set_cull_mode(backend, state.cull);
}
