//! Render-to-texture targets.
//!
//! A target owns one framebuffer and the renderbuffers created for outputs
//! that have no destination texture. Ownership is shared through a single
//! [`FramebufferOwner`]:
//!
//! ```text
//!  destination texture ──strong──┐
//!  destination texture ──strong──┼──► FramebufferOwner ──Drop──► free lists
//!  target canvas ───────weak─────┘      (fbo + rbos)
//! ```
//!
//! With at least one destination texture the canvas only holds a weak
//! reference, so the framebuffer lives exactly as long as its textures.
//! Without destination textures the canvas is the owner. Either way the
//! framebuffer and renderbuffers are queued for deletion once, after every
//! texture and the canvas that could reach it are gone, regardless of the
//! order in which they are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::backend::{
    Attachment, DeviceCapabilities, FramebufferHandle, FramebufferStatus, NativeHandle,
    RenderbufferHandle, TextureFormat, TextureStorage,
};
use crate::command::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::finalizer::DeferredFinalizer;
use crate::resources::{NativeTexture, ResourceId, Texture, TextureChanges, WeakTexture};

/// Identity of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

impl TargetId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Owner of a target's framebuffer and renderbuffers.
#[derive(Debug)]
pub struct FramebufferOwner {
    pub(crate) id: TargetId,
    pub(crate) framebuffer: FramebufferHandle,
    pub(crate) renderbuffers: Vec<RenderbufferHandle>,
    finalizer: Arc<DeferredFinalizer>,
}

impl FramebufferOwner {
    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }
}

impl Drop for FramebufferOwner {
    fn drop(&mut self) {
        log::debug!(
            "Render target {} released, queueing framebuffer {}",
            self.id.0,
            self.framebuffer.raw()
        );
        let handles = std::iter::once(NativeHandle::from(self.framebuffer))
            .chain(self.renderbuffers.iter().copied().map(NativeHandle::from));
        self.finalizer.queue_free_all(handles);
        self.finalizer.queue_target_release(self.id);
    }
}

/// Link from a destination texture to the framebuffer it backs.
#[derive(Debug, Clone)]
pub(crate) struct TargetLink {
    pub(crate) id: TargetId,
    pub(crate) _owner: Arc<FramebufferOwner>,
}

/// How a target canvas reaches its framebuffer.
#[derive(Debug)]
pub(crate) enum TargetBinding {
    /// No destination textures: the canvas owns the framebuffer.
    Owned(Arc<FramebufferOwner>),
    /// Destination textures own the framebuffer.
    Backed(Weak<FramebufferOwner>),
}

impl TargetBinding {
    pub(crate) fn upgrade(&self) -> Option<Arc<FramebufferOwner>> {
        match self {
            TargetBinding::Owned(owner) => Some(Arc::clone(owner)),
            TargetBinding::Backed(owner) => owner.upgrade(),
        }
    }
}

/// Canvas-side state of a render target.
#[derive(Debug)]
pub(crate) struct TargetState {
    pub(crate) id: TargetId,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) binding: TargetBinding,
    pub(crate) destinations: Vec<ResourceId>,
    pub(crate) color: Option<WeakTexture>,
}

impl TargetState {
    pub(crate) fn writes_to(&self, texture: ResourceId) -> bool {
        self.destinations.contains(&texture)
    }
}

/// Requested outputs of a render target.
///
/// Each of color, depth and stencil is enabled by giving its format. An
/// enabled output with a destination texture renders into that texture;
/// without one it goes to an internal renderbuffer.
#[derive(Debug, Clone)]
pub struct RenderTargetConfig {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub stencil_format: Option<TextureFormat>,
    pub color: Option<Texture>,
    pub depth: Option<Texture>,
    pub stencil: Option<Texture>,
}

impl RenderTargetConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            samples: 1,
            color_format: None,
            depth_format: None,
            stencil_format: None,
            color: None,
            depth: None,
            stencil: None,
        }
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_color(mut self, format: TextureFormat, texture: Option<Texture>) -> Self {
        self.color_format = Some(format);
        self.color = texture;
        self
    }

    pub fn with_depth(mut self, format: TextureFormat, texture: Option<Texture>) -> Self {
        self.depth_format = Some(format);
        self.depth = texture;
        self
    }

    pub fn with_stencil(mut self, format: TextureFormat, texture: Option<Texture>) -> Self {
        self.stencil_format = Some(format);
        self.stencil = texture;
        self
    }

    /// Combined depth/stencil output in one attachment.
    pub fn with_depth_stencil(self, texture: Option<Texture>) -> Self {
        self.with_depth(TextureFormat::Depth24Stencil8, texture)
            .with_stencil(TextureFormat::Depth24Stencil8, None)
    }

    fn combined_depth_stencil(&self) -> bool {
        self.depth_format
            .is_some_and(|f| f.is_combined_depth_stencil())
    }

    /// Destination textures, each listed once.
    pub fn destinations(&self) -> Vec<&Texture> {
        let mut out: Vec<&Texture> = Vec::new();
        for texture in [&self.color, &self.depth, &self.stencil].into_iter().flatten() {
            if !out.iter().any(|t| t.ptr_eq(texture)) {
                out.push(texture);
            }
        }
        out
    }

    /// Check the configuration against structural rules and capabilities.
    ///
    /// Structural violations are [`RenderError::InvalidTargetConfig`];
    /// valid requests the backend cannot satisfy are
    /// [`RenderError::UnsupportedTarget`].
    pub fn validate(&self, caps: &DeviceCapabilities) -> RenderResult<()> {
        let invalid = |msg: &str| Err(RenderError::InvalidTargetConfig(msg.to_string()));

        if self.width == 0 || self.height == 0 {
            return invalid("bounds must be non-empty");
        }
        if self.samples == 0 {
            return invalid("sample count must be at least one");
        }
        if self.color_format.is_none() && self.depth_format.is_none() && self.stencil_format.is_none()
        {
            return invalid("no color, depth or stencil output requested");
        }
        if self.color.is_some() && self.color_format.is_none() {
            return invalid("color texture given without a color format");
        }
        if self.depth.is_some() && self.depth_format.is_none() {
            return invalid("depth texture given without a depth format");
        }
        if self.stencil.is_some() && self.stencil_format.is_none() {
            return invalid("stencil texture given without a stencil format");
        }
        if self.color_format.is_some_and(|f| !f.is_color()) {
            return invalid("color format is not a color format");
        }
        if self.depth_format.is_some_and(|f| !f.has_depth()) {
            return invalid("depth format has no depth component");
        }
        if self.stencil_format.is_some_and(|f| !f.has_stencil()) {
            return invalid("stencil format has no stencil component");
        }
        let depth_combined = self.combined_depth_stencil();
        let stencil_combined = self
            .stencil_format
            .is_some_and(|f| f.is_combined_depth_stencil());
        if depth_combined != stencil_combined || (depth_combined && self.depth_format != self.stencil_format)
        {
            return invalid("combined depth/stencil must be used for both depth and stencil");
        }
        if depth_combined {
            if let (Some(depth), Some(stencil)) = (&self.depth, &self.stencil) {
                if !depth.ptr_eq(stencil) {
                    return invalid("combined depth/stencil needs a single destination texture");
                }
            }
        }
        for texture in self.destinations() {
            if texture.read().render_target().is_some() {
                return invalid("destination texture already belongs to a render target");
            }
        }

        if !caps.framebuffer_objects {
            return Err(RenderError::UnsupportedTarget(
                "framebuffer objects not available".to_string(),
            ));
        }
        if self.width > caps.max_texture_size || self.height > caps.max_texture_size {
            return Err(RenderError::UnsupportedTarget(format!(
                "{}x{} exceeds the maximum size {}",
                self.width, self.height, caps.max_texture_size
            )));
        }
        if self.samples > caps.max_samples.max(1) {
            return Err(RenderError::UnsupportedTarget(format!(
                "{} samples requested, {} supported",
                self.samples, caps.max_samples
            )));
        }
        if let Some(format) = self.color_format {
            if !caps.supports_color_format(format) {
                return Err(unsupported_format("color", format));
            }
        }
        if let Some(format) = self.depth_format {
            if !caps.supports_depth_format(format) {
                return Err(unsupported_format("depth", format));
            }
        }
        if let Some(format) = self.stencil_format {
            if !caps.supports_stencil_format(format) {
                return Err(unsupported_format("stencil", format));
            }
        }
        Ok(())
    }
}

fn unsupported_format(output: &str, format: TextureFormat) -> RenderError {
    RenderError::UnsupportedTarget(format!("{} format {:?} not supported", output, format))
}

/// Native objects allocated so far, released again on failure.
struct Allocation {
    framebuffer: FramebufferHandle,
    renderbuffers: Vec<RenderbufferHandle>,
    textures: Vec<Texture>,
}

/// Build a target's framebuffer on the render thread.
///
/// The configuration has been validated on the caller side. On success the
/// destination textures are loaded, linked to the returned owner, and the
/// caller decides whether to keep a strong or a weak reference to it.
pub(crate) fn create(
    ctx: &mut RenderContext,
    config: &RenderTargetConfig,
    id: TargetId,
) -> RenderResult<Arc<FramebufferOwner>> {
    let framebuffer = ctx.backend.create_framebuffer()?;
    let mut alloc = Allocation {
        framebuffer,
        renderbuffers: Vec::new(),
        textures: Vec::new(),
    };

    match attach_outputs(ctx, config, &mut alloc) {
        Ok(status) => match status {
            FramebufferStatus::Complete => {}
            FramebufferStatus::Unsupported => {
                release(ctx, alloc);
                log::warn!("Render target {}: format combination unsupported", id.0);
                return Err(RenderError::UnsupportedTarget(
                    "framebuffer format combination rejected by the driver".to_string(),
                ));
            }
            FramebufferStatus::Incomplete(code) => {
                release(ctx, alloc);
                log::error!("Render target {}: framebuffer incomplete (0x{:04x})", id.0, code);
                return Err(RenderError::IncompleteFramebuffer(code));
            }
        },
        Err(err) => {
            release(ctx, alloc);
            return Err(err.into());
        }
    }

    let owner = Arc::new(FramebufferOwner {
        id,
        framebuffer: alloc.framebuffer,
        renderbuffers: std::mem::take(&mut alloc.renderbuffers),
        finalizer: Arc::clone(&ctx.finalizer),
    });
    for texture in &alloc.textures {
        texture.write().target = Some(TargetLink {
            id,
            _owner: Arc::clone(&owner),
        });
    }

    log::debug!(
        "Created render target {} ({}x{}, {} textures, {} renderbuffers)",
        id.0,
        config.width,
        config.height,
        alloc.textures.len(),
        owner.renderbuffers.len()
    );
    Ok(owner)
}

fn attach_outputs(
    ctx: &mut RenderContext,
    config: &RenderTargetConfig,
    alloc: &mut Allocation,
) -> crate::backend::BackendResult<FramebufferStatus> {
    let combined = config.combined_depth_stencil();

    if let Some(format) = config.color_format {
        attach(ctx, config, alloc, Attachment::Color0, format, config.color.as_ref())?;
    }
    if let Some(format) = config.depth_format {
        let attachment = if combined {
            Attachment::DepthStencil
        } else {
            Attachment::Depth
        };
        let texture = config.depth.as_ref().or(if combined {
            config.stencil.as_ref()
        } else {
            None
        });
        attach(ctx, config, alloc, attachment, format, texture)?;
    }
    if let Some(format) = config.stencil_format.filter(|_| !combined) {
        attach(ctx, config, alloc, Attachment::Stencil, format, config.stencil.as_ref())?;
    }

    ctx.backend
        .set_draw_buffers(alloc.framebuffer, config.color_format.is_some());
    Ok(ctx.backend.framebuffer_status(alloc.framebuffer))
}

fn attach(
    ctx: &mut RenderContext,
    config: &RenderTargetConfig,
    alloc: &mut Allocation,
    attachment: Attachment,
    format: TextureFormat,
    texture: Option<&Texture>,
) -> crate::backend::BackendResult<()> {
    let storage = TextureStorage {
        width: config.width,
        height: config.height,
        format,
        samples: config.samples,
    };

    let Some(texture) = texture else {
        let renderbuffer = ctx.backend.create_renderbuffer(&storage)?;
        ctx.backend
            .attach_renderbuffer(alloc.framebuffer, attachment, renderbuffer);
        alloc.renderbuffers.push(renderbuffer);
        return Ok(());
    };

    let handle = ctx.backend.create_texture()?;
    ctx.backend.upload_texture(handle, &storage, None);
    let mut data = texture.write();
    ctx.backend.set_sampler_params(handle, &data.sampler);
    ctx.backend.attach_texture(alloc.framebuffer, attachment, handle);

    // Replaces any earlier storage, which is queued by its drop.
    data.native = Some(NativeTexture::new(
        handle,
        config.width,
        config.height,
        Arc::clone(&ctx.finalizer),
    ));
    data.loaded = true;
    data.changes.remove(TextureChanges::PIXELS | TextureChanges::SAMPLER);
    data.source = None;
    drop(data);
    alloc.textures.push(texture.clone());
    Ok(())
}

/// Undo a failed creation. Destination textures lose their storage.
fn release(ctx: &mut RenderContext, alloc: Allocation) {
    for texture in &alloc.textures {
        let mut data = texture.write();
        data.native = None;
        data.loaded = false;
    }
    ctx.finalizer.queue_free(alloc.framebuffer);
    ctx.finalizer
        .queue_free_all(alloc.renderbuffers.into_iter().map(NativeHandle::from));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities::default()
    }

    #[test]
    fn test_requires_an_output() {
        let err = RenderTargetConfig::new(64, 64).validate(&caps()).unwrap_err();
        assert!(matches!(err, RenderError::InvalidTargetConfig(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_texture_requires_format() {
        let mut config = RenderTargetConfig::new(64, 64).with_depth(TextureFormat::Depth16, None);
        config.color = Some(Texture::empty());
        assert!(matches!(
            config.validate(&caps()),
            Err(RenderError::InvalidTargetConfig(_))
        ));
    }

    #[test]
    fn test_combined_depth_stencil_must_be_symmetric() {
        let config = RenderTargetConfig::new(64, 64)
            .with_depth(TextureFormat::Depth24Stencil8, None)
            .with_stencil(TextureFormat::Stencil8, None);
        assert!(matches!(
            config.validate(&caps()),
            Err(RenderError::InvalidTargetConfig(_))
        ));

        let config = RenderTargetConfig::new(64, 64).with_depth_stencil(None);
        assert!(config.validate(&caps()).is_ok());
    }

    #[test]
    fn test_unsupported_format_is_soft() {
        let config =
            RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba32Float, None);
        let err = config.validate(&caps()).unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedTarget(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_no_framebuffer_objects() {
        let caps = DeviceCapabilities {
            framebuffer_objects: false,
            ..Default::default()
        };
        let config = RenderTargetConfig::new(8, 8).with_color(TextureFormat::Rgba8, None);
        assert!(matches!(
            config.validate(&caps),
            Err(RenderError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn test_destinations_deduplicated() {
        let shared = Texture::empty();
        let config = RenderTargetConfig::new(8, 8)
            .with_depth(TextureFormat::Depth24Stencil8, Some(shared.clone()))
            .with_stencil(TextureFormat::Depth24Stencil8, Some(shared));
        assert_eq!(config.destinations().len(), 1);
        assert!(config.validate(&caps()).is_ok());
    }

    #[test]
    fn test_owner_drop_queues_framebuffer_and_renderbuffers() {
        let finalizer = Arc::new(DeferredFinalizer::new());
        let owner = Arc::new(FramebufferOwner {
            id: TargetId::from_raw(1),
            framebuffer: FramebufferHandle::from_raw(10),
            renderbuffers: vec![RenderbufferHandle::from_raw(11)],
            finalizer: finalizer.clone(),
        });
        let texture = Texture::empty();
        texture.write().target = Some(TargetLink {
            id: owner.id,
            _owner: owner.clone(),
        });
        let weak = Arc::downgrade(&owner);
        drop(owner);
        assert!(weak.upgrade().is_some());
        assert_eq!(finalizer.pending_count(), 0);

        drop(texture);
        assert!(weak.upgrade().is_none());
        assert_eq!(finalizer.pending_count(), 2);
    }
}
