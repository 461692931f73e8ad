//! The render thread.
//!
//! One thread owns the native backend and everything that touches it. It
//! consumes two FIFO lanes:
//!
//! - the upload lane (resource loads, render target creation, query waits),
//!   executed as soon as commands arrive when the thread is spawned, and
//! - the frame lane (clears, draws, target finalization). A spawned thread
//!   runs these as they arrive too, inside the currently open frame, so a
//!   full lane only makes callers wait for the render thread to catch up.
//!
//! A frame opens with its first frame-lane command or with the frame
//! request, whichever comes first. Opening deletes everything queued in the
//! free lists. A frame request closes the frame: it runs the upload-lane and
//! frame-lane commands present at that moment, flushes the device once,
//! resolves occlusion queries and advances the frame counter.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{select, Receiver, Sender};

use crate::backend::{DeviceCapabilities, NativeBackend};
use crate::command::{command_lane, CommandReceiver, RenderCommand, RenderContext};
use crate::finalizer::DeferredFinalizer;
use crate::query::QueryScope;
use crate::renderer::Renderer;
use crate::state::{CacheStats, GraphicsStateCache, PipelineState};
use crate::RendererConfig;

/// Counters for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    /// Commands executed, including uploads run between frames.
    pub commands: u64,
    pub draws: u64,
    /// Draws dropped on the render thread.
    pub skipped_draws: u64,
    pub freed_handles: u64,
    pub state_calls: CacheStats,
    pub pending_queries: u64,
    pub driver_errors: u64,
}

/// Requests from callers to a spawned render thread.
#[derive(Debug)]
pub(crate) enum Control {
    /// Close the open frame and report its stats.
    Frame(Sender<FrameStats>),
    Shutdown,
}

/// Render thread state.
///
/// Either hosted manually through [`RenderThread::new`] and
/// [`run_frame`](RenderThread::run_frame), or run on its own thread through
/// [`RenderThread::spawn`].
pub struct RenderThread {
    ctx: RenderContext,
    uploads: CommandReceiver,
    frames: CommandReceiver,
    control: Option<Receiver<Control>>,
    frame: u64,
    /// Set between opening and closing a frame.
    open: Option<OpenFrame>,
    last_stats: FrameStats,
}

#[derive(Debug, Clone, Copy)]
struct OpenFrame {
    started: Instant,
    /// Bound state to restore on close, when preserving external state.
    external: Option<PipelineState>,
}

impl RenderThread {
    /// Create render thread state for manual hosting.
    ///
    /// The caller is responsible for calling [`run_frame`](Self::run_frame)
    /// on the thread that owns the returned value. Operations that wait for
    /// the render thread (loads, draws, target creation) must then be issued
    /// from another thread, or the host must drain uploads in between with
    /// [`process_uploads`](Self::process_uploads). Frame-lane commands stay
    /// queued until the next frame, so a caller that fills the lane waits
    /// for the host to run it.
    pub fn new(backend: Box<dyn NativeBackend>, config: RendererConfig) -> (Self, Renderer) {
        Self::build(backend, config, None)
    }

    fn build(
        backend: Box<dyn NativeBackend>,
        config: RendererConfig,
        control: Option<(Sender<Control>, Receiver<Control>)>,
    ) -> (Self, Renderer) {
        let finalizer = Arc::new(DeferredFinalizer::new());
        let (upload_queue, uploads) = command_lane("upload", config.queue_capacity);
        let (frame_queue, frames) = command_lane("frame", config.queue_capacity);
        let ctx = RenderContext::new(backend, config.clone(), Arc::clone(&finalizer));

        log::info!(
            "Render thread using {} backend: {} {} ({})",
            ctx.backend.name(),
            ctx.capabilities.vendor,
            ctx.capabilities.renderer,
            ctx.capabilities.version_string()
        );

        let (control_tx, control_rx) = match control {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };
        let renderer = Renderer::new(
            upload_queue,
            frame_queue,
            control_tx,
            finalizer,
            ctx.capabilities.clone(),
            config,
        );
        let thread = Self {
            ctx,
            uploads,
            frames,
            control: control_rx,
            frame: 0,
            open: None,
            last_stats: FrameStats::default(),
        };
        (thread, renderer)
    }

    /// Move the backend onto a dedicated thread and start serving requests.
    pub fn spawn(
        backend: Box<dyn NativeBackend>,
        config: RendererConfig,
    ) -> std::io::Result<(Renderer, RenderThreadHandle)> {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (thread, renderer) =
            Self::build(backend, config, Some((control_tx.clone(), control_rx)));
        let join = std::thread::Builder::new()
            .name("render".to_string())
            .spawn(move || thread.run())?;
        Ok((
            renderer,
            RenderThreadHandle {
                control: control_tx,
                join: Some(join),
            },
        ))
    }

    /// Serve upload commands and frame requests until shut down.
    pub fn run(mut self) {
        let uploads = self.uploads.receiver().clone();
        let frames = self.frames.receiver().clone();
        let Some(control) = self.control.take() else {
            log::error!("RenderThread::run called on a manually hosted render thread");
            return;
        };

        loop {
            select! {
                recv(uploads) -> command => match command {
                    Ok(command) => command.execute(&mut self.ctx),
                    Err(_) => break,
                },
                recv(frames) -> command => match command {
                    Ok(command) => {
                        self.open_frame();
                        command.execute(&mut self.ctx);
                    }
                    Err(_) => break,
                },
                recv(control) -> request => match request {
                    Ok(Control::Frame(done)) => {
                        let stats = self.run_frame();
                        let _ = done.send(stats);
                    }
                    Ok(Control::Shutdown) | Err(_) => break,
                },
            }
        }
        self.shutdown();
    }

    /// Execute every upload command currently queued, outside of a frame.
    pub fn process_uploads(&mut self) -> usize {
        let count = self.uploads.len();
        let mut executed = 0;
        for _ in 0..count {
            let Some(command) = self.uploads.try_next() else {
                break;
            };
            command.execute(&mut self.ctx);
            executed += 1;
        }
        executed
    }

    /// Run one frame.
    ///
    /// Opens the frame unless frame-lane commands already did, runs the
    /// commands queued at this moment and closes it. Commands submitted
    /// while the frame runs wait for the next one.
    pub fn run_frame(&mut self) -> FrameStats {
        self.open_frame();

        let uploads = self.uploads.len();
        let frames = self.frames.len();
        for _ in 0..uploads {
            match self.uploads.try_next() {
                Some(command) => command.execute(&mut self.ctx),
                None => break,
            }
        }
        for _ in 0..frames {
            match self.frames.try_next() {
                Some(command) => command.execute(&mut self.ctx),
                None => break,
            }
        }

        self.close_frame()
    }

    fn open_frame(&mut self) {
        if self.open.is_some() {
            return;
        }
        let ctx = &mut self.ctx;
        let external = if ctx.config.preserve_external_state {
            let state = ctx.backend.read_state();
            ctx.state.assume(state);
            Some(state)
        } else {
            None
        };

        // Queries of released targets are read before their framebuffers go.
        for id in ctx.finalizer.take_released_targets() {
            ctx.queries.wait(ctx.backend.as_mut(), QueryScope::Target(id));
        }
        ctx.stats.freed_handles += ctx.finalizer.flush_all(ctx.backend.as_mut()) as u64;

        self.open = Some(OpenFrame {
            started: Instant::now(),
            external,
        });
    }

    fn close_frame(&mut self) -> FrameStats {
        let Some(OpenFrame { started, external }) = self.open.take() else {
            return self.last_stats;
        };
        let ctx = &mut self.ctx;

        ctx.backend.flush();

        if ctx.config.wait_queries_on_render {
            ctx.queries.wait(ctx.backend.as_mut(), QueryScope::Screen);
        }
        ctx.stats.pending_queries = ctx.queries.yield_now(ctx.backend.as_mut()) as u64;

        self.frame += 1;

        if let Some(external) = external {
            ctx.state.apply(ctx.backend.as_mut(), &external);
        }

        let errors = ctx.backend.take_errors();
        ctx.stats.driver_errors = errors.len() as u64;
        if ctx.config.log_driver_errors {
            for error in &errors {
                log::error!("Frame {}: {}", self.frame, error);
            }
        }

        ctx.stats.state_calls = ctx.state.take_stats();
        let mut stats = std::mem::take(&mut ctx.stats);
        stats.frame = self.frame;
        log::debug!(
            "Frame {} in {:?}: {} commands, {} draws ({} skipped), {} freed, {} state calls ({} elided), {} queries pending",
            stats.frame,
            started.elapsed(),
            stats.commands,
            stats.draws,
            stats.skipped_draws,
            stats.freed_handles,
            stats.state_calls.issued,
            stats.state_calls.elided,
            stats.pending_queries
        );
        self.last_stats = stats;
        stats
    }

    /// Number of frames run so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn last_stats(&self) -> FrameStats {
        self.last_stats
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.ctx.capabilities
    }

    pub fn state(&self) -> &GraphicsStateCache {
        &self.ctx.state
    }

    pub fn pending_queries(&self) -> usize {
        self.ctx.queries.pending_count()
    }

    /// Run a command immediately, outside of any lane.
    pub fn execute(&mut self, command: RenderCommand) {
        command.execute(&mut self.ctx);
    }

    fn shutdown(&mut self) {
        let ctx = &mut self.ctx;
        ctx.queries.abandon(ctx.backend.as_mut());
        ctx.finalizer.close();
        let freed = ctx.finalizer.flush_all(ctx.backend.as_mut());
        log::info!(
            "Render thread stopped after {} frames ({} handles freed at shutdown)",
            self.frame,
            freed
        );
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        let ctx = &mut self.ctx;
        ctx.finalizer.close();
        if ctx.finalizer.pending_count() > 0 {
            ctx.finalizer.flush_all(ctx.backend.as_mut());
        }
    }
}

impl std::fmt::Debug for RenderThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderThread")
            .field("frame", &self.frame)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// Owner of a spawned render thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct RenderThreadHandle {
    control: Sender<Control>,
    join: Option<JoinHandle<()>>,
}

impl RenderThreadHandle {
    /// Stop the render thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.control.send(Control::Shutdown);
        if join.join().is_err() {
            log::error!("Render thread panicked");
        }
    }
}

impl Drop for RenderThreadHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
