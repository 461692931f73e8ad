//! Render commands and the queues that carry them to the render thread.
//!
//! A command is a boxed closure run exactly once on the render thread with
//! exclusive access to the [`RenderContext`]. Any thread can submit through
//! a [`CommandQueue`]; submission blocks while the queue is full.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::backend::{DeviceCapabilities, NativeBackend};
use crate::error::{RenderError, RenderResult};
use crate::finalizer::DeferredFinalizer;
use crate::query::OcclusionQueryManager;
use crate::state::GraphicsStateCache;
use crate::thread::FrameStats;
use crate::RendererConfig;

type CommandFn = Box<dyn FnOnce(&mut RenderContext) + Send + 'static>;

/// A unit of work for the render thread.
pub struct RenderCommand {
    label: &'static str,
    work: CommandFn,
}

impl RenderCommand {
    pub fn new(label: &'static str, work: impl FnOnce(&mut RenderContext) + Send + 'static) -> Self {
        Self {
            label,
            work: Box::new(work),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn execute(self, ctx: &mut RenderContext) {
        log::trace!("Executing command '{}'", self.label);
        (self.work)(ctx);
        ctx.stats.commands += 1;
    }
}

impl fmt::Debug for RenderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderCommand")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Producer side of a command lane.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    name: &'static str,
    sender: Sender<RenderCommand>,
}

/// Consumer side of a command lane, owned by the render thread.
#[derive(Debug)]
pub(crate) struct CommandReceiver {
    receiver: Receiver<RenderCommand>,
}

/// Create a bounded FIFO lane.
pub(crate) fn command_lane(name: &'static str, capacity: usize) -> (CommandQueue, CommandReceiver) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
    (CommandQueue { name, sender }, CommandReceiver { receiver })
}

impl CommandQueue {
    /// Append a command, blocking while the lane is full.
    pub fn submit(&self, command: RenderCommand) -> RenderResult<()> {
        if self.sender.is_full() {
            log::debug!(
                "Command lane '{}' full, '{}' waits for the render thread",
                self.name,
                command.label
            );
        }
        self.sender
            .send(command)
            .map_err(|_| RenderError::Disconnected)
    }

    /// Commands currently waiting.
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

impl CommandReceiver {
    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }

    pub(crate) fn try_next(&self) -> Option<RenderCommand> {
        match self.receiver.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<RenderCommand> {
        &self.receiver
    }
}

/// Everything a command may touch on the render thread.
pub struct RenderContext {
    pub(crate) backend: Box<dyn NativeBackend>,
    pub(crate) state: GraphicsStateCache,
    pub(crate) queries: OcclusionQueryManager,
    pub(crate) finalizer: Arc<DeferredFinalizer>,
    pub(crate) capabilities: DeviceCapabilities,
    pub(crate) config: RendererConfig,
    pub(crate) stats: FrameStats,
}

impl RenderContext {
    pub(crate) fn new(
        backend: Box<dyn NativeBackend>,
        config: RendererConfig,
        finalizer: Arc<DeferredFinalizer>,
    ) -> Self {
        let capabilities = backend.capabilities();
        Self {
            state: GraphicsStateCache::new(config.elide_redundant_state),
            queries: OcclusionQueryManager::new(
                capabilities.occlusion_query,
                config.query_poll_interval,
            ),
            backend,
            finalizer,
            capabilities,
            config,
            stats: FrameStats::default(),
        }
    }

    /// Direct access to the native backend, bypassing the state cache.
    pub fn backend(&mut self) -> &mut dyn NativeBackend {
        self.backend.as_mut()
    }

    pub fn state(&self) -> &GraphicsStateCache {
        &self.state
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn finalizer(&self) -> &Arc<DeferredFinalizer> {
        &self.finalizer
    }
}

impl fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("backend", &self.backend.name())
            .field("queries", &self.queries)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_is_fifo() {
        let (queue, lane) = command_lane("test", 8);
        queue.submit(RenderCommand::new("first", |_| {})).unwrap();
        queue.submit(RenderCommand::new("second", |_| {})).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(lane.try_next().map(|c| c.label()), Some("first"));
        assert_eq!(lane.try_next().map(|c| c.label()), Some("second"));
        assert!(lane.try_next().is_none());
    }

    #[test]
    fn test_submit_after_receiver_dropped() {
        let (queue, lane) = command_lane("test", 1);
        drop(lane);
        let result = queue.submit(RenderCommand::new("orphan", |_| {}));
        assert_eq!(result.unwrap_err(), RenderError::Disconnected);
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_command_runs_once_with_context() {
        use crate::backend::DummyBackend;

        let backend = DummyBackend::new();
        let recorder = backend.recorder_handle();
        let mut ctx = RenderContext::new(
            Box::new(backend),
            RendererConfig::default(),
            Arc::new(DeferredFinalizer::new()),
        );

        let command = RenderCommand::new("flush", |ctx| ctx.backend().flush());
        command.execute(&mut ctx);
        assert_eq!(recorder.lock().flushes(), 1);
        assert_eq!(ctx.stats.commands, 1);
    }
}
