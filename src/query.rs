//! Occlusion query bookkeeping.
//!
//! Draws of objects that opted in are wrapped in a native query. The query
//! is registered here together with the object's result slot and resolved
//! later by non-blocking polling. Queries issued on a render target are
//! deferred: frame-end waits skip them, and they are resolved when their
//! target's texture is read or on an explicit wait.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{NativeBackend, QueryHandle};
use crate::resources::OcclusionResult;
use crate::target::TargetId;

/// Lower bound of the blocking-wait poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Which pending queries a wait must see resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    /// Every pending query.
    All,
    /// Queries issued on the main canvas.
    Screen,
    /// Queries issued on one render target.
    Target(TargetId),
}

#[derive(Debug)]
struct PendingQuery {
    query: QueryHandle,
    owner: Arc<OcclusionResult>,
    target: Option<TargetId>,
}

impl PendingQuery {
    fn in_scope(&self, scope: QueryScope) -> bool {
        match scope {
            QueryScope::All => true,
            QueryScope::Screen => self.target.is_none(),
            QueryScope::Target(id) => self.target == Some(id),
        }
    }
}

/// Tracks issued occlusion queries until their results are written back.
#[derive(Debug)]
pub struct OcclusionQueryManager {
    supported: bool,
    pending: Vec<PendingQuery>,
    poll_interval: Duration,
    resolved: u64,
}

impl OcclusionQueryManager {
    pub fn new(supported: bool, poll_interval: Duration) -> Self {
        Self {
            supported,
            pending: Vec::new(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            resolved: 0,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Start a query for a draw.
    ///
    /// Returns `None`, issuing nothing, when queries are unsupported or the
    /// handle cannot be allocated.
    pub fn begin(
        &mut self,
        backend: &mut dyn NativeBackend,
        owner: &Arc<OcclusionResult>,
        target: Option<TargetId>,
    ) -> Option<QueryHandle> {
        if !self.supported {
            return None;
        }
        let query = match backend.create_query() {
            Ok(query) => query,
            Err(err) => {
                log::warn!("Occlusion query not issued: {}", err);
                return None;
            }
        };
        backend.begin_query(query);
        self.pending.push(PendingQuery {
            query,
            owner: Arc::clone(owner),
            target,
        });
        Some(query)
    }

    pub fn end(&mut self, backend: &mut dyn NativeBackend, query: QueryHandle) {
        backend.end_query(query);
    }

    /// Poll every pending query once without blocking.
    ///
    /// Available results are written to their owners and the native queries
    /// deleted; each query resolves exactly once. Returns how many remain.
    pub fn yield_now(&mut self, backend: &mut dyn NativeBackend) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let mut done = Vec::new();
        self.pending.retain(|pending| {
            if !backend.query_result_available(pending.query) {
                return true;
            }
            pending.owner.store(backend.query_result(pending.query));
            done.push(pending.query);
            false
        });

        if !done.is_empty() {
            backend.delete_queries(&done);
            self.resolved += done.len() as u64;
            log::trace!(
                "Resolved {} occlusion queries, {} pending",
                done.len(),
                self.pending.len()
            );
        }
        self.pending.len()
    }

    /// Block until every query in `scope` is resolved.
    ///
    /// Queries outside the scope are polled along the way but not waited on.
    pub fn wait(&mut self, backend: &mut dyn NativeBackend, scope: QueryScope) {
        if !self.supported {
            return;
        }
        loop {
            self.yield_now(backend);
            if self.pending_in(scope) == 0 {
                return;
            }
            std::thread::yield_now();
            std::thread::sleep(self.poll_interval);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_in(&self, scope: QueryScope) -> usize {
        self.pending.iter().filter(|p| p.in_scope(scope)).count()
    }

    /// Total queries resolved since creation.
    pub fn resolved_count(&self) -> u64 {
        self.resolved
    }

    /// Delete every pending query without resolving it.
    pub(crate) fn abandon(&mut self, backend: &mut dyn NativeBackend) {
        if self.pending.is_empty() {
            return;
        }
        let queries: Vec<QueryHandle> = self.pending.drain(..).map(|p| p.query).collect();
        log::debug!("Abandoning {} unresolved occlusion queries", queries.len());
        backend.delete_queries(&queries);
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn issue(
        manager: &mut OcclusionQueryManager,
        backend: &mut DummyBackend,
        samples: u32,
        target: Option<TargetId>,
    ) -> Arc<OcclusionResult> {
        let owner = Arc::new(OcclusionResult::new());
        let query = manager.begin(backend, &owner, target).unwrap();
        backend.draw(None, samples);
        manager.end(backend, query);
        owner
    }

    #[test]
    fn test_yield_resolves_exactly_once() {
        let mut backend = DummyBackend::new().with_query_latency(1);
        let mut manager = OcclusionQueryManager::new(true, MIN_POLL_INTERVAL);
        let owner = issue(&mut manager, &mut backend, 12, None);

        assert_eq!(manager.yield_now(&mut backend), 1);
        assert_eq!(owner.get(), None);
        assert_eq!(manager.yield_now(&mut backend), 0);
        assert_eq!(owner.get(), Some(12));
        assert_eq!(manager.yield_now(&mut backend), 0);

        let recorder = backend.recorder();
        assert_eq!(recorder.count_calls("query_result"), 1);
        assert_eq!(recorder.count_calls("delete_queries"), 1);
        assert_eq!(recorder.live_queries(), 0);
    }

    #[test]
    fn test_wait_skips_other_scopes() {
        let mut backend = DummyBackend::new().with_query_latency(2);
        let mut manager = OcclusionQueryManager::new(true, MIN_POLL_INTERVAL);
        let target = TargetId::from_raw(5);
        let screen = issue(&mut manager, &mut backend, 3, None);
        let _offscreen = issue(&mut manager, &mut backend, 4, Some(target));

        manager.wait(&mut backend, QueryScope::Screen);
        assert_eq!(screen.get(), Some(3));
        // Polled alongside, so it resolved at the same time.
        assert_eq!(manager.pending_in(QueryScope::Target(target)), 0);
        assert_eq!(manager.resolved_count(), 2);
    }

    #[test]
    fn test_unsupported_issues_nothing() {
        let mut backend = DummyBackend::new();
        let mut manager = OcclusionQueryManager::new(false, MIN_POLL_INTERVAL);
        let owner = Arc::new(OcclusionResult::new());

        assert!(manager.begin(&mut backend, &owner, None).is_none());
        manager.wait(&mut backend, QueryScope::All);
        assert_eq!(backend.recorder().count_calls("create_query"), 0);
    }

    #[test]
    fn test_poll_interval_floor() {
        let manager = OcclusionQueryManager::new(true, Duration::from_micros(1));
        assert_eq!(manager.poll_interval, MIN_POLL_INTERVAL);
    }
}
