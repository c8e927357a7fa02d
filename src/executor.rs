//! The executor seam.
//!
//! The reactor produces completed operations; something else runs them.
//! [`Executor`] is that collaborator: a task queue, a thread pool, or a
//! test harness. The reactor only ever *hands off* operations through
//! this trait — it never invokes an operation's completion logic itself,
//! and it never calls into the executor while holding a descriptor lock
//! in a way that would let user code observe reactor-internal locks.

use crate::op::{Op, ReadyBatch};

/// Completion sink and work accounting consumed by the reactor.
///
/// Immediate vs. deferred is a scheduling hint, not a threading contract:
/// an immediate completion may be run inline by the executor (the reactor
/// holds no locks at those call sites), while a deferred completion must
/// be scheduled and must *not* be run inside the posting call, because
/// the reactor may still hold transient internal locks.
pub trait Executor: Send + Sync {
    /// An operation completed at its submission site; run it now or soon.
    fn post_immediate_completion(&self, op: Box<dyn Op>);

    /// Schedule a single completed operation without inline execution.
    fn post_deferred_completion(&self, op: Box<dyn Op>);

    /// Schedule a batch of completed operations without inline execution.
    /// The batch is drained by the call.
    fn post_deferred_completions(&self, batch: &mut ReadyBatch);

    /// Accounting hook: one call per operation that was queued inside the
    /// reactor (speculatively completed operations never count).
    fn work_started(&self);
}
