//! Reactor core: registration, submission, and the wait/dispatch cycle.
//!
//! The reactor turns a one-shot kernel readiness facility into a stream
//! of completed operations. Producers submit operations from any thread
//! via [`Reactor::start_op`]; a dedicated thread blocks in
//! [`Reactor::run`], which drains ready operations from per-descriptor
//! queues in submission order, re-arms kernel interest for whatever
//! remains queued, and appends expired timers to the same output batch.
//!
//! # Locking
//!
//! Three independent lock scopes:
//!
//! 1. the global lock (timer-queue membership, timeout computation,
//!    post-wait timer draining) — held briefly, never across the
//!    blocking kernel wait;
//! 2. one lock per descriptor (its three queues and shutdown flag) —
//!    submissions on different descriptors proceed fully in parallel;
//! 3. the registry lock (slot alloc/free) — ordered *after* a
//!    descriptor lock where both are needed (the close path). The
//!    dispatch loop resolves tags under the registry lock and releases
//!    it before taking the descriptor lock, so the two never nest in
//!    the opposite order.
//!
//! Completions are never invoked under any of these locks; they are
//! handed to the [`Executor`] as immediate or deferred work.

use crate::config::ReactorConfig;
use crate::error::{Error, OpError};
use crate::executor::Executor;
use crate::op::{Op, OpKind, ReadyBatch};
use crate::registry::{DescriptorHandle, OpQueues, Registry, Tag};
use crate::sys::{Demux, Filter, OsDemux, RawFd, WAKE_TAG};
use crate::timer::{SharedTimerQueue, TimerQueueSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Readiness-based I/O event demultiplexer.
///
/// Owns the kernel multiplexer handle, the descriptor registry, the
/// timer queue set, and the wake channel. See the crate docs for the
/// overall control flow.
pub struct Reactor {
    demux: Arc<dyn Demux>,
    executor: Arc<dyn Executor>,
    registry: Registry,
    timers: Mutex<TimerQueueSet>,
    config: ReactorConfig,
    shutdown: AtomicBool,
}

impl Reactor {
    /// Creates a reactor over the platform's native demultiplexer.
    ///
    /// Failing to open the kernel multiplexer (or to arm the wake
    /// channel) is the only hard failure of the whole reactor.
    pub fn new(executor: Arc<dyn Executor>) -> Result<Self, Error> {
        Self::with_config(executor, ReactorConfig::default())
    }

    /// Creates a reactor with explicit limits.
    pub fn with_config(executor: Arc<dyn Executor>, config: ReactorConfig) -> Result<Self, Error> {
        let demux = OsDemux::new().map_err(Error::Create)?;
        Self::with_demux(executor, config, Arc::new(demux))
    }

    /// Creates a reactor over a caller-supplied backend, e.g.
    /// [`SimDemux`](crate::sys::SimDemux) in tests.
    pub fn with_demux(
        executor: Arc<dyn Executor>,
        mut config: ReactorConfig,
        demux: Arc<dyn Demux>,
    ) -> Result<Self, Error> {
        config.normalize();
        let reactor = Self {
            registry: Registry::new(config.max_descriptors),
            timers: Mutex::new(TimerQueueSet::new()),
            shutdown: AtomicBool::new(false),
            demux,
            executor,
            config,
        };
        // Arm the wake channel up front so it is ready whenever re-armed.
        reactor
            .demux
            .register(reactor.demux.wake_fd(), Filter::Read, WAKE_TAG)
            .map_err(Error::Create)?;
        Ok(reactor)
    }

    /// Registers a descriptor, returning the handle operations are
    /// submitted through. No kernel interest is armed until the first
    /// operation of a kind is submitted.
    pub fn register_descriptor(&self, fd: RawFd) -> Result<DescriptorHandle, Error> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        let state = self.registry.allocate(fd)?;
        trace!(fd, "descriptor registered");
        Ok(DescriptorHandle::new(state))
    }

    /// Number of currently registered descriptors.
    #[must_use]
    pub fn registered_descriptors(&self) -> usize {
        self.registry.len()
    }

    /// Submits an operation of `kind` on the descriptor behind `handle`.
    ///
    /// The fast path attempts the operation speculatively when it is the
    /// first of its kind and `allow_speculative` permits: completion
    /// dispatches immediately with no queue entry and no kernel
    /// registration. Otherwise the operation is queued FIFO behind its
    /// kind and one-shot kernel interest is armed for the first of each
    /// kind. Failures (bad handle, descriptor shut down, registration
    /// error) complete the operation through the executor with the
    /// corresponding [`OpError`]; nothing is raised from this call.
    pub fn start_op(
        &self,
        kind: OpKind,
        handle: &DescriptorHandle,
        mut op: Box<dyn Op>,
        allow_speculative: bool,
    ) {
        let Some(state) = handle.state() else {
            op.set_error(OpError::BadDescriptor);
            self.executor.post_immediate_completion(op);
            return;
        };

        let mut queues = state.lock();
        if queues.is_shutdown() {
            drop(queues);
            op.set_error(OpError::Aborted);
            self.executor.post_immediate_completion(op);
            return;
        }

        if queues.queue(kind).is_empty() {
            // Urgent data must not be overtaken: a read never completes
            // speculatively while except operations are queued.
            let read_behind_except =
                kind == OpKind::Read && !queues.queue(OpKind::Except).is_empty();
            if allow_speculative && !read_behind_except && op.perform() {
                drop(queues);
                trace!(fd = state.fd(), ?kind, "speculative completion");
                self.executor.post_immediate_completion(op);
                return;
            }

            let filter = match kind {
                OpKind::Read => Some(Filter::Read),
                OpKind::Write => Some(Filter::Write),
                // The out-of-band variant shares the read filter and must
                // never clash with an armed read registration.
                OpKind::Except if queues.queue(OpKind::Read).is_empty() => Some(Filter::Priority),
                OpKind::Except => None,
            };
            if let Some(filter) = filter {
                if let Err(err) = self.demux.register(state.fd(), filter, state.tag().pack()) {
                    let errno = err.raw_os_error().unwrap_or(0);
                    warn!(fd = state.fd(), errno, "interest registration failed");
                    drop(queues);
                    op.set_error(OpError::Os(errno));
                    self.executor.post_deferred_completion(op);
                    return;
                }
            }
        }

        queues.queue_mut(kind).push_back(op);
        drop(queues);
        self.executor.work_started();
    }

    /// Cancels every queued operation on the descriptor. Each completes
    /// with [`OpError::Aborted`] as a deferred batch; the descriptor
    /// stays registered and accepts new submissions.
    pub fn cancel_ops(&self, handle: &DescriptorHandle) {
        let Some(state) = handle.state() else {
            return;
        };
        let mut batch = ReadyBatch::new();
        {
            let mut queues = state.lock();
            let drained = queues.drain_all_into(OpError::Aborted, &mut batch);
            trace!(fd = state.fd(), drained, "operations cancelled");
        }
        if !batch.is_empty() {
            self.executor.post_deferred_completions(&mut batch);
        }
    }

    /// Closes the descriptor: aborts everything queued, releases the
    /// registry slot, and nulls `handle` so it cannot be reused. The
    /// caller is expected to close the underlying OS descriptor, which
    /// drops any residual kernel interest.
    pub fn close_descriptor(&self, handle: &mut DescriptorHandle) {
        let Some(state) = handle.take() else {
            return;
        };
        let mut batch = ReadyBatch::new();
        {
            // Descriptor lock first, registry lock second; the dispatch
            // loop never holds them in the opposite order.
            let mut queues = state.lock();
            if queues.is_shutdown() {
                return;
            }
            queues.drain_all_into(OpError::Aborted, &mut batch);
            queues.set_shutdown();
            let _ = self.registry.free(state.tag());
            debug!(fd = state.fd(), "descriptor closed");
        }
        if !batch.is_empty() {
            self.executor.post_deferred_completions(&mut batch);
        }
    }

    /// One wait-and-dispatch cycle.
    ///
    /// Blocks until a registered interest fires, the wake channel fires,
    /// or the computed timeout elapses — `min(wait_cap, next timer
    /// deadline)`, or zero when `block` is false. Ready operations and
    /// expired timers are appended to `batch` in per-descriptor,
    /// per-kind submission order; the caller invokes each exactly once.
    ///
    /// # Errors
    ///
    /// Only a failing kernel wait call is returned; interrupted waits
    /// count as empty cycles.
    pub fn run(&self, block: bool, batch: &mut ReadyBatch) -> io::Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }

        let timeout = if block {
            self.timers.lock().wait_duration(self.config.wait_cap)
        } else {
            Duration::ZERO
        };

        let mut events = Vec::with_capacity(self.config.events_per_cycle);
        self.demux
            .wait(&mut events, self.config.events_per_cycle, Some(timeout))?;
        trace!(events = events.len(), "wait cycle returned");

        for event in &events {
            if event.tag == WAKE_TAG {
                // The wake channel stays permanently signaled; there is
                // nothing to reset and nothing queued behind it.
                continue;
            }
            let Some(state) = self.registry.resolve(Tag::unpack(event.tag)) else {
                // Stale tag from a descriptor closed after the interest
                // was armed.
                continue;
            };

            let mut queues = state.lock();
            if queues.is_shutdown() {
                continue;
            }

            let mut kinds: SmallVec<[OpKind; 2]> = SmallVec::new();
            match event.filter {
                Filter::Read => {
                    // Urgent data drains ahead of normal reads for the
                    // same notification.
                    if event.oob {
                        kinds.push(OpKind::Except);
                    }
                    kinds.push(OpKind::Read);
                }
                Filter::Priority => kinds.push(OpKind::Except),
                Filter::Write => kinds.push(OpKind::Write),
            }
            for kind in kinds {
                Self::drain_ready(&mut queues, kind, event.error, batch);
            }

            let rearm = match event.filter {
                Filter::Read | Filter::Priority => {
                    if queues.queue(OpKind::Read).is_empty() {
                        (!queues.queue(OpKind::Except).is_empty()).then_some(Filter::Priority)
                    } else {
                        Some(Filter::Read)
                    }
                }
                Filter::Write => (!queues.queue(OpKind::Write).is_empty()).then_some(Filter::Write),
            };
            if let Some(filter) = rearm {
                if let Err(err) = self.demux.register(state.fd(), filter, event.tag) {
                    // Descriptor-fatal: every operation still queued on
                    // this descriptor fails with the OS error.
                    let errno = err.raw_os_error().unwrap_or(0);
                    warn!(fd = state.fd(), errno, "re-registration failed");
                    queues.drain_all_into(OpError::Os(errno), batch);
                }
            }
        }

        self.timers.lock().get_ready_timers(batch);
        Ok(())
    }

    /// Breaks a blocked [`run`](Self::run) call from another thread.
    ///
    /// Re-arms one-shot read interest on the permanently signaled wake
    /// channel; the interest fires on the very next wait cycle.
    pub fn interrupt(&self) {
        if let Err(err) = self
            .demux
            .register(self.demux.wake_fd(), Filter::Read, WAKE_TAG)
        {
            warn!(error = %err, "wake registration failed");
        }
    }

    /// Shuts the reactor down.
    ///
    /// Every queued operation on every live descriptor and every
    /// outstanding timer completes with [`OpError::Aborted`] in one
    /// deferred batch; all registry slots are freed. Idempotent.
    /// Completions are never invoked inline here — shutdown may be
    /// called under caller locks the callbacks must not observe.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut batch = ReadyBatch::new();
        for state in self.registry.drain() {
            let mut queues = state.lock();
            queues.drain_all_into(OpError::Aborted, &mut batch);
            queues.set_shutdown();
        }
        self.timers.lock().get_all_timers(&mut batch);
        debug!(aborted = batch.len(), "reactor shut down");
        self.executor.post_deferred_completions(&mut batch);

        // Unblock a wait cycle that is still parked in the kernel.
        self.interrupt();
    }

    /// Adds a timer queue to the set consulted for wait timeouts and
    /// drained after each cycle.
    pub fn add_timer_queue(&self, queue: SharedTimerQueue) {
        self.timers.lock().insert(queue);
    }

    /// Removes a timer queue from the set. Outstanding timers in the
    /// queue are left untouched.
    pub fn remove_timer_queue(&self, queue: &SharedTimerQueue) {
        self.timers.lock().erase(queue);
    }

    fn drain_ready(queues: &mut OpQueues, kind: OpKind, error: Option<i32>, batch: &mut ReadyBatch) {
        if let Some(errno) = error {
            // The kernel reported failure for this registration: every
            // queued operation of the kind fails with the error code.
            while let Some(mut op) = queues.queue_mut(kind).pop_front() {
                op.set_error(OpError::Os(errno));
                batch.push(op);
            }
            return;
        }
        while let Some(front) = queues.queue_mut(kind).front_mut() {
            if !front.perform() {
                // FIFO forbids skipping ahead of a not-ready operation.
                break;
            }
            let op = queues
                .queue_mut(kind)
                .pop_front()
                .expect("front op exists after perform");
            batch.push(op);
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registered_descriptors", &self.registry.len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::perform_op;
    use crate::sys::SimDemux;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingExecutor {
        immediate: Mutex<Vec<Box<dyn Op>>>,
        deferred: Mutex<Vec<Box<dyn Op>>>,
        work_started: AtomicUsize,
    }

    impl Executor for RecordingExecutor {
        fn post_immediate_completion(&self, op: Box<dyn Op>) {
            self.immediate.lock().push(op);
        }

        fn post_deferred_completion(&self, op: Box<dyn Op>) {
            self.deferred.lock().push(op);
        }

        fn post_deferred_completions(&self, batch: &mut ReadyBatch) {
            let mut deferred = self.deferred.lock();
            for op in batch.drain() {
                deferred.push(op);
            }
        }

        fn work_started(&self) {
            self.work_started.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reactor() -> (Arc<SimDemux>, Arc<RecordingExecutor>, Reactor) {
        let demux = Arc::new(SimDemux::new());
        let executor = Arc::new(RecordingExecutor::default());
        let reactor = Reactor::with_demux(
            executor.clone(),
            ReactorConfig::default(),
            demux.clone(),
        )
        .expect("create reactor");
        (demux, executor, reactor)
    }

    #[test]
    fn construction_arms_wake_interest() {
        let (demux, _executor, _reactor) = reactor();
        let log = demux.register_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].2, WAKE_TAG);
    }

    #[test]
    fn bad_handle_completes_immediately_without_kernel_calls() {
        let (demux, executor, reactor) = reactor();
        let registrations_before = demux.register_log().len();

        let handle = DescriptorHandle::default();
        reactor.start_op(OpKind::Read, &handle, perform_op(|| true), true);

        let immediate = executor.immediate.lock();
        assert_eq!(immediate.len(), 1);
        assert_eq!(immediate[0].error(), Some(OpError::BadDescriptor));
        assert_eq!(demux.register_log().len(), registrations_before);
    }

    #[test]
    fn speculative_write_skips_queue_and_kernel() {
        let (demux, executor, reactor) = reactor();
        let handle = reactor.register_descriptor(8).expect("register");

        reactor.start_op(OpKind::Write, &handle, perform_op(|| true), true);

        assert_eq!(executor.immediate.lock().len(), 1);
        assert_eq!(executor.work_started.load(Ordering::SeqCst), 0);
        assert_eq!(demux.register_count_for(8), 0);
    }

    #[test]
    fn queued_op_arms_interest_and_counts_work() {
        let (demux, executor, reactor) = reactor();
        let handle = reactor.register_descriptor(8).expect("register");

        reactor.start_op(OpKind::Read, &handle, perform_op(|| false), true);

        assert_eq!(executor.work_started.load(Ordering::SeqCst), 1);
        assert_eq!(demux.register_count_for(8), 1);
        assert!(executor.immediate.lock().is_empty());
    }

    #[test]
    fn read_does_not_speculate_past_queued_except() {
        let (_demux, executor, reactor) = reactor();
        let handle = reactor.register_descriptor(8).expect("register");

        reactor.start_op(OpKind::Except, &handle, perform_op(|| false), false);
        // Would complete speculatively if allowed; the queued except op
        // forbids it.
        reactor.start_op(OpKind::Read, &handle, perform_op(|| true), true);

        assert!(executor.immediate.lock().is_empty());
        assert_eq!(executor.work_started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn except_registration_never_clashes_with_read_interest() {
        let (demux, _executor, reactor) = reactor();
        let handle = reactor.register_descriptor(8).expect("register");

        reactor.start_op(OpKind::Read, &handle, perform_op(|| false), false);
        reactor.start_op(OpKind::Except, &handle, perform_op(|| false), false);

        let for_fd: Vec<_> = demux
            .register_log()
            .into_iter()
            .filter(|(fd, _, _)| *fd == 8)
            .collect();
        assert_eq!(for_fd.len(), 1);
        assert_eq!(for_fd[0].1, Filter::Read);
    }

    #[test]
    fn registration_failure_defers_the_op_with_errno() {
        let (demux, executor, reactor) = reactor();
        let handle = reactor.register_descriptor(8).expect("register");

        demux.fail_next_register(13);
        reactor.start_op(OpKind::Read, &handle, perform_op(|| false), false);

        let deferred = executor.deferred.lock();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].error(), Some(OpError::Os(13)));
        assert_eq!(executor.work_started.load(Ordering::SeqCst), 0);

        // Nothing was left queued: cancel finds nothing.
        drop(deferred);
        reactor.cancel_ops(&handle);
        assert_eq!(executor.deferred.lock().len(), 1);
    }

    #[test]
    fn close_aborts_and_nulls_the_handle() {
        let (_demux, executor, reactor) = reactor();
        let mut handle = reactor.register_descriptor(8).expect("register");

        reactor.start_op(OpKind::Read, &handle, perform_op(|| false), false);
        reactor.close_descriptor(&mut handle);

        assert!(handle.is_closed());
        assert_eq!(reactor.registered_descriptors(), 0);
        let deferred = executor.deferred.lock();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].error(), Some(OpError::Aborted));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (_demux, executor, reactor) = reactor();
        let handle = reactor.register_descriptor(8).expect("register");
        reactor.start_op(OpKind::Write, &handle, perform_op(|| false), false);

        reactor.shutdown();
        reactor.shutdown();

        assert_eq!(executor.deferred.lock().len(), 1);
        assert!(matches!(
            reactor.register_descriptor(9),
            Err(Error::ShutDown)
        ));
    }

    #[test]
    fn run_after_shutdown_is_a_no_op() {
        let (demux, _executor, reactor) = reactor();
        reactor.shutdown();
        let waits_before = demux.wait_calls();
        let mut batch = ReadyBatch::new();
        reactor.run(true, &mut batch).expect("run");
        assert!(batch.is_empty());
        assert_eq!(demux.wait_calls(), waits_before);
    }
}
