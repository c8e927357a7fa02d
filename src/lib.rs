//! Readiness-based I/O event demultiplexer over one-shot kernel
//! notification facilities.
//!
//! iodemux turns a kqueue-style, one-shot readiness facility into a
//! stream of completed asynchronous operations for an external executor
//! to run. It answers: which pending reads, writes, and urgent-data
//! conditions on which descriptors are now ready, in what order, and how
//! to keep re-arming kernel interest without losing or duplicating
//! notifications.
//!
//! # Guarantees
//!
//! - Per-descriptor, per-kind FIFO: operations of one kind on one
//!   descriptor complete in submission order, whether they complete
//!   speculatively or through a kernel notification.
//! - Urgent (out-of-band) data is drained ahead of normal reads for the
//!   same readiness notification.
//! - Registration, submission, cancellation, and close are safe from any
//!   thread while one thread blocks inside [`Reactor::run`].
//! - Wait times are bounded by a configurable cap and the earliest timer
//!   deadline, measured on the monotonic clock.
//! - Shutdown drains every queued operation and timer exactly once, as
//!   an aborted batch.
//!
//! The reactor performs no I/O itself: an [`Op`]'s `perform` step owns
//! the actual syscall and the would-block retry decision. Scheduling of
//! completed operations belongs to the [`Executor`] collaborator.
//!
//! # Example
//!
//! ```
//! use iodemux::{perform_op, sys::SimDemux, OpKind, Reactor, ReactorConfig, ReadyBatch};
//! use std::sync::Arc;
//!
//! # struct Inline;
//! # impl iodemux::Executor for Inline {
//! #     fn post_immediate_completion(&self, mut op: Box<dyn iodemux::Op>) {
//! #         op.perform();
//! #     }
//! #     fn post_deferred_completion(&self, _op: Box<dyn iodemux::Op>) {}
//! #     fn post_deferred_completions(&self, batch: &mut ReadyBatch) {
//! #         let _ = batch.drain().count();
//! #     }
//! #     fn work_started(&self) {}
//! # }
//! let demux = Arc::new(SimDemux::new());
//! let reactor = Reactor::with_demux(Arc::new(Inline), ReactorConfig::default(), demux.clone())?;
//!
//! let handle = reactor.register_descriptor(4)?;
//! // Completes speculatively: no queue entry, no kernel registration.
//! reactor.start_op(OpKind::Write, &handle, perform_op(|| true), true);
//!
//! let mut batch = ReadyBatch::new();
//! reactor.run(false, &mut batch)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod op;
pub(crate) mod registry;
pub mod sys;
pub mod timer;

mod reactor;

pub use config::ReactorConfig;
pub use error::{Error, OpError};
pub use executor::Executor;
pub use op::{perform_op, Op, OpKind, ReadyBatch};
pub use reactor::Reactor;
pub use registry::DescriptorHandle;
pub use timer::{DeadlineQueue, SharedTimerQueue, TimerQueue};
