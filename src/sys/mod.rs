//! Kernel event demultiplexer backends.
//!
//! [`Demux`] is the seam between the reactor core and the OS: a one-shot,
//! per-(descriptor, filter) readiness-notification facility. Backends:
//!
//! - `KqueueDemux` — macOS/BSD kqueue (`EV_ONESHOT`), the native shape
//!   of the contract.
//! - `EpollDemux` — Linux epoll (`EPOLLONESHOT`), emulating independent
//!   per-filter one-shot interests on top of epoll's single registration
//!   per descriptor.
//! - [`SimDemux`] — deterministic in-process backend for tests, with
//!   injectable readiness and a registration log.
//!
//! Every backend owns a wake channel: a descriptor kept permanently in a
//! signaled state, so that arming one-shot read interest on it always
//! produces an event on the next wait. The reactor uses this to break a
//! blocked wait call from another thread without any reset logic.

use std::io;
use std::time::Duration;

#[cfg(unix)]
pub use std::os::unix::io::RawFd;
#[cfg(not(unix))]
/// Raw descriptor type on platforms without Unix file descriptors.
pub type RawFd = i32;

#[cfg(unix)]
mod pipe;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueDemux;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::EpollDemux;

mod sim;
pub use sim::SimDemux;

/// The platform's native demultiplexer.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub type OsDemux = KqueueDemux;
/// The platform's native demultiplexer.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type OsDemux = EpollDemux;
/// The platform's native demultiplexer (unsupported stub).
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "linux",
    target_os = "android"
)))]
pub type OsDemux = unsupported::UnsupportedDemux;

/// Registration tag reserved for the wake channel. Descriptor tags pack
/// a bounded slot index in their high bits and can never collide.
pub const WAKE_TAG: u64 = u64::MAX;

/// Kernel interest filter for a one-shot registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Readable events (`EVFILT_READ` / `EPOLLIN`).
    Read,
    /// Writable events (`EVFILT_WRITE` / `EPOLLOUT`).
    Write,
    /// Out-of-band variant of the read filter (`EV_OOBAND` / `EPOLLPRI`).
    Priority,
}

/// One readiness notification returned by [`Demux::wait`].
///
/// `filter` is the base filter that fired: `Priority` registrations
/// report as `Read` with `oob` set, mirroring how kqueue surfaces the
/// shared read filter. `error` carries the OS error code when the kernel
/// reported a failure for the registration rather than readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysEvent {
    /// The registration's user-data tag.
    pub tag: u64,
    /// Base filter that fired: `Read` or `Write`, never `Priority`.
    pub filter: Filter,
    /// Out-of-band data is pending on the descriptor.
    pub oob: bool,
    /// OS error code reported for the registration, if any.
    pub error: Option<i32>,
}

/// A one-shot kernel readiness-notification facility.
///
/// Registrations are keyed by `(descriptor, base filter)` and auto-disarm
/// after firing once; re-registering the same key replaces the previous
/// interest. `wait` retrieves at most `max` events, blocking up to
/// `timeout` (`None` blocks indefinitely).
pub trait Demux: Send + Sync {
    /// Arms one-shot interest in `filter` on `fd`, tagged with `tag`.
    fn register(&self, fd: RawFd, filter: Filter, tag: u64) -> io::Result<()>;

    /// Blocks for readiness, appending up to `max` events to `events`.
    /// An interrupted wait (`EINTR`) is an empty cycle, not an error.
    fn wait(
        &self,
        events: &mut Vec<SysEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()>;

    /// The wake channel's descriptor, permanently in a signaled state.
    fn wake_fd(&self) -> RawFd;
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "linux",
    target_os = "android"
)))]
mod unsupported {
    use super::{Demux, Filter, RawFd, SysEvent};
    use std::io;
    use std::time::Duration;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "no native demultiplexer on this platform",
        )
    }

    /// Placeholder backend for platforms without kqueue or epoll.
    #[derive(Debug, Default)]
    pub struct UnsupportedDemux;

    impl UnsupportedDemux {
        /// Always fails on unsupported platforms.
        pub fn new() -> io::Result<Self> {
            Err(unsupported())
        }
    }

    impl Demux for UnsupportedDemux {
        fn register(&self, _fd: RawFd, _filter: Filter, _tag: u64) -> io::Result<()> {
            Err(unsupported())
        }

        fn wait(
            &self,
            _events: &mut Vec<SysEvent>,
            _max: usize,
            _timeout: Option<Duration>,
        ) -> io::Result<()> {
            Err(unsupported())
        }

        fn wake_fd(&self) -> RawFd {
            -1
        }
    }
}
