//! Linux epoll backend.
//!
//! epoll keeps a single registration per descriptor, while the [`Demux`]
//! contract promises independent one-shot interests per `(fd, filter)`
//! pair. The backend bridges the two with an armed-mask per registration:
//! `register` merges the filter's bits into the mask and installs it with
//! `EPOLLONESHOT`; when an event fires, `EPOLLONESHOT` has disarmed the
//! whole descriptor, so `wait` silently re-installs whatever armed bits
//! did *not* fire before returning. The reactor core therefore never
//! loses a write interest because a read fired first, exactly as with
//! kqueue's per-filter registrations.
//!
//! The read filter requests `EPOLLIN | EPOLLPRI` so that out-of-band
//! data is reported on a plain read registration too, matching how
//! kqueue flags `EV_OOBAND` on the shared read filter. `Priority`
//! requests `EPOLLPRI` alone and replaces a read registration the way a
//! kqueue `EVFILT_READ` re-registration would.
//!
//! `EPOLLERR`/`EPOLLHUP` are reported against every armed filter, with
//! the errno recovered from `SO_ERROR` where the descriptor supports it.
//!
//! # Safety
//!
//! FFI with `epoll(7)` via libc. Descriptor lifetimes are the caller's
//! responsibility; closing an fd drops its kernel interest and the
//! armed-mask entry self-heals on the next registration.

#![allow(unsafe_code)]

use super::pipe::WakePipe;
use super::{Demux, Filter, RawFd, SysEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::time::Duration;

const READ_BITS: u32 = libc::EPOLLIN as u32 | libc::EPOLLPRI as u32;
const WRITE_BITS: u32 = libc::EPOLLOUT as u32;
const PRI_BITS: u32 = libc::EPOLLPRI as u32;
const FAULT_BITS: u32 = libc::EPOLLERR as u32 | libc::EPOLLHUP as u32;

pub struct EpollDemux {
    epoll_fd: RawFd,
    wake: WakePipe,
    /// tag -> descriptor and currently armed interest bits. An entry
    /// exists only while at least one filter is armed.
    armed: Mutex<HashMap<u64, ArmedEntry>>,
}

#[derive(Clone, Copy)]
struct ArmedEntry {
    fd: RawFd,
    mask: u32,
}

impl EpollDemux {
    /// Creates the epoll instance and its wake pipe.
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 takes only the flags argument.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake = match WakePipe::new() {
            Ok(wake) => wake,
            Err(err) => {
                // SAFETY: epoll_fd is still owned here.
                unsafe { libc::close(epoll_fd) };
                return Err(err);
            }
        };
        Ok(Self {
            epoll_fd,
            wake,
            armed: Mutex::new(HashMap::new()),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32, tag: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask | libc::EPOLLONESHOT as u32,
            u64: tag,
        };
        // SAFETY: event is a valid epoll_event; fd and epoll_fd are open.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Installs `mask` for `fd`, adding or modifying as the kernel's
    /// current knowledge of the descriptor requires.
    fn install(&self, fd: RawFd, mask: u32, tag: u64) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, mask, tag) {
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, mask, tag)
            }
            other => other,
        }
    }

    fn socket_error(fd: RawFd) -> Option<i32> {
        let mut code: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: code/len form a valid SO_ERROR out-parameter pair.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::addr_of_mut!(code).cast(),
                &mut len,
            )
        };
        if rc == 0 && code != 0 {
            Some(code)
        } else {
            None
        }
    }
}

impl Demux for EpollDemux {
    fn register(&self, fd: RawFd, filter: Filter, tag: u64) -> io::Result<()> {
        let mut armed = self.armed.lock();
        // A closed descriptor's entry may linger under its old tag; a
        // fresh registration for the same fd number supersedes it.
        armed.retain(|&other_tag, entry| entry.fd != fd || other_tag == tag);

        let previous = armed.get(&tag).map_or(0, |entry| entry.mask);
        // Read and Priority share the read filter's registration slot,
        // as on kqueue: the newer variant replaces the older.
        let mask = match filter {
            Filter::Read => (previous & !PRI_BITS) | READ_BITS,
            Filter::Priority => (previous & !READ_BITS) | PRI_BITS,
            Filter::Write => previous | WRITE_BITS,
        };
        self.install(fd, mask, tag)?;
        armed.insert(tag, ArmedEntry { fd, mask });
        Ok(())
    }

    fn wait(
        &self,
        events: &mut Vec<SysEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let max = max.max(1);
        let timeout_ms: libc::c_int = match timeout {
            // Round up so sub-millisecond timeouts still make progress.
            Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let mut buf: Vec<libc::epoll_event> = vec![libc::epoll_event { events: 0, u64: 0 }; max];
        // SAFETY: buf holds max valid epoll_event entries for the kernel
        // to fill; the return value bounds how many were written.
        let rc = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                buf.as_mut_ptr(),
                max as libc::c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        buf.truncate(rc as usize);

        let mut armed = self.armed.lock();
        for ev in &buf {
            let fired = ev.events;
            let tag = ev.u64;
            let Some(entry) = armed.get(&tag).copied() else {
                continue;
            };

            let faulted = fired & FAULT_BITS != 0;
            let errno = if faulted {
                Self::socket_error(entry.fd)
            } else {
                None
            };

            let mut consumed = 0;
            if (fired & READ_BITS != 0 || faulted) && entry.mask & READ_BITS != 0 {
                events.push(SysEvent {
                    tag,
                    filter: Filter::Read,
                    oob: fired & PRI_BITS != 0,
                    error: errno,
                });
                consumed |= READ_BITS;
            }
            if (fired & WRITE_BITS != 0 || faulted) && entry.mask & WRITE_BITS != 0 {
                events.push(SysEvent {
                    tag,
                    filter: Filter::Write,
                    oob: false,
                    error: errno,
                });
                consumed |= WRITE_BITS;
            }

            // EPOLLONESHOT disarmed the whole descriptor; restore the
            // interests that did not fire so they behave like kqueue's
            // independent per-filter registrations.
            let remaining = entry.mask & !consumed;
            if remaining == 0 || self.install(entry.fd, remaining, tag).is_err() {
                armed.remove(&tag);
            } else {
                armed.insert(
                    tag,
                    ArmedEntry {
                        fd: entry.fd,
                        mask: remaining,
                    },
                );
            }
        }
        Ok(())
    }

    fn wake_fd(&self) -> RawFd {
        self.wake.read_fd()
    }
}

impl Drop for EpollDemux {
    fn drop(&mut self) {
        // SAFETY: epoll_fd is owned and still open.
        unsafe { libc::close(self.epoll_fd) };
    }
}

impl std::fmt::Debug for EpollDemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollDemux")
            .field("epoll_fd", &self.epoll_fd)
            .field("wake_fd", &self.wake.read_fd())
            .field("armed", &self.armed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn oneshot_read_fires_once_until_rearmed() {
        let demux = EpollDemux::new().expect("create");
        let (left, mut right) = UnixStream::pair().expect("pair");
        left.set_nonblocking(true).expect("nonblocking");
        let fd = left.as_raw_fd();

        demux.register(fd, Filter::Read, 7).expect("register");
        right.write_all(b"x").expect("write");

        let mut events = Vec::new();
        demux
            .wait(&mut events, 8, Some(Duration::from_millis(200)))
            .expect("wait");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, 7);
        assert_eq!(events[0].filter, Filter::Read);
        assert_eq!(events[0].error, None);

        // Disarmed: same readiness produces nothing until re-registered.
        events.clear();
        demux
            .wait(&mut events, 8, Some(Duration::from_millis(50)))
            .expect("wait");
        assert!(events.is_empty());

        demux.register(fd, Filter::Read, 7).expect("re-register");
        demux
            .wait(&mut events, 8, Some(Duration::from_millis(200)))
            .expect("wait");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn unfired_read_interest_survives_write_event() {
        let demux = EpollDemux::new().expect("create");
        let (left, mut right) = UnixStream::pair().expect("pair");
        left.set_nonblocking(true).expect("nonblocking");
        let fd = left.as_raw_fd();

        // The socket starts writable but not readable, so arming both
        // fires only the write side.
        demux.register(fd, Filter::Write, 9).expect("register write");
        demux.register(fd, Filter::Read, 9).expect("register read");

        let mut events = Vec::new();
        demux
            .wait(&mut events, 8, Some(Duration::from_millis(200)))
            .expect("wait");
        assert!(events.iter().any(|e| e.filter == Filter::Write));
        assert!(!events.iter().any(|e| e.filter == Filter::Read));

        // Read interest must still be live without a re-register call.
        right.write_all(b"x").expect("write");
        events.clear();
        demux
            .wait(&mut events, 8, Some(Duration::from_millis(200)))
            .expect("wait");
        assert!(events
            .iter()
            .any(|e| e.filter == Filter::Read && e.tag == 9));
    }

    #[test]
    fn wake_fd_is_always_ready_when_armed() {
        let demux = EpollDemux::new().expect("create");
        demux
            .register(demux.wake_fd(), Filter::Read, super::super::WAKE_TAG)
            .expect("arm wake");

        let mut events = Vec::new();
        demux
            .wait(&mut events, 8, Some(Duration::from_secs(5)))
            .expect("wait");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, super::super::WAKE_TAG);
    }
}
