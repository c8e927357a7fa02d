//! macOS/BSD kqueue backend.
//!
//! kqueue is the native shape of the [`Demux`] contract: interests are
//! keyed by `(ident, filter)` and `EV_ONESHOT` auto-disarms after one
//! delivery. Out-of-band data uses the read filter with the `EV_OOBAND`
//! flag where the platform provides it; `EV_ERROR` carries the errno in
//! the event's data field.
//!
//! # Safety
//!
//! FFI with `kqueue(2)`/`kevent(2)` via libc. The caller owns descriptor
//! lifetimes: a registered fd must stay open until its interest fires or
//! the fd is closed (closing drops kernel interest automatically).

#![allow(unsafe_code)]

use super::pipe::WakePipe;
use super::{Demux, Filter, RawFd, SysEvent};
use std::io;
use std::mem;
use std::time::Duration;

pub struct KqueueDemux {
    kq_fd: RawFd,
    wake: WakePipe,
}

fn kevent_change(fd: RawFd, filter: Filter, tag: u64) -> libc::kevent {
    // SAFETY: kevent is plain-old-data; zeroed is a valid initial value
    // and covers the layout differences between the BSDs.
    let mut kev: libc::kevent = unsafe { mem::zeroed() };
    kev.ident = fd as usize;
    kev.filter = match filter {
        Filter::Read | Filter::Priority => libc::EVFILT_READ,
        Filter::Write => libc::EVFILT_WRITE,
    };
    kev.flags = libc::EV_ADD | libc::EV_ONESHOT;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    if matches!(filter, Filter::Priority) {
        kev.flags |= libc::EV_OOBAND;
    }
    kev.udata = tag as usize as *mut libc::c_void;
    kev
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn event_oob(kev: &libc::kevent) -> bool {
    kev.flags & libc::EV_OOBAND != 0
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn event_oob(_kev: &libc::kevent) -> bool {
    false
}

impl KqueueDemux {
    /// Creates the kqueue instance and its wake pipe.
    pub fn new() -> io::Result<Self> {
        // SAFETY: kqueue(2) takes no arguments.
        let kq_fd = unsafe { libc::kqueue() };
        if kq_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kq_fd is the descriptor we just created.
        let rc = unsafe { libc::fcntl(kq_fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: still owned, not yet wrapped.
            unsafe { libc::close(kq_fd) };
            return Err(err);
        }

        let wake = match WakePipe::new() {
            Ok(wake) => wake,
            Err(err) => {
                // SAFETY: kq_fd is still owned here.
                unsafe { libc::close(kq_fd) };
                return Err(err);
            }
        };

        Ok(Self { kq_fd, wake })
    }
}

impl Demux for KqueueDemux {
    fn register(&self, fd: RawFd, filter: Filter, tag: u64) -> io::Result<()> {
        let change = kevent_change(fd, filter, tag);
        // SAFETY: change is one valid kevent; no event buffer is provided
        // so the kernel only applies the changelist.
        let rc = unsafe {
            libc::kevent(
                self.kq_fd,
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(
        &self,
        events: &mut Vec<SysEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let max = max.max(1);
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timeout_ptr = timespec
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        let mut buf: Vec<libc::kevent> = Vec::with_capacity(max);
        // SAFETY: buf has capacity for max entries; the kernel writes at
        // most that many and returns the count.
        let rc = unsafe {
            libc::kevent(
                self.kq_fd,
                std::ptr::null(),
                0,
                buf.as_mut_ptr(),
                max as i32,
                timeout_ptr,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        // SAFETY: the kernel initialized exactly rc entries.
        unsafe { buf.set_len(rc as usize) };

        for kev in &buf {
            let filter = match kev.filter {
                f if f == libc::EVFILT_READ => Filter::Read,
                f if f == libc::EVFILT_WRITE => Filter::Write,
                _ => continue,
            };
            let error = if kev.flags & libc::EV_ERROR != 0 {
                Some(kev.data as i32)
            } else {
                None
            };
            events.push(SysEvent {
                tag: kev.udata as usize as u64,
                filter,
                oob: event_oob(kev),
                error,
            });
        }
        Ok(())
    }

    fn wake_fd(&self) -> RawFd {
        self.wake.read_fd()
    }
}

impl Drop for KqueueDemux {
    fn drop(&mut self) {
        // SAFETY: kq_fd is owned and still open; the wake pipe closes
        // itself.
        unsafe { libc::close(self.kq_fd) };
    }
}

// SAFETY: the kqueue descriptor is only handed to kevent(2), which is
// thread-safe; the wake pipe is only read by the kernel.
unsafe impl Send for KqueueDemux {}
unsafe impl Sync for KqueueDemux {}

impl std::fmt::Debug for KqueueDemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KqueueDemux")
            .field("kq_fd", &self.kq_fd)
            .field("wake_fd", &self.wake.read_fd())
            .finish()
    }
}
