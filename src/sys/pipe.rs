//! Permanently-signaled wake pipe.
//!
//! The pipe is written exactly once at creation and never read, so its
//! read end stays readable for the lifetime of the reactor. Arming
//! one-shot read interest on it is therefore guaranteed to fire on the
//! next wait cycle, which is the entire wake-up mechanism: no reset, no
//! lost-wakeup window.

#![allow(unsafe_code)]

use super::RawFd;
use std::io;

pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];

        // SAFETY: fds is a valid two-element buffer for pipe(2)/pipe2(2).
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        for fd in [pipe.read_fd, pipe.write_fd] {
            // SAFETY: fd is one of the pipe descriptors we just created.
            let rc = unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 {
                    flags
                } else {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
                }
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: same descriptor; close-on-exec bookkeeping only.
            let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        // Put the pipe into its permanently signaled state.
        let byte = [1u8];
        // SAFETY: write_fd is open and byte is a valid one-byte buffer.
        let written = unsafe { libc::write(pipe.write_fd, byte.as_ptr().cast(), 1) };
        if written != 1 {
            return Err(io::Error::last_os_error());
        }

        Ok(pipe)
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this pipe and still open.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_end_is_signaled_from_creation() {
        let pipe = WakePipe::new().expect("create pipe");

        let mut poll_fd = libc::pollfd {
            fd: pipe.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: poll_fd is a valid single-element pollfd array.
        let rc = unsafe { libc::poll(&mut poll_fd, 1, 0) };
        assert_eq!(rc, 1);
        assert_ne!(poll_fd.revents & libc::POLLIN, 0);
    }
}
