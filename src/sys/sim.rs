//! Deterministic simulated backend.
//!
//! `SimDemux` provides a controllable readiness source for testing the
//! reactor without OS facilities. Readiness is modeled as level-style
//! conditions per virtual descriptor (`set_readable`, `set_oob`,
//! `set_error`, ...) while registrations keep the one-shot contract:
//! a condition persists until cleared, but each armed interest fires at
//! most once and must be re-registered, exactly like the OS backends.
//!
//! `wait` never blocks. It records the timeout it was handed (so tests
//! can assert the reactor's timeout computation) and delivers whatever
//! armed registrations currently match a condition, in arming order.
//! The backend's wake descriptor is permanently readable, mirroring the
//! real wake pipe.
//!
//! Registrations can be made to fail on demand (`fail_next_register`)
//! and every successful registration is appended to an inspectable log.

use super::{Demux, Filter, RawFd, SysEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// Virtual descriptor used for the simulated wake channel.
pub const SIM_WAKE_FD: RawFd = RawFd::MAX;

#[derive(Debug, Default, Clone, Copy)]
struct Conditions {
    readable: bool,
    writable: bool,
    oob: bool,
    errno: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    fd: RawFd,
    filter: Filter,
    tag: u64,
}

#[derive(Debug, Default)]
struct SimState {
    conditions: HashMap<RawFd, Conditions>,
    /// Armed one-shot registrations, in arming order. At most one per
    /// `(fd, base filter)`: re-arming replaces in place, as on kqueue.
    armed: Vec<Registration>,
    register_log: Vec<(RawFd, Filter, u64)>,
    fail_next: Option<i32>,
    last_timeout: Option<Option<Duration>>,
    wait_calls: usize,
}

/// Deterministic in-process [`Demux`] for tests.
#[derive(Debug, Default)]
pub struct SimDemux {
    state: Mutex<SimState>,
}

const fn base(filter: Filter) -> Filter {
    match filter {
        Filter::Read | Filter::Priority => Filter::Read,
        Filter::Write => Filter::Write,
    }
}

impl SimDemux {
    /// Creates a simulated backend with no conditions set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the read condition for a virtual descriptor.
    pub fn set_readable(&self, fd: RawFd, ready: bool) {
        self.state.lock().conditions.entry(fd).or_default().readable = ready;
    }

    /// Marks the write condition for a virtual descriptor.
    pub fn set_writable(&self, fd: RawFd, ready: bool) {
        self.state.lock().conditions.entry(fd).or_default().writable = ready;
    }

    /// Marks the out-of-band condition for a virtual descriptor.
    pub fn set_oob(&self, fd: RawFd, ready: bool) {
        self.state.lock().conditions.entry(fd).or_default().oob = ready;
    }

    /// Sets an error condition; armed interests on `fd` fire with it.
    pub fn set_error(&self, fd: RawFd, errno: Option<i32>) {
        self.state.lock().conditions.entry(fd).or_default().errno = errno;
    }

    /// Makes the next `register` call fail with `errno`.
    pub fn fail_next_register(&self, errno: i32) {
        self.state.lock().fail_next = Some(errno);
    }

    /// Every successful registration so far, in order.
    #[must_use]
    pub fn register_log(&self) -> Vec<(RawFd, Filter, u64)> {
        self.state.lock().register_log.clone()
    }

    /// Number of successful registrations for one descriptor.
    #[must_use]
    pub fn register_count_for(&self, fd: RawFd) -> usize {
        self.state
            .lock()
            .register_log
            .iter()
            .filter(|(logged, _, _)| *logged == fd)
            .count()
    }

    /// Currently armed registrations as `(fd, filter, tag)` triples.
    #[must_use]
    pub fn armed(&self) -> Vec<(RawFd, Filter, u64)> {
        self.state
            .lock()
            .armed
            .iter()
            .map(|reg| (reg.fd, reg.filter, reg.tag))
            .collect()
    }

    /// The timeout handed to the most recent `wait` call.
    #[must_use]
    pub fn last_wait_timeout(&self) -> Option<Option<Duration>> {
        self.state.lock().last_timeout
    }

    /// Number of `wait` calls so far.
    #[must_use]
    pub fn wait_calls(&self) -> usize {
        self.state.lock().wait_calls
    }

    fn fires(conditions: Conditions, registration: Registration) -> bool {
        if conditions.errno.is_some() {
            return true;
        }
        match base(registration.filter) {
            Filter::Read => conditions.readable || conditions.oob,
            Filter::Write => conditions.writable,
            Filter::Priority => unreachable!("base filter is never Priority"),
        }
    }
}

impl Demux for SimDemux {
    fn register(&self, fd: RawFd, filter: Filter, tag: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(errno) = state.fail_next.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let registration = Registration { fd, filter, tag };
        // Replace an existing registration for the same (fd, base filter)
        // in place; otherwise append in arming order.
        if let Some(existing) = state
            .armed
            .iter_mut()
            .find(|reg| reg.fd == fd && base(reg.filter) == base(filter))
        {
            *existing = registration;
        } else {
            state.armed.push(registration);
        }
        state.register_log.push((fd, filter, tag));
        Ok(())
    }

    fn wait(
        &self,
        events: &mut Vec<SysEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut state = self.state.lock();
        state.last_timeout = Some(timeout);
        state.wait_calls += 1;

        let max = max.max(1);
        let mut remaining = Vec::with_capacity(state.armed.len());
        for registration in std::mem::take(&mut state.armed) {
            if events.len() >= max {
                remaining.push(registration);
                continue;
            }
            let conditions = if registration.fd == SIM_WAKE_FD {
                // The wake channel is permanently signaled.
                Conditions {
                    readable: true,
                    ..Conditions::default()
                }
            } else {
                state
                    .conditions
                    .get(&registration.fd)
                    .copied()
                    .unwrap_or_default()
            };

            if Self::fires(conditions, registration) {
                events.push(SysEvent {
                    tag: registration.tag,
                    filter: base(registration.filter),
                    oob: conditions.oob,
                    error: conditions.errno,
                });
            } else {
                remaining.push(registration);
            }
        }
        state.armed = remaining;
        Ok(())
    }

    fn wake_fd(&self) -> RawFd {
        SIM_WAKE_FD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::WAKE_TAG;

    #[test]
    fn registration_is_one_shot() {
        let demux = SimDemux::new();
        demux.register(3, Filter::Read, 30).expect("register");
        demux.set_readable(3, true);

        let mut events = Vec::new();
        demux.wait(&mut events, 16, None).expect("wait");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, 30);

        // Condition persists but the interest is gone.
        events.clear();
        demux.wait(&mut events, 16, None).expect("wait");
        assert!(events.is_empty());
    }

    #[test]
    fn rearming_read_replaces_priority_in_place() {
        let demux = SimDemux::new();
        demux.register(3, Filter::Priority, 30).expect("register");
        demux.register(3, Filter::Read, 30).expect("register");
        assert_eq!(demux.armed().len(), 1);
        assert_eq!(demux.armed()[0].1, Filter::Read);
    }

    #[test]
    fn wake_descriptor_is_always_ready() {
        let demux = SimDemux::new();
        demux
            .register(demux.wake_fd(), Filter::Read, WAKE_TAG)
            .expect("register");
        let mut events = Vec::new();
        demux.wait(&mut events, 16, None).expect("wait");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, WAKE_TAG);
    }

    #[test]
    fn error_condition_fires_any_filter() {
        let demux = SimDemux::new();
        demux.register(4, Filter::Write, 40).expect("register");
        demux.set_error(4, Some(104));
        let mut events = Vec::new();
        demux.wait(&mut events, 16, None).expect("wait");
        assert_eq!(events[0].error, Some(104));
        assert_eq!(events[0].filter, Filter::Write);
    }

    #[test]
    fn failed_registration_is_not_logged() {
        let demux = SimDemux::new();
        demux.fail_next_register(12);
        let err = demux.register(5, Filter::Read, 50).expect_err("fails");
        assert_eq!(err.raw_os_error(), Some(12));
        assert!(demux.register_log().is_empty());
        assert!(demux.armed().is_empty());
    }

    #[test]
    fn wait_records_timeout_and_respects_max() {
        let demux = SimDemux::new();
        demux.register(1, Filter::Read, 10).expect("register");
        demux.register(2, Filter::Read, 20).expect("register");
        demux.set_readable(1, true);
        demux.set_readable(2, true);

        let mut events = Vec::new();
        demux
            .wait(&mut events, 1, Some(Duration::from_secs(7)))
            .expect("wait");
        assert_eq!(events.len(), 1);
        assert_eq!(
            demux.last_wait_timeout(),
            Some(Some(Duration::from_secs(7)))
        );

        // The deferred registration is still armed for the next cycle.
        events.clear();
        demux.wait(&mut events, 16, None).expect("wait");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, 20);
    }
}
