//! The event loop: a caller-driven multiplex over the backend's file
//! descriptors and the nearest transfer deadline.
//!
//! One iteration waits on the registered descriptors with poll(2), bounded by
//! the caller's timeout and the nearest deadline in the scheduler. I/O
//! readiness is delegated to the backend, which reports terminal transfers;
//! afterwards expired deadlines are swept, latching each expired transfer and
//! issuing an asynchronous cancel whose completion later surfaces as a
//! timeout. Completion callbacks run inline on the driving thread.

use std::{
    os::fd::{BorrowedFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use log::{debug, warn};
use rustix::{event::PollFlags, io::Errno, time::Timespec};

use crate::{platform::errno_to_error, Context, Error, ErrorKind};

/// Timeout used by [`Context::handle_events`].
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

bitflags::bitflags! {
    /// Readiness conditions to watch for on a [`PollFd`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u16 {
        /// Data may be read without blocking.
        const IN = 0x001;
        /// Data may be written without blocking.
        const OUT = 0x004;
    }
}

impl PollEvents {
    fn to_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(PollEvents::IN) {
            flags |= PollFlags::IN;
        }
        if self.contains(PollEvents::OUT) {
            flags |= PollFlags::OUT;
        }
        flags
    }

    fn from_poll_flags(flags: PollFlags) -> PollEvents {
        let mut events = PollEvents::empty();
        if flags.intersects(PollFlags::IN | PollFlags::ERR | PollFlags::HUP) {
            events |= PollEvents::IN;
        }
        if flags.intersects(PollFlags::OUT | PollFlags::ERR | PollFlags::HUP) {
            events |= PollEvents::OUT;
        }
        events
    }
}

/// A file descriptor the event loop watches, with the conditions it is
/// watched for.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    /// The watched descriptor. Owned by the backend; valid while registered.
    pub fd: RawFd,

    /// Conditions to watch for.
    pub events: PollEvents,
}

type AddedCallback = Box<dyn Fn(PollFd) + Send>;
type RemovedCallback = Box<dyn Fn(RawFd) + Send>;

#[derive(Default)]
pub(crate) struct PollFdNotifiers {
    added: Option<AddedCallback>,
    removed: Option<RemovedCallback>,
}

struct DriverGuard<'a>(&'a AtomicBool);

impl<'a> DriverGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<DriverGuard<'a>, Error> {
        if flag.swap(true, Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::Busy,
                "event loop is already being driven by another thread",
            ));
        }
        Ok(DriverGuard(flag))
    }
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Context {
    /// Register a descriptor for the event loop to watch, notifying the
    /// embedding application.
    pub(crate) fn add_poll_fd(&self, fd: RawFd, events: PollEvents) {
        let pollfd = PollFd { fd, events };
        self.inner.poll_fds.lock().unwrap().push(pollfd);
        debug!("Watching fd {fd} for {events:?}");
        let notifiers = self.inner.notifiers.lock().unwrap();
        if let Some(added) = &notifiers.added {
            added(pollfd);
        }
    }

    /// Remove a descriptor from the watched set, notifying the embedding
    /// application.
    pub(crate) fn remove_poll_fd(&self, fd: RawFd) {
        self.inner.poll_fds.lock().unwrap().retain(|p| p.fd != fd);
        debug!("No longer watching fd {fd}");
        let notifiers = self.inner.notifiers.lock().unwrap();
        if let Some(removed) = &notifiers.removed {
            removed(fd);
        }
    }

    /// Descriptors an embedding application must watch to integrate the
    /// engine into its own event loop. Use
    /// [`Context::set_poll_fd_notifiers`] to track later changes.
    pub fn poll_fds(&self) -> Vec<PollFd> {
        self.inner.poll_fds.lock().unwrap().clone()
    }

    /// Install callbacks invoked whenever a descriptor is added to or removed
    /// from the watched set. Pass `None` to remove a callback.
    pub fn set_poll_fd_notifiers(
        &self,
        added: Option<Box<dyn Fn(PollFd) + Send>>,
        removed: Option<Box<dyn Fn(RawFd) + Send>>,
    ) {
        let mut notifiers = self.inner.notifiers.lock().unwrap();
        notifiers.added = added;
        notifiers.removed = removed;
    }

    /// Time until the nearest transfer deadline, clamped at zero if it has
    /// already passed. `None` when no in-flight transfer can time out, in
    /// which case the event loop needs no timeout of its own.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.inner
            .inflight
            .lock()
            .unwrap()
            .next_deadline()
            .until(Instant::now())
    }

    /// Run one event-loop iteration with a 60-second timeout.
    pub fn handle_events(&self) -> Result<(), Error> {
        self.handle_events_timeout(DEFAULT_TIMEOUT)
    }

    /// Run one event-loop iteration, waiting at most `timeout` (in addition
    /// to any nearer transfer deadline) for descriptor readiness.
    ///
    /// A zero `timeout` polls without blocking. Returns after readiness has
    /// been handed to the backend and expired deadlines have been swept, on
    /// timeout (after the sweep), or on an interrupted syscall (without
    /// further work). Only one thread may drive the loop at a time; a second
    /// concurrent caller fails with [`ErrorKind::Busy`].
    pub fn handle_events_timeout(&self, timeout: Duration) -> Result<(), Error> {
        let _guard = DriverGuard::acquire(&self.inner.driving)?;

        let select_timeout = match self.next_timeout() {
            Some(deadline) => timeout.min(deadline),
            None => timeout,
        };

        // Snapshot so descriptor registration from other threads is not
        // blocked while we sleep in poll; changes are picked up on the next
        // iteration.
        let snapshot: Vec<PollFd> = self.inner.poll_fds.lock().unwrap().clone();

        // SAFETY: registered fds are owned by the backend and stay open
        // while they are in the watched set.
        let mut fds: Vec<rustix::event::PollFd> = snapshot
            .iter()
            .map(|p| unsafe {
                rustix::event::PollFd::from_borrowed_fd(
                    BorrowedFd::borrow_raw(p.fd),
                    p.events.to_poll_flags(),
                )
            })
            .collect();

        let ts = Timespec {
            tv_sec: select_timeout.as_secs() as _,
            tv_nsec: select_timeout.subsec_nanos() as _,
        };

        match rustix::event::poll(&mut fds, Some(&ts)) {
            Err(Errno::INTR) => Ok(()),
            Err(e) => {
                warn!("poll failed: {e}");
                Err(errno_to_error(e, "polling the watched descriptors failed"))
            }
            Ok(0) => {
                drop(fds);
                self.sweep_timeouts();
                Ok(())
            }
            Ok(_) => {
                let ready: Vec<PollFd> = fds
                    .iter()
                    .zip(&snapshot)
                    .map(|(f, p)| PollFd {
                        fd: p.fd,
                        events: PollEvents::from_poll_flags(f.revents()),
                    })
                    .filter(|p| !p.events.is_empty())
                    .collect();
                drop(fds);
                self.inner.backend.clone().handle_events(self, &ready)?;
                self.sweep_timeouts();
                Ok(())
            }
        }
    }

    /// Latch every transfer whose deadline has passed and issue an
    /// asynchronous cancel for it. The cancellation completes through the
    /// backend's event handling and is then reported as a timeout.
    fn sweep_timeouts(&self) {
        let expired = self
            .inner
            .inflight
            .lock()
            .unwrap()
            .take_expired(Instant::now());
        for transfer in expired {
            debug!(
                "Transfer on ep {:02x} timed out, cancelling",
                transfer.endpoint()
            );
            if let Err(e) = self.inner.backend.cancel_transfer(&transfer) {
                // The transfer may have completed concurrently; its natural
                // completion will be reported instead of the timeout.
                warn!("Failed to cancel timed-out transfer: {e}");
            }
        }
    }
}
