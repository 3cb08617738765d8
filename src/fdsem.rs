//! Eventfd-backed binary semaphore usable from a poll loop.
//!
//! [`FdSem`] is the wake primitive underneath the SPSC queues: a
//! signaled/unsignaled flag whose blocking wait is implemented via a
//! pollable eventfd, so one thread can sleep on many semaphores inside a
//! single `poll()`.
//!
//! # The before/after-poll protocol
//!
//! A naive "check the flag, then block in poll()" sequence is racy: a post
//! that lands in the gap between the check and the block writes no wake
//! token (nobody was registered waiting) and the sleeper never wakes. The
//! two-phase protocol closes the gap:
//!
//! 1. [`FdSem::before_poll`] — consume a pending signal if there is one;
//!    otherwise register as waiting and *re-check* the flag, because a
//!    concurrent post may have landed between the check and the
//!    registration.
//! 2. block in `poll()` on [`FdSem::fd`]
//! 3. [`FdSem::after_poll`] — unregister and re-check once more, so a post
//!    that raced the poll teardown is not lost.
//!
//! Every `before_poll` that returns `false` (armed) must be paired with an
//! `after_poll`.

use crate::error::Result;
use rustix::event::{eventfd, EventfdFlags, PollFd, PollFlags};
use rustix::io::Errno;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// A cross-thread binary wake primitive with a pollable descriptor.
///
/// `post()` is idempotent while the semaphore is already signaled: two posts
/// before a wait produce exactly one wakeup. An in-flight token counter
/// dedupes eventfd writes so stray tokens never accumulate.
pub struct FdSem {
    fd: rustix::fd::OwnedFd,
    signaled: AtomicBool,
    /// Wake tokens written to the eventfd but not yet drained. May go
    /// transiently negative in the window between a write landing and its
    /// counter increment.
    in_flight: AtomicI32,
    /// Number of consumers currently registered as waiting.
    waiting: AtomicU32,
}

impl FdSem {
    /// Create a new, unsignaled semaphore.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)?;
        Ok(Self {
            fd,
            signaled: AtomicBool::new(false),
            in_flight: AtomicI32::new(0),
            waiting: AtomicU32::new(0),
        })
    }

    /// The raw descriptor to register for readability in a poll loop.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Signal the semaphore.
    ///
    /// Safe to call from any thread, including RT threads. A wake token is
    /// written only on the unsignaled-to-signaled transition and only when a
    /// consumer is registered waiting.
    pub fn post(&self) {
        if self
            .signaled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if self.waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        let token = 1u64.to_ne_bytes();
        loop {
            match rustix::io::write(&self.fd, &token) {
                Ok(_) => break,
                Err(Errno::INTR) => continue,
                // Counter saturated; the waiter will still see the flag.
                Err(Errno::AGAIN) => return,
                Err(e) => {
                    tracing::error!("fdsem eventfd write failed: {}", e);
                    return;
                }
            }
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Drain any pending wake tokens without blocking.
    fn flush(&self) {
        if self.in_flight.load(Ordering::SeqCst) <= 0 {
            return;
        }
        loop {
            let mut buf = [0u8; 8];
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(8) => {
                    // An eventfd read returns the accumulated counter,
                    // covering that many tokens at once.
                    let tokens = u64::from_ne_bytes(buf).min(i32::MAX as u64) as i32;
                    self.in_flight.fetch_sub(tokens, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(Errno::INTR) => continue,
                Err(Errno::AGAIN) => break,
                Err(e) => {
                    tracing::error!("fdsem eventfd read failed: {}", e);
                    break;
                }
            }
            if self.in_flight.load(Ordering::SeqCst) <= 0 {
                break;
            }
        }
    }

    /// Attempt to consume the signaled flag.
    fn take_signal(&self) -> bool {
        self.signaled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Block until the semaphore is signaled, consuming the signal.
    ///
    /// Signal interruption during the blocking wait is retried internally.
    /// If the descriptor becomes unusable the wait aborts rather than
    /// spinning on a failing `poll()`; an unconsumed signal stays set for
    /// the next wait.
    pub fn wait(&self) {
        self.flush();
        if self.take_signal() {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        loop {
            if self.take_signal() {
                break;
            }
            let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
            match rustix::event::poll(&mut fds, -1) {
                Ok(_) => {
                    if fds[0]
                        .revents()
                        .intersects(PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL)
                    {
                        tracing::error!("fdsem descriptor unusable, aborting wait");
                        break;
                    }
                    self.flush();
                }
                Err(Errno::INTR) | Err(Errno::AGAIN) => continue,
                Err(e) => {
                    tracing::error!("fdsem poll failed: {}, aborting wait", e);
                    break;
                }
            }
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Non-blocking variant of [`FdSem::wait`].
    ///
    /// Returns `true` if a signal was consumed.
    pub fn try_wait(&self) -> bool {
        self.flush();
        self.take_signal()
    }

    /// First phase of the poll protocol.
    ///
    /// Returns `true` when a signal was already pending (and has been
    /// consumed): the caller should skip the upcoming blocking poll.
    /// Returns `false` when the semaphore is armed for polling; the caller
    /// must later call [`FdSem::after_poll`] exactly once.
    pub fn before_poll(&self) -> bool {
        self.flush();
        if self.take_signal() {
            return true;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        // Re-check: a post may have landed between the first check and the
        // waiting registration, without writing a token.
        if self.take_signal() {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Second phase of the poll protocol: unregister and re-check.
    ///
    /// Returns `true` if a signal was consumed (whether it arrived through
    /// the descriptor or raced the poll teardown).
    pub fn after_poll(&self) -> bool {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.flush();
        self.take_signal()
    }
}

impl std::fmt::Debug for FdSem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdSem")
            .field("fd", &self.fd())
            .field("signaled", &self.signaled.load(Ordering::Relaxed))
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish()
    }
}
