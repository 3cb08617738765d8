//! Real-time poll scheduler.
//!
//! [`RtPoll`] is the event loop of the audio thread: registered items
//! contribute file descriptors, per-iteration work and pre/post-poll
//! callbacks, and the scheduler merges everything into a single `poll()`
//! per iteration.
//!
//! Each [`RtPoll::run`] iteration executes three phases in item priority
//! order:
//!
//! 1. **work** — process whatever became ready in the previous iteration
//! 2. **before** — arm descriptors for the upcoming poll; an item may
//!    report that data is already pending, which turns the blocking poll
//!    into a non-blocking readiness sweep ("hurry")
//! 3. **after** — tear down poll arming and pick up results
//!
//! Items are plain callback bundles; they never get a handle back to the
//! scheduler, so the item set cannot change mid-iteration.

use crate::error::{Error, Result};
use rustix::event::{PollFd, PollFlags};
use rustix::fd::BorrowedFd;
use rustix::io::Errno;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Scheduling priority of an [`RtPoll`] item. Lower runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RtPriority {
    /// Runs before normal items (message queues live here).
    Early,
    /// Default priority.
    Normal,
    /// Runs after normal items.
    Late,
}

/// What a before-poll callback tells the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeforeResult {
    /// Nothing pending; block in poll as planned.
    Wait,
    /// Data is already pending; poll with a zero timeout.
    SkipWait,
}

/// What a work callback tells the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkResult {
    /// Keep running.
    Continue,
    /// Leave the loop after this iteration.
    Quit,
}

/// Outcome of one [`RtPoll::run`] iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Run again.
    Continue,
    /// A work callback or [`RtPoll::quit`] requested shutdown.
    Quit,
}

/// One pollable descriptor slot owned by an item.
///
/// A slot with a negative `fd` or empty `events` is skipped when the poll
/// set is built.
#[derive(Clone, Copy, Debug)]
pub struct PollEntry {
    /// Descriptor to poll, or -1 for an unused slot.
    pub fd: RawFd,
    /// Events to wait for.
    pub events: PollFlags,
    /// Events reported by the last poll.
    pub revents: PollFlags,
}

impl PollEntry {
    fn unused() -> Self {
        Self {
            fd: -1,
            events: PollFlags::empty(),
            revents: PollFlags::empty(),
        }
    }
}

/// Stable handle to a registered item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RtPollItemId(u64);

type BeforeCb = Box<dyn FnMut(&mut [PollEntry]) -> BeforeResult + Send>;
type WorkCb = Box<dyn FnMut(&mut [PollEntry]) -> WorkResult + Send>;
type AfterCb = Box<dyn FnMut(&mut [PollEntry]) + Send>;

struct Item {
    id: RtPollItemId,
    priority: RtPriority,
    entries: Vec<PollEntry>,
    before: Option<BeforeCb>,
    work: Option<WorkCb>,
    after: Option<AfterCb>,
}

/// Priority-ordered poll scheduler for a real-time thread.
pub struct RtPoll {
    items: Vec<Item>,
    next_id: u64,
    timer: Option<Instant>,
    timer_elapsed: bool,
    quit_requested: bool,
}

impl RtPoll {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            next_id: 0,
            timer: None,
            timer_elapsed: false,
            quit_requested: false,
        }
    }

    /// Register a new item with `n_fds` (initially unused) descriptor
    /// slots. Within one priority class, later registrations run later.
    pub fn item_new(&mut self, priority: RtPriority, n_fds: usize) -> RtPollItemId {
        let id = RtPollItemId(self.next_id);
        self.next_id += 1;
        let item = Item {
            id,
            priority,
            entries: vec![PollEntry::unused(); n_fds],
            before: None,
            work: None,
            after: None,
        };
        let at = self.items.partition_point(|i| i.priority <= priority);
        self.items.insert(at, item);
        id
    }

    /// Register an item watching a single descriptor.
    pub fn item_new_fd(
        &mut self,
        priority: RtPriority,
        fd: RawFd,
        events: PollFlags,
    ) -> RtPollItemId {
        let id = self.item_new(priority, 1);
        let entries = self.item_entries_mut(id);
        entries[0].fd = fd;
        entries[0].events = events;
        id
    }

    fn item_mut(&mut self, id: RtPollItemId) -> &mut Item {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .expect("unknown rtpoll item")
    }

    /// Mutable access to an item's descriptor slots, for re-pointing fds
    /// or changing event masks between iterations.
    pub fn item_entries_mut(&mut self, id: RtPollItemId) -> &mut [PollEntry] {
        &mut self.item_mut(id).entries
    }

    /// Set the item's before-poll callback.
    pub fn item_set_before(
        &mut self,
        id: RtPollItemId,
        cb: impl FnMut(&mut [PollEntry]) -> BeforeResult + Send + 'static,
    ) {
        self.item_mut(id).before = Some(Box::new(cb));
    }

    /// Set the item's work callback.
    pub fn item_set_work(
        &mut self,
        id: RtPollItemId,
        cb: impl FnMut(&mut [PollEntry]) -> WorkResult + Send + 'static,
    ) {
        self.item_mut(id).work = Some(Box::new(cb));
    }

    /// Set the item's after-poll callback.
    pub fn item_set_after(
        &mut self,
        id: RtPollItemId,
        cb: impl FnMut(&mut [PollEntry]) + Send + 'static,
    ) {
        self.item_mut(id).after = Some(Box::new(cb));
    }

    /// Unregister an item, dropping its callbacks.
    pub fn item_free(&mut self, id: RtPollItemId) {
        if let Some(at) = self.items.iter().position(|i| i.id == id) {
            self.items.remove(at);
        }
    }

    /// Arm the wakeup timer at an absolute deadline.
    pub fn set_timer_absolute(&mut self, deadline: Instant) {
        self.timer = Some(deadline);
    }

    /// Arm the wakeup timer `delay` from now.
    pub fn set_timer_relative(&mut self, delay: Duration) {
        self.timer = Some(Instant::now() + delay);
    }

    /// Disarm the wakeup timer.
    pub fn disable_timer(&mut self) {
        self.timer = None;
    }

    /// Whether the timer fired during the last [`RtPoll::run`] iteration.
    /// The timer disarms itself when it fires.
    pub fn timer_elapsed(&self) -> bool {
        self.timer_elapsed
    }

    /// Ask the loop to stop; the current or next iteration returns
    /// [`RunState::Quit`].
    pub fn quit(&mut self) {
        self.quit_requested = true;
    }

    /// Execute one scheduler iteration: work, before, poll, after.
    ///
    /// `timeout` bounds the blocking poll; `None` waits until a descriptor
    /// becomes ready or the timer fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::System`] when `poll()` fails with anything other
    /// than `EINTR`/`EAGAIN` (those are retried).
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<RunState> {
        self.timer_elapsed = false;

        for item in &mut self.items {
            if let Some(work) = item.work.as_mut() {
                if work(&mut item.entries) == WorkResult::Quit {
                    self.quit_requested = true;
                }
            }
        }
        if self.quit_requested {
            return Ok(RunState::Quit);
        }

        let mut hurry = false;
        for item in &mut self.items {
            if let Some(before) = item.before.as_mut() {
                if before(&mut item.entries) == BeforeResult::SkipWait {
                    hurry = true;
                }
            }
        }

        let now = Instant::now();
        let mut poll_timeout = timeout;
        if let Some(deadline) = self.timer {
            let until = deadline.saturating_duration_since(now);
            poll_timeout = Some(match poll_timeout {
                Some(t) => t.min(until),
                None => until,
            });
        }
        if hurry {
            poll_timeout = Some(Duration::ZERO);
        }

        self.poll_once(poll_timeout)?;

        if let Some(deadline) = self.timer {
            if Instant::now() >= deadline {
                self.timer = None;
                self.timer_elapsed = true;
            }
        }

        for item in &mut self.items {
            if let Some(after) = item.after.as_mut() {
                after(&mut item.entries);
            }
        }

        if self.quit_requested {
            Ok(RunState::Quit)
        } else {
            Ok(RunState::Continue)
        }
    }

    /// Run the blocking poll and distribute revents back to the items.
    fn poll_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        // Snapshot (item, slot) positions of the active descriptors; the
        // item set cannot change while we hold the snapshot.
        let mut slots: Vec<(usize, usize)> = Vec::new();
        for (item_idx, item) in self.items.iter_mut().enumerate() {
            for (entry_idx, entry) in item.entries.iter_mut().enumerate() {
                entry.revents = PollFlags::empty();
                if entry.fd >= 0 && !entry.events.is_empty() {
                    slots.push((item_idx, entry_idx));
                }
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let revents: Vec<PollFlags> = loop {
            let mut fds: Vec<PollFd<'_>> = slots
                .iter()
                .map(|&(item_idx, entry_idx)| {
                    let entry = &self.items[item_idx].entries[entry_idx];
                    // SAFETY: the descriptor is owned by the item's backing
                    // object (queue, device), which outlives this iteration.
                    let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
                    PollFd::from_borrowed_fd(fd, entry.events)
                })
                .collect();

            match rustix::event::poll(&mut fds, timeout_ms(deadline)) {
                Ok(_) => break fds.iter().map(|f| f.revents()).collect(),
                Err(Errno::INTR) | Err(Errno::AGAIN) => continue,
                Err(e) => {
                    tracing::error!("rtpoll poll failed: {}", e);
                    return Err(Error::System(e));
                }
            }
        };

        for (&(item_idx, entry_idx), revents) in slots.iter().zip(revents) {
            self.items[item_idx].entries[entry_idx].revents = revents;
        }
        Ok(())
    }
}

impl Default for RtPoll {
    fn default() -> Self {
        Self::new()
    }
}

fn timeout_ms(deadline: Option<Instant>) -> i32 {
    match deadline {
        None => -1,
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            // Round up so sub-millisecond remainders do not busy-spin.
            let ms = (left.as_micros() + 999) / 1000;
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Promote the calling thread to `SCHED_FIFO` real-time scheduling.
///
/// Needs `CAP_SYS_NICE` or an appropriate `RLIMIT_RTPRIO`; failure is
/// reported, not fatal, since the loop runs fine (with worse latency) under
/// the normal scheduler.
///
/// # Errors
///
/// Returns the OS error when the scheduler change is rejected.
#[cfg(target_os = "linux")]
pub fn set_rt_priority(priority: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: param is a valid sched_param and 0 targets the calling thread.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!("SCHED_FIFO promotion failed: {}", err);
        return Err(Error::Io(err));
    }
    tracing::debug!(priority, "thread promoted to SCHED_FIFO");
    Ok(())
}
