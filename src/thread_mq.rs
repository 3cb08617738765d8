//! Pairing of a real-time thread and a control loop through two message
//! queues.
//!
//! [`ThreadMq`] owns an inbound queue (control → RT) and an outbound queue
//! (RT → control). Construction wires the inbound queue into an [`RtPoll`]
//! as an early-priority item, so control messages are dispatched at the top
//! of every scheduler iteration without the RT thread taking any locks. On
//! the control side, [`ThreadMq::run_control`] drives a Tokio task that
//! reacts to outbound messages and reaps acknowledgments of posted inbound
//! messages.

use crate::error::Result;
use crate::memory::MemChunk;
use crate::msgq::{AsyncMsgQueue, Envelope, MsgObject};
use crate::rtpoll::{BeforeResult, RtPoll, RtPollItemId, RtPriority, WorkResult};
use rustix::event::PollFlags;
use std::any::Any;
use std::ops::ControlFlow;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Registers an already-owned descriptor with the Tokio reactor without
/// taking ownership of it.
struct Watch(RawFd);

impl AsRawFd for Watch {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A queue pair connecting one real-time thread to a control loop.
pub struct ThreadMq {
    inbound: Arc<AsyncMsgQueue>,
    outbound: Arc<AsyncMsgQueue>,
    rt_item: Option<RtPollItemId>,
}

impl ThreadMq {
    /// Create a queue pair and register the RT side with `rtpoll`.
    ///
    /// The registered item runs at [`RtPriority::Early`]: queued control
    /// messages are dispatched before any other work in each iteration, and
    /// a pending message cancels the blocking wait entirely.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying eventfds cannot be created.
    pub fn new(rtpoll: &mut RtPoll, capacity: usize) -> Result<Self> {
        let inbound = Arc::new(AsyncMsgQueue::new(capacity)?);
        let outbound = Arc::new(AsyncMsgQueue::new(capacity)?);
        // Tracks whether the before callback armed the queue, so the after
        // callback keeps the arm/disarm pairing exact.
        let armed = Arc::new(AtomicBool::new(false));

        let id = rtpoll.item_new_fd(RtPriority::Early, inbound.read_fd(), PollFlags::IN);

        let q = Arc::clone(&inbound);
        let flag = Arc::clone(&armed);
        rtpoll.item_set_before(id, move |_| {
            if q.read_before_poll() {
                BeforeResult::SkipWait
            } else {
                flag.store(true, Ordering::Relaxed);
                BeforeResult::Wait
            }
        });

        let q = Arc::clone(&inbound);
        let out = Arc::clone(&outbound);
        rtpoll.item_set_work(id, move |_| {
            // Reclaim envelopes the control loop has finished with.
            out.reap();
            while let Some(mut env) = q.get(false) {
                let result = q.dispatch(&mut env);
                q.done(env, result);
            }
            WorkResult::Continue
        });

        let q = Arc::clone(&inbound);
        let flag = Arc::clone(&armed);
        rtpoll.item_set_after(id, move |_| {
            if flag.swap(false, Ordering::Relaxed) {
                q.read_after_poll();
            }
        });

        Ok(Self {
            inbound,
            outbound,
            rt_item: Some(id),
        })
    }

    /// The control → RT queue.
    pub fn inbound(&self) -> &AsyncMsgQueue {
        &self.inbound
    }

    /// The RT → control queue.
    pub fn outbound(&self) -> &AsyncMsgQueue {
        &self.outbound
    }

    /// Post a message to the RT thread without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`](crate::Error::QueueFull) when the
    /// inbound ring is full.
    pub fn post_to_rt(
        &self,
        target: Option<Arc<dyn MsgObject>>,
        code: u32,
        payload: Option<Box<dyn Any + Send>>,
        offset: i64,
        chunk: Option<MemChunk>,
    ) -> Result<()> {
        self.inbound.post(target, code, payload, offset, chunk)
    }

    /// Post a message to the RT thread and block until it is dispatched
    /// there; returns the handler's result code.
    ///
    /// Must only be called from control threads.
    pub fn send_to_rt(
        &self,
        target: Option<Arc<dyn MsgObject>>,
        code: u32,
        payload: Option<Box<dyn Any + Send>>,
        offset: i64,
        chunk: Option<MemChunk>,
    ) -> i32 {
        self.inbound.send(target, code, payload, offset, chunk)
    }

    /// Post a message from the RT thread to the control loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`](crate::Error::QueueFull) when the
    /// outbound ring is full.
    pub fn post_to_control(
        &self,
        target: Option<Arc<dyn MsgObject>>,
        code: u32,
        payload: Option<Box<dyn Any + Send>>,
        offset: i64,
        chunk: Option<MemChunk>,
    ) -> Result<()> {
        self.outbound.post(target, code, payload, offset, chunk)
    }

    /// Drive the control side until `handler` breaks.
    ///
    /// The loop wakes on two descriptors: the outbound message fd (the RT
    /// thread posted something for us) and the inbound ack fd (the RT
    /// thread finished a message we posted, whose envelope we reclaim
    /// here). `handler` receives each outbound envelope; its value becomes
    /// the envelope's result code, and `ControlFlow::Break` ends the loop,
    /// returning the break value.
    ///
    /// # Errors
    ///
    /// Returns an error when the descriptors cannot be registered with the
    /// Tokio reactor.
    pub async fn run_control<H>(&self, mut handler: H) -> Result<i32>
    where
        H: FnMut(&mut Envelope) -> ControlFlow<i32, i32>,
    {
        let msg_watch = AsyncFd::with_interest(Watch(self.outbound.read_fd()), Interest::READABLE)?;
        let ack_watch = AsyncFd::with_interest(Watch(self.inbound.ack_fd()), Interest::READABLE)?;

        loop {
            self.inbound.reap();

            while let Some(mut env) = self.outbound.get(false) {
                match handler(&mut env) {
                    ControlFlow::Continue(result) => self.outbound.done(env, result),
                    ControlFlow::Break(result) => {
                        self.outbound.done(env, result);
                        return Ok(result);
                    }
                }
            }

            // Two-phase arming over both queues; anything already pending
            // skips the await, and a partial arm is torn down so the
            // waiting counters stay balanced.
            let msgs_pending = self.outbound.read_before_poll();
            let acks_pending = self.inbound.ack_before_poll();
            if msgs_pending || acks_pending {
                if !msgs_pending {
                    self.outbound.read_after_poll();
                }
                if !acks_pending {
                    self.inbound.ack_after_poll();
                }
                continue;
            }

            tokio::select! {
                guard = msg_watch.readable() => {
                    let mut guard = guard?;
                    guard.clear_ready();
                }
                guard = ack_watch.readable() => {
                    let mut guard = guard?;
                    guard.clear_ready();
                }
            }

            self.outbound.read_after_poll();
            self.inbound.ack_after_poll();
        }
    }

    /// Detach from the scheduler and drain both queues.
    ///
    /// Pending inbound messages are discarded (their payloads drop, the RT
    /// thread is gone), while pending outbound messages still get a final
    /// dispatch on the calling thread so nothing addressed to the control
    /// side is silently lost. Outstanding acknowledgments are reclaimed.
    /// Safe to call only once the RT thread has stopped iterating.
    pub fn shutdown(&mut self, rtpoll: &mut RtPoll) {
        if let Some(id) = self.rt_item.take() {
            rtpoll.item_free(id);
        }
        // Reap before flushing: flush completes envelopes through the
        // completion rings, which must have room for a full message ring.
        self.inbound.reap();
        self.outbound.reap();
        if !self.inbound.is_dispatching() {
            self.inbound.flush(false);
        }
        if !self.outbound.is_dispatching() {
            self.outbound.flush(true);
        }
        self.inbound.reap();
        self.outbound.reap();
        tracing::debug!("thread mq detached");
    }
}
