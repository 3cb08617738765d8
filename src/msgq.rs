//! Typed control-message envelopes over SPSC queues.
//!
//! An [`AsyncMsgQueue`] carries [`Envelope`]s — target object, opcode,
//! payload, offset, optional [`MemChunk`] — from a producer context to a
//! consumer context, with explicit completion signaling:
//!
//! - [`AsyncMsgQueue::post`] is fire-and-forget; the envelope comes back to
//!   the producer side through the completion ring once the consumer calls
//!   [`AsyncMsgQueue::done`], so payloads are reclaimed on the producer side
//!   and acknowledgments are observable through a pollable descriptor.
//! - [`AsyncMsgQueue::send`] blocks until the consumer acknowledges and
//!   returns the consumer's result code.
//!
//! The consumer drains with [`AsyncMsgQueue::get`], invokes handlers with
//! [`AsyncMsgQueue::dispatch`], and must complete every dequeued envelope
//! with [`AsyncMsgQueue::done`].

use crate::asyncq::AsyncQueue;
use crate::error::{Error, Result};
use crate::memory::MemChunk;
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Result code returned by a rejected or targetless dispatch.
pub const DISPATCH_FAILED: i32 = -1;

/// An object that can receive control messages on the consumer side.
pub trait MsgObject: Send + Sync {
    /// Handle one message. Returns 0 on success, a negative code on error;
    /// the value travels back to a blocked [`AsyncMsgQueue::send`] caller.
    fn process(
        &self,
        code: u32,
        payload: Option<&mut (dyn Any + Send)>,
        offset: i64,
        chunk: Option<&MemChunk>,
    ) -> i32;
}

enum Reply {
    /// Fire-and-forget; the envelope returns through the completion ring.
    Post,
    /// A producer is blocked waiting for the result.
    Send(Arc<SendWaiter>),
}

#[derive(Default)]
struct SendWaiter {
    result: Mutex<Option<i32>>,
    cond: Condvar,
}

impl SendWaiter {
    fn complete(&self, result: i32) {
        *self.result.lock().unwrap() = Some(result);
        self.cond.notify_one();
    }

    fn wait(&self) -> i32 {
        let mut guard = self.result.lock().unwrap();
        loop {
            if let Some(result) = *guard {
                return result;
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

/// A message unit carrying a target, opcode, payload and optional memory
/// chunk between threads.
///
/// The `offset` field is an opaque 64-bit value passed through to the
/// handler untouched (typically a byte position or timestamp).
pub struct Envelope {
    /// The object whose handler the consumer invokes.
    pub target: Option<Arc<dyn MsgObject>>,
    /// Operation code, interpreted by the target.
    pub code: u32,
    /// Opaque payload; dropped (releasing its resources) when the envelope
    /// dies.
    pub payload: Option<Box<dyn Any + Send>>,
    /// Opaque 64-bit argument.
    pub offset: i64,
    /// Audio data riding along with the message.
    pub chunk: Option<MemChunk>,
    result: i32,
    reply: Reply,
}

impl Envelope {
    /// The result code recorded by dispatch/done.
    pub fn result(&self) -> i32 {
        self.result
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("code", &self.code)
            .field("offset", &self.offset)
            .field("has_target", &self.target.is_some())
            .field("has_payload", &self.payload.is_some())
            .field("has_chunk", &self.chunk.is_some())
            .finish()
    }
}

/// A typed envelope queue with completion signaling.
///
/// Built from two [`AsyncQueue`]s: `messages` (producer → consumer) and
/// `completions` (consumer → producer). The producer side may be shared by
/// several control threads — enqueues are serialized internally so the
/// underlying rings still see a single logical producer. The consumer side
/// belongs to exactly one thread.
pub struct AsyncMsgQueue {
    messages: AsyncQueue<Envelope>,
    completions: AsyncQueue<Envelope>,
    dispatching: AtomicBool,
    /// Serializes whole send operations (at most one outstanding send).
    send_lock: Mutex<()>,
    /// Serializes enqueues from multiple producer threads.
    producer_lock: Mutex<()>,
}

impl AsyncMsgQueue {
    /// Create a queue pair; `capacity` 0 selects the default ring size.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            messages: AsyncQueue::new(capacity)?,
            completions: AsyncQueue::new(capacity)?,
            dispatching: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            producer_lock: Mutex::new(()),
        })
    }

    /// Post a message without blocking (fire-and-forget).
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] when the message ring is full; the
    /// caller decides retry or drop policy.
    pub fn post(
        &self,
        target: Option<Arc<dyn MsgObject>>,
        code: u32,
        payload: Option<Box<dyn Any + Send>>,
        offset: i64,
        chunk: Option<MemChunk>,
    ) -> Result<()> {
        let env = Box::new(Envelope {
            target,
            code,
            payload,
            offset,
            chunk,
            result: 0,
            reply: Reply::Post,
        });
        let _guard = self.producer_lock.lock().unwrap();
        self.messages.try_push(env).map_err(|_| Error::QueueFull)
    }

    /// Post a message and block until the consumer acknowledges it with
    /// [`AsyncMsgQueue::done`]; returns the consumer's result code.
    ///
    /// Must not be called from the consumer (real-time) thread: it blocks
    /// without a deadline.
    pub fn send(
        &self,
        target: Option<Arc<dyn MsgObject>>,
        code: u32,
        payload: Option<Box<dyn Any + Send>>,
        offset: i64,
        chunk: Option<MemChunk>,
    ) -> i32 {
        let _send = self.send_lock.lock().unwrap();
        let waiter = Arc::new(SendWaiter::default());
        let env = Box::new(Envelope {
            target,
            code,
            payload,
            offset,
            chunk,
            result: 0,
            reply: Reply::Send(Arc::clone(&waiter)),
        });
        {
            let _guard = self.producer_lock.lock().unwrap();
            self.messages.push(env);
        }
        waiter.wait()
    }

    /// Dequeue the next envelope (consumer side).
    ///
    /// Every returned envelope must be handed back through
    /// [`AsyncMsgQueue::done`] once handled.
    pub fn get(&self, wait: bool) -> Option<Box<Envelope>> {
        if wait {
            Some(self.messages.pop())
        } else {
            self.messages.try_pop()
        }
    }

    /// Invoke the target's handler for the envelope's opcode.
    pub fn dispatch(&self, env: &mut Envelope) -> i32 {
        self.dispatching.store(true, Ordering::Release);
        let result = match &env.target {
            Some(target) => {
                let payload = env.payload.as_mut().map(|p| p.as_mut());
                target.process(env.code, payload, env.offset, env.chunk.as_ref())
            }
            None => {
                tracing::warn!(code = env.code, "message without a target");
                DISPATCH_FAILED
            }
        };
        self.dispatching.store(false, Ordering::Release);
        env.result = result;
        result
    }

    /// Complete a dequeued envelope, releasing any producer blocked in
    /// [`AsyncMsgQueue::send`].
    ///
    /// Posted envelopes travel back through the completion ring, where the
    /// producer side reclaims them with [`AsyncMsgQueue::reap`]. Every
    /// posted envelope comes back: if the completion ring is full, this
    /// blocks until the producer reaps.
    pub fn done(&self, mut env: Box<Envelope>, result: i32) {
        env.result = result;
        match std::mem::replace(&mut env.reply, Reply::Post) {
            Reply::Send(waiter) => waiter.complete(result),
            Reply::Post => self.completions.push(env),
        }
    }

    /// Drain the message ring, dispatching (`run = true`) or discarding
    /// each envelope.
    ///
    /// Safe to call while the queue is mid-dispatch: the reentrant call
    /// returns immediately instead of recursively draining.
    pub fn flush(&self, run: bool) {
        if self.dispatching.load(Ordering::Acquire) {
            return;
        }
        while let Some(mut env) = self.get(false) {
            let result = if run {
                self.dispatch(&mut env)
            } else {
                DISPATCH_FAILED
            };
            self.done(env, result);
        }
    }

    /// Whether a dispatch is currently in progress on the consumer side.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::Acquire)
    }

    /// Producer side: drain the completion ring, dropping finished
    /// envelopes (and their payloads). Returns the number of
    /// acknowledgments observed.
    pub fn reap(&self) -> usize {
        let mut n = 0;
        while let Some(env) = self.completions.try_pop() {
            tracing::trace!(code = env.code, result = env.result, "reaped completion");
            drop(env);
            n += 1;
        }
        n
    }

    /// Consumer-side descriptor: readable when messages are queued.
    pub fn read_fd(&self) -> RawFd {
        self.messages.read_fd()
    }

    /// Consumer-side poll arming; see [`AsyncQueue::read_before_poll`].
    pub fn read_before_poll(&self) -> bool {
        self.messages.read_before_poll()
    }

    /// Consumer-side poll teardown.
    pub fn read_after_poll(&self) -> bool {
        self.messages.read_after_poll()
    }

    /// Producer-side descriptor: readable when completions are queued.
    pub fn ack_fd(&self) -> RawFd {
        self.completions.read_fd()
    }

    /// Producer-side poll arming over the completion ring.
    pub fn ack_before_poll(&self) -> bool {
        self.completions.read_before_poll()
    }

    /// Producer-side poll teardown over the completion ring.
    pub fn ack_after_poll(&self) -> bool {
        self.completions.read_after_poll()
    }
}
