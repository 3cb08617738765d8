//! # Quaver
//!
//! The real-time data-movement substrate of a sound server: the layer that
//! lets a latency-critical audio thread exchange buffers and control messages
//! with non-real-time control threads without taking locks.
//!
//! ## Features
//!
//! - **Zero-copy buffers**: refcounted [`memory::MemBlock`]s with bounded
//!   [`memory::MemChunk`] views and explicit copy-on-write
//! - **Wait-free SPSC queues**: [`asyncq::AsyncQueue`] with eventfd-backed
//!   blocking semantics via [`fdsem::FdSem`]
//! - **Typed control messages**: [`msgq::AsyncMsgQueue`] envelopes with
//!   producer/consumer completion signaling
//! - **RT scheduling**: [`rtpoll::RtPoll`] merges descriptors, timers and
//!   queue wakeups into one `poll()` per iteration
//! - **Thread pairing**: [`thread_mq::ThreadMq`] wires a queue pair into a
//!   Tokio control loop on one side and an [`rtpoll::RtPoll`] on the other
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quaver::prelude::*;
//!
//! let mut rtpoll = RtPoll::new();
//! let mq = Arc::new(ThreadMq::new(&mut rtpoll)?);
//!
//! // Control thread: post a message to the RT thread
//! mq.post_to_rt(Some(sink), CODE_SET_VOLUME, Some(Box::new(0.5f32)), 0, None)?;
//!
//! // RT thread: one scheduler iteration dispatches it
//! rtpoll.run(None)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod asyncq;
pub mod error;
pub mod fdsem;
pub mod hook;
pub mod memory;
pub mod msgq;
pub mod rtpoll;
pub mod sink;
pub mod thread_mq;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::asyncq::AsyncQueue;
    pub use crate::error::{Error, Result};
    pub use crate::fdsem::FdSem;
    pub use crate::hook::{Hook, HookResult, HookSlot};
    pub use crate::memory::{BlockStats, MemBlock, MemChunk};
    pub use crate::msgq::{AsyncMsgQueue, Envelope, MsgObject};
    pub use crate::rtpoll::{BeforeResult, RtPoll, RtPriority, RunState, WorkResult};
    pub use crate::sink::{RenderSource, SampleSpec, Sink, SinkInput};
    pub use crate::thread_mq::ThreadMq;
}

pub use error::{Error, Result};
