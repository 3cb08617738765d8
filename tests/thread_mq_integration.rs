//! End-to-end tests for the thread message-queue pairing.
//!
//! These tests run a real scheduler loop on a dedicated thread and a Tokio
//! control task on the other side, exercising the full post, dispatch,
//! done, acknowledgment cycle across both queues.

use quaver::memory::MemChunk;
use quaver::msgq::MsgObject;
use quaver::rtpoll::RtPoll;
use quaver::thread_mq::ThreadMq;
use std::any::Any;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

const CODE_APPLY: u32 = 42;
const CODE_APPLIED: u32 = 43;
const CODE_ALL_DONE: u32 = 99;

/// Payload whose drop is observable, so tests can verify that posted
/// envelopes are reclaimed on the control side after acknowledgment.
struct TrackedPayload {
    data: [u8; 16],
    dropped: Arc<AtomicBool>,
}

impl Drop for TrackedPayload {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// RT-side message target that reports back to the control loop.
struct RtObject {
    mq: Arc<ThreadMq>,
    hits: AtomicU32,
    expected: u32,
}

impl MsgObject for RtObject {
    fn process(
        &self,
        code: u32,
        payload: Option<&mut (dyn Any + Send)>,
        _offset: i64,
        _chunk: Option<&MemChunk>,
    ) -> i32 {
        match code {
            CODE_APPLY => {
                let payload = payload
                    .and_then(|p| p.downcast_mut::<TrackedPayload>())
                    .expect("apply carries a tracked payload");
                assert_eq!(payload.data, [7u8; 16]);
                self.mq
                    .post_to_control(None, CODE_APPLIED, None, 0, None)
                    .unwrap();
                0
            }
            _ => {
                let n = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
                if n == self.expected {
                    self.mq
                        .post_to_control(None, CODE_ALL_DONE, None, n as i64, None)
                        .unwrap();
                }
                0
            }
        }
    }
}

fn spawn_rt(mut rtpoll: RtPoll, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            rtpoll.run(Some(Duration::from_millis(5))).unwrap();
        }
    })
}

/// One message travels control -> RT, is dispatched there, the RT thread
/// reports back, and the acknowledgment releases the payload on the
/// control side.
#[tokio::test(flavor = "multi_thread")]
async fn test_post_dispatch_acknowledge_cycle() {
    init_tracing();
    let mut rtpoll = RtPoll::new();
    let mq = Arc::new(ThreadMq::new(&mut rtpoll, 64).unwrap());
    let target = Arc::new(RtObject {
        mq: Arc::clone(&mq),
        hits: AtomicU32::new(0),
        expected: 0,
    });

    let stop = Arc::new(AtomicBool::new(false));
    let rt = spawn_rt(rtpoll, Arc::clone(&stop));

    let dropped = Arc::new(AtomicBool::new(false));
    mq.post_to_rt(
        Some(target),
        CODE_APPLY,
        Some(Box::new(TrackedPayload {
            data: [7u8; 16],
            dropped: Arc::clone(&dropped),
        })),
        0,
        None,
    )
    .unwrap();

    let result = mq
        .run_control(|env| {
            assert_eq!(env.code, CODE_APPLIED);
            ControlFlow::Break(0)
        })
        .await
        .unwrap();
    assert_eq!(result, 0);

    // The ack may land just after the control loop broke; keep reaping
    // until the payload comes home.
    for _ in 0..200 {
        if dropped.load(Ordering::SeqCst) {
            break;
        }
        mq.inbound().reap();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(
        dropped.load(Ordering::SeqCst),
        "payload reclaimed on the control side after acknowledgment"
    );

    stop.store(true, Ordering::SeqCst);
    rt.join().unwrap();
}

/// A burst of posts is dispatched in order by the RT loop without losing
/// any, and the RT side signals completion back to the control task.
#[tokio::test(flavor = "multi_thread")]
async fn test_post_burst_all_dispatched() {
    init_tracing();
    const BURST: u32 = 500;

    let mut rtpoll = RtPoll::new();
    let mq = Arc::new(ThreadMq::new(&mut rtpoll, 1024).unwrap());
    let target = Arc::new(RtObject {
        mq: Arc::clone(&mq),
        hits: AtomicU32::new(0),
        expected: BURST,
    });

    let stop = Arc::new(AtomicBool::new(false));
    let rt = spawn_rt(rtpoll, Arc::clone(&stop));

    for i in 0..BURST {
        mq.post_to_rt(Some(target.clone()), 1000 + i, None, i as i64, None)
            .unwrap();
    }

    mq.run_control(|env| {
        assert_eq!(env.code, CODE_ALL_DONE);
        assert_eq!(env.offset, BURST as i64);
        ControlFlow::Break(0)
    })
    .await
    .unwrap();

    assert_eq!(target.hits.load(Ordering::SeqCst), BURST);

    stop.store(true, Ordering::SeqCst);
    rt.join().unwrap();
}
