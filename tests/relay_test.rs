//! End-to-end relay behaviour against a scripted camera.

use bytes::Bytes;
use mjpeg_relay::capture::{Backoff, CaptureBackend, CaptureConnection, CaptureError, Frame, TestPatternBackend};
use mjpeg_relay::streaming::{ClientSession, FrameDistributor, Relay, RelayHandle};
use mjpeg_relay::{FrameSource, JpegEncoder};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

enum Event {
    Frame,
    ReadFail,
}

/// Camera whose reads are fed one event at a time by the test.
struct ScriptedCamera {
    feed: Arc<Mutex<mpsc::Receiver<Event>>>,
    open_failures: usize,
    opens: Arc<AtomicUsize>,
}

struct ScriptedConnection {
    feed: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl CaptureBackend for ScriptedCamera {
    fn open(&mut self, _url: &str) -> Result<Box<dyn CaptureConnection>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(CaptureError::SourceUnavailable("connection refused".into()));
        }
        Ok(Box::new(ScriptedConnection {
            feed: Arc::clone(&self.feed),
        }))
    }
}

impl CaptureConnection for ScriptedConnection {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.feed.lock().recv() {
            Ok(Event::Frame) => Ok(Frame::new(16, 8, vec![90u8; 16 * 8 * 3])),
            Ok(Event::ReadFail) => Err(CaptureError::FrameReadFailed("socket reset".into())),
            Err(_) => Err(CaptureError::FrameReadFailed("feed closed".into())),
        }
    }
}

struct Harness {
    feed: mpsc::Sender<Event>,
    opens: Arc<AtomicUsize>,
    distributor: Arc<FrameDistributor>,
    cancel: CancellationToken,
    handle: RelayHandle,
}

impl Harness {
    fn start(open_failures: usize) -> Self {
        let (feed, rx) = mpsc::channel();
        let opens = Arc::new(AtomicUsize::new(0));
        let camera = ScriptedCamera {
            feed: Arc::new(Mutex::new(rx)),
            open_failures,
            opens: Arc::clone(&opens),
        };
        let source = FrameSource::new("rtsp://user:pw@camera/stream2", camera)
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)));
        let distributor = Arc::new(FrameDistributor::new());
        let cancel = CancellationToken::new();
        let handle = Relay::new(source, JpegEncoder::default(), Arc::clone(&distributor)).spawn(cancel.clone());

        Self {
            feed,
            opens,
            distributor,
            cancel,
            handle,
        }
    }

    fn send(&self, event: Event) {
        self.feed.send(event).unwrap();
    }

    async fn stop(self) {
        self.cancel.cancel();
        // Unblock a read parked on the feed
        drop(self.feed);
        timeout(RECV_TIMEOUT, self.handle.join()).await.unwrap().unwrap();
    }
}

async fn next_part(session: &mut ClientSession) -> (u64, Bytes) {
    let chunk = timeout(RECV_TIMEOUT, session.recv())
        .await
        .expect("timed out waiting for a part")
        .expect("stream closed");
    (chunk.seq, chunk.bytes.clone())
}

#[tokio::test]
async fn test_reconnect_gap_delivers_five_parts_in_order() {
    let harness = Harness::start(0);
    let mut client = harness.distributor.attach_client("viewer");

    let mut seqs = Vec::new();
    for _ in 0..3 {
        harness.send(Event::Frame);
        let (seq, bytes) = next_part(&mut client).await;
        assert!(bytes.starts_with(HEADER));
        assert!(bytes.ends_with(b"\r\n"));
        seqs.push(seq);
    }

    harness.send(Event::ReadFail);
    assert!(
        timeout(Duration::from_millis(100), client.recv()).await.is_err(),
        "no part may arrive during the outage"
    );

    for _ in 0..2 {
        harness.send(Event::Frame);
        seqs.push(next_part(&mut client).await.0);
    }

    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    assert_eq!(client.delivered(), 5);
    assert_eq!(harness.opens.load(Ordering::SeqCst), 2);

    let stats = harness.handle.stats();
    assert_eq!(stats.source.reconnects, 1);
    assert_eq!(stats.source.read_failures, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_open_failures_are_retried() {
    let harness = Harness::start(2);
    let mut client = harness.distributor.attach_client("viewer");

    harness.send(Event::Frame);
    let (seq, _) = next_part(&mut client).await;
    assert_eq!(seq, 0);

    assert!(harness.opens.load(Ordering::SeqCst) >= 3);
    let stats = harness.handle.stats();
    assert_eq!(stats.source.open_failures, 2);
    assert!(stats.source.connected);

    harness.stop().await;
}

#[tokio::test]
async fn test_idle_then_attach_gets_only_new_frames() {
    let harness = Harness::start(0);

    for _ in 0..4 {
        harness.send(Event::Frame);
    }
    timeout(RECV_TIMEOUT, async {
        while harness.handle.stats().frames_idle < 4 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let stats = harness.handle.stats();
    assert_eq!(stats.frames_encoded, 0);
    assert_eq!(stats.distribution.frames_published, 0);

    let mut client = harness.distributor.attach_client("late");
    harness.send(Event::Frame);
    assert_eq!(next_part(&mut client).await.0, 4);

    harness.stop().await;
}

#[tokio::test]
async fn test_flaky_upstream_never_closes_client_stream() {
    let harness = Harness::start(0);
    let mut client = harness.distributor.attach_client("viewer");

    let script = [true, false, true, true, false, false, true, false, true];
    let mut last = None;
    for ok in script {
        if ok {
            harness.send(Event::Frame);
            let (seq, _) = next_part(&mut client).await;
            if let Some(prev) = last {
                assert!(seq > prev);
            }
            last = Some(seq);
        } else {
            harness.send(Event::ReadFail);
        }
    }

    assert_eq!(client.delivered(), 5);
    assert_eq!(harness.handle.stats().source.read_failures, 4);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_order_with_slow_and_leaving_clients() {
    let distributor = Arc::new(FrameDistributor::new());
    let source = FrameSource::new("test://pattern", TestPatternBackend::new(32, 24, 120));
    let cancel = CancellationToken::new();
    let handle = Relay::new(source, JpegEncoder::default(), Arc::clone(&distributor)).spawn(cancel.clone());

    let collect = |mut session: ClientSession, count: usize, pause: Duration| {
        tokio::spawn(async move {
            let mut seqs = Vec::with_capacity(count);
            while seqs.len() < count {
                seqs.push(next_part(&mut session).await.0);
                sleep(pause).await;
            }
            seqs
        })
    };

    let fast = collect(distributor.attach_client("fast"), 30, Duration::ZERO);
    let slow = collect(distributor.attach_client("slow"), 5, Duration::from_millis(60));
    let leaving = collect(distributor.attach_client("leaving"), 2, Duration::ZERO);

    let leaving = leaving.await.unwrap();
    let fast = fast.await.unwrap();
    let slow = slow.await.unwrap();

    for seqs in [&fast, &slow, &leaving] {
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", seqs);
    }
    // The slow client skipped frames rather than queueing them
    assert!(slow.windows(2).any(|w| w[1] - w[0] > 1), "slow client saw every frame: {:?}", slow);
    assert_eq!(distributor.subscriber_count(), 0);

    cancel.cancel();
    timeout(RECV_TIMEOUT, handle.join()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detach_does_not_stall_remaining_clients() {
    const FPS: u32 = 30;
    let interval = Duration::from_secs(1) / FPS;

    let distributor = Arc::new(FrameDistributor::new());
    let source = FrameSource::new("test://pattern", TestPatternBackend::new(32, 24, FPS));
    let cancel = CancellationToken::new();
    let handle = Relay::new(source, JpegEncoder::default(), Arc::clone(&distributor)).spawn(cancel.clone());

    let mut watcher = distributor.attach_client("watcher");
    let watched = tokio::spawn(async move {
        let mut arrivals = Vec::new();
        while arrivals.len() < 30 {
            let (seq, _) = next_part(&mut watcher).await;
            arrivals.push((seq, Instant::now()));
        }
        arrivals
    });

    let mut leaving = distributor.attach_client("leaving");
    for _ in 0..5 {
        next_part(&mut leaving).await;
    }
    let detach_at = Instant::now();
    distributor.detach_client(leaving);

    let arrivals = watched.await.unwrap();
    let split = arrivals.partition_point(|(_, at)| *at <= detach_at);
    assert!(split > 0 && split < arrivals.len(), "detach not bracketed by watcher parts");

    let (before_seq, _) = arrivals[split - 1];
    let (after_seq, after_at) = arrivals[split];
    let wait = after_at - detach_at;
    assert!(
        wait <= interval * 2 + Duration::from_millis(50),
        "watcher waited {:?} after a detach",
        wait
    );
    assert!(after_seq - before_seq <= 2, "watcher lost frames around detach: {} -> {}", before_seq, after_seq);
    assert_eq!(distributor.subscriber_count(), 0);

    cancel.cancel();
    timeout(RECV_TIMEOUT, handle.join()).await.unwrap().unwrap();
}
