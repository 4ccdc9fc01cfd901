/// Zero-copy fan-out of framed MJPEG parts to HTTP clients
///
/// One broadcast channel of depth 1 is shared by every client. Publishing
/// never blocks: a client that has not taken the previous part when the
/// next one arrives lags, and its next receive yields the newest part.
/// This is the overwrite-on-full single-slot queue per client, without a
/// lock on the publish path.
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A framed multipart part ready for the wire, with its capture order.
#[derive(Debug)]
pub struct FramedChunk {
    pub seq: u64,
    pub bytes: Bytes,
}

/// Statistics for monitoring frame distribution
#[derive(Debug, Clone, Default, Serialize)]
pub struct DistributorStats {
    pub frames_published: u64,
    pub frames_unobserved: u64,
    pub clients: usize,
    pub clients_attached_total: u64,
}

pub struct FrameDistributor {
    tx: broadcast::Sender<Arc<FramedChunk>>,
    next_client_id: AtomicU64,
    frames_published: AtomicU64,
    frames_unobserved: AtomicU64,
}

impl FrameDistributor {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self {
            tx,
            next_client_id: AtomicU64::new(1),
            frames_published: AtomicU64::new(0),
            frames_unobserved: AtomicU64::new(0),
        }
    }

    /// Publish a part to every attached client without waiting on any of them.
    ///
    /// Returns the number of clients the part was offered to.
    pub fn publish(&self, seq: u64, bytes: Bytes) -> usize {
        match self.tx.send(Arc::new(FramedChunk { seq, bytes })) {
            Ok(n) => {
                self.frames_published.fetch_add(1, Ordering::Relaxed);
                debug!(seq, clients = n, "Frame published");
                n
            }
            Err(_) => {
                self.frames_unobserved.fetch_add(1, Ordering::Relaxed);
                debug!(seq, "Frame dropped - no clients");
                0
            }
        }
    }

    /// Register a downstream consumer. Never blocks; the session sees
    /// only parts published after this call.
    pub fn attach_client(&self, peer: impl Into<String>) -> ClientSession {
        let rx = self.tx.subscribe();
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let peer = peer.into();
        info!(client = id, peer = %peer, clients = self.subscriber_count(), "Client attached");
        ClientSession {
            id,
            peer,
            rx,
            delivered: 0,
            skipped: 0,
            last_seq: None,
        }
    }

    /// Deregister a consumer; equivalent to dropping the session.
    pub fn detach_client(&self, session: ClientSession) {
        drop(session);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> DistributorStats {
        DistributorStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_unobserved: self.frames_unobserved.load(Ordering::Relaxed),
            clients: self.subscriber_count(),
            clients_attached_total: self.next_client_id.load(Ordering::Relaxed) - 1,
        }
    }
}

impl Default for FrameDistributor {
    fn default() -> Self {
        Self::new()
    }
}

/// One open streaming response.
///
/// Parts arrive in capture order; parts published while this client was
/// still writing an earlier one are skipped, never queued.
pub struct ClientSession {
    id: u64,
    peer: String,
    rx: broadcast::Receiver<Arc<FramedChunk>>,
    delivered: u64,
    skipped: u64,
    last_seq: Option<u64>,
}

impl ClientSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Next part for this client, or `None` once the relay has stopped.
    pub async fn recv(&mut self) -> Option<Arc<FramedChunk>> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => {
                    self.delivered += 1;
                    self.last_seq = Some(chunk.seq);
                    return Some(chunk);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.skipped += n;
                    debug!(client = self.id, skipped = n, "Slow client skipped frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        info!(
            client = self.id,
            peer = %self.peer,
            delivered = self.delivered,
            skipped = self.skipped,
            "Client detached"
        );
    }
}
