//! Pending table: broker-side state for in-flight forwards.
//!
//! An entry lives from the moment its `request` frame is dispatched until a
//! terminal outcome: unary response, stream end, timeout, cancellation, or
//! loss of the owning session. The entry's kind is provisional; the first
//! frame that arrives for the id settles it as unary or stream.

use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use tunely_core::{Headers, TunnelError};
use uuid::Uuid;

/// Unary outcome of a forward: the agent's `response` frame.
#[derive(Debug)]
pub struct UnaryResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Events delivered on a settled stream, after its `stream_start`.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk { data: String, sequence: u64 },
    End {
        error: Option<String>,
        duration_ms: Option<u64>,
        total_chunks: Option<u64>,
    },
}

/// Handle returned to the dispatcher when the first frame is `stream_start`.
pub struct StreamHandle {
    pub status: u16,
    pub headers: Headers,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Resolution of the discriminated first-frame await.
pub enum FirstReply {
    Unary(UnaryResponse),
    Stream(StreamHandle),
    Failed(TunnelError),
}

enum Waiter {
    /// Nothing received yet; the dispatcher is parked on the oneshot.
    AwaitingFirst(oneshot::Sender<FirstReply>),
    /// `stream_start` arrived; chunks flow through the bounded queue.
    Streaming(mpsc::Sender<StreamEvent>),
}

struct PendingEntry {
    owner: Uuid,
    deadline: Instant,
    waiter: Waiter,
}

/// Process-wide `request id → waiter` map.
pub struct PendingTable {
    entries: DashMap<String, PendingEntry>,
    stream_queue_depth: usize,
}

impl PendingTable {
    pub fn new(stream_queue_depth: usize) -> Self {
        Self {
            entries: DashMap::new(),
            stream_queue_depth,
        }
    }

    /// Allocate a fresh id and park a waiter for its first reply.
    pub fn create(
        &self,
        owner: Uuid,
        deadline: Instant,
    ) -> (String, oneshot::Receiver<FirstReply>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id.clone(),
            PendingEntry {
                owner,
                deadline,
                waiter: Waiter::AwaitingFirst(tx),
            },
        );
        (id, rx)
    }

    /// Deliver a unary `response` frame. Unknown ids are dropped; a
    /// response arriving on an already-streaming entry is a protocol fault
    /// that terminates the stream.
    pub fn deliver_response(&self, id: &str, response: UnaryResponse) {
        let Some((_, entry)) = self.entries.remove(id) else {
            debug!(id, "dropping response for unknown request id");
            return;
        };
        match entry.waiter {
            Waiter::AwaitingFirst(tx) => {
                let _ = tx.send(FirstReply::Unary(response));
            }
            Waiter::Streaming(tx) => {
                warn!(id, "unary response on a streaming entry");
                let _ = tx.try_send(StreamEvent::End {
                    error: Some("protocol_error".to_string()),
                    duration_ms: None,
                    total_chunks: None,
                });
            }
        }
    }

    /// Deliver a `stream_start` frame, settling the entry as a stream.
    pub fn deliver_stream_start(&self, id: &str, status: u16, headers: Headers) {
        let Some(mut entry) = self.entries.get_mut(id) else {
            debug!(id, "dropping stream_start for unknown request id");
            return;
        };
        let (tx, rx) = mpsc::channel(self.stream_queue_depth);
        match std::mem::replace(&mut entry.waiter, Waiter::Streaming(tx)) {
            Waiter::AwaitingFirst(first) => {
                let _ = first.send(FirstReply::Stream(StreamHandle {
                    status,
                    headers,
                    events: rx,
                }));
            }
            Waiter::Streaming(old) => {
                // Duplicate start: keep the original queue, drop the frame.
                warn!(id, "duplicate stream_start dropped");
                entry.waiter = Waiter::Streaming(old);
            }
        }
    }

    /// Deliver a `stream_chunk` frame. Blocks when the bounded queue is
    /// full, which back-pressures the session reader and, through it, the
    /// agent's writer. Chunks never overtake each other: the single session
    /// reader delivers them in arrival order.
    pub async fn deliver_stream_chunk(&self, id: &str, data: String, sequence: u64) {
        let tx = match self.entries.get(id) {
            Some(entry) => match &entry.waiter {
                Waiter::Streaming(tx) => tx.clone(),
                Waiter::AwaitingFirst(_) => {
                    warn!(id, sequence, "stream_chunk before stream_start dropped");
                    return;
                }
            },
            None => {
                debug!(id, sequence, "dropping chunk for unknown request id");
                return;
            }
        };
        // The map guard is released; a slow consumer only stalls this id.
        if tx.send(StreamEvent::Chunk { data, sequence }).await.is_err() {
            // Consumer went away (timeout or client disconnect); the entry
            // is dead, discard further frames eagerly.
            self.entries.remove(id);
        }
    }

    /// Deliver a `stream_end` frame and retire the entry.
    pub async fn deliver_stream_end(
        &self,
        id: &str,
        error: Option<String>,
        duration_ms: Option<u64>,
        total_chunks: Option<u64>,
    ) {
        let tx = match self.entries.get(id) {
            Some(entry) => match &entry.waiter {
                Waiter::Streaming(tx) => tx.clone(),
                Waiter::AwaitingFirst(_) => {
                    warn!(id, "stream_end before stream_start dropped");
                    return;
                }
            },
            None => {
                debug!(id, "dropping stream_end for unknown request id");
                return;
            }
        };
        let _ = tx
            .send(StreamEvent::End {
                error,
                duration_ms,
                total_chunks,
            })
            .await;
        self.entries.remove(id);
    }

    /// Remove an entry and fail its waiter. A no-op on completed entries.
    pub fn cancel(&self, id: &str, reason: TunnelError) {
        let Some((_, entry)) = self.entries.remove(id) else {
            return;
        };
        debug!(
            id,
            reason = reason.kind.code(),
            overdue = entry.deadline.elapsed() > std::time::Duration::ZERO,
            "pending entry cancelled"
        );
        match entry.waiter {
            Waiter::AwaitingFirst(tx) => {
                let _ = tx.send(FirstReply::Failed(reason));
            }
            Waiter::Streaming(tx) => {
                let _ = tx.try_send(StreamEvent::End {
                    error: Some(reason.kind.code().to_string()),
                    duration_ms: None,
                    total_chunks: None,
                });
            }
        }
    }

    /// Fail every entry dispatched on a lost session.
    pub fn fail_all_owned_by(&self, owner: Uuid, reason_for: impl Fn() -> TunnelError) {
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| entry.key().clone())
            .collect();
        for id in owned {
            self.cancel(&id, reason_for());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table() -> PendingTable {
        PendingTable::new(8)
    }

    fn unary(status: u16) -> UnaryResponse {
        UnaryResponse {
            status,
            headers: Headers::new(),
            body: Some("pong".to_string()),
            error: None,
            duration_ms: Some(5),
        }
    }

    #[tokio::test]
    async fn unary_delivery_wakes_waiter() {
        let table = table();
        let owner = Uuid::new_v4();
        let (id, rx) = table.create(owner, Instant::now() + Duration::from_secs(1));

        table.deliver_response(&id, unary(200));
        match rx.await.unwrap() {
            FirstReply::Unary(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.body.as_deref(), Some("pong"));
            }
            _ => panic!("expected unary reply"),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_dropped_silently() {
        let table = table();
        table.deliver_response("nope", unary(200));
        table.deliver_stream_chunk("nope", "x".to_string(), 0).await;
        table.deliver_stream_end("nope", None, None, None).await;
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn stream_sequence_is_ordered() {
        let table = table();
        let owner = Uuid::new_v4();
        let (id, rx) = table.create(owner, Instant::now() + Duration::from_secs(1));

        table.deliver_stream_start(&id, 200, Headers::new());
        for seq in 0..3u64 {
            table
                .deliver_stream_chunk(&id, format!("data: {seq}\n\n"), seq)
                .await;
        }
        table.deliver_stream_end(&id, None, Some(12), Some(3)).await;

        let mut handle = match rx.await.unwrap() {
            FirstReply::Stream(handle) => handle,
            _ => panic!("expected stream reply"),
        };
        assert_eq!(handle.status, 200);

        let mut seen = Vec::new();
        while let Some(event) = handle.events.recv().await {
            match event {
                StreamEvent::Chunk { sequence, .. } => seen.push(sequence),
                StreamEvent::End { total_chunks, .. } => {
                    assert_eq!(total_chunks, Some(3));
                    break;
                }
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn chunk_before_start_is_dropped() {
        let table = table();
        let owner = Uuid::new_v4();
        let (id, rx) = table.create(owner, Instant::now() + Duration::from_secs(1));

        table.deliver_stream_chunk(&id, "early".to_string(), 0).await;
        // Entry still settles normally afterwards.
        table.deliver_response(&id, unary(204));
        assert!(matches!(rx.await.unwrap(), FirstReply::Unary(r) if r.status == 204));
    }

    #[tokio::test]
    async fn cancel_fails_waiter_and_is_idempotent() {
        let table = table();
        let owner = Uuid::new_v4();
        let (id, rx) = table.create(owner, Instant::now());

        table.cancel(&id, TunnelError::request_timeout("request timeout"));
        match rx.await.unwrap() {
            FirstReply::Failed(err) => {
                assert_eq!(err.kind, tunely_core::ErrorKind::RequestTimeout)
            }
            _ => panic!("expected failure"),
        }

        // Late frames and repeated cancels are no-ops.
        table.deliver_response(&id, unary(200));
        table.cancel(&id, TunnelError::request_timeout("again"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn session_loss_fails_only_owned_entries() {
        let table = table();
        let lost = Uuid::new_v4();
        let survivor = Uuid::new_v4();

        let (_id_a, rx_a) = table.create(lost, Instant::now() + Duration::from_secs(1));
        let (_id_b, rx_b) = table.create(survivor, Instant::now() + Duration::from_secs(1));

        table.fail_all_owned_by(lost, || TunnelError::session_closed("session closed"));

        assert!(matches!(rx_a.await.unwrap(), FirstReply::Failed(_)));
        assert_eq!(table.len(), 1);
        drop(rx_b);
    }

    #[tokio::test]
    async fn unary_on_streaming_entry_ends_stream_with_protocol_error() {
        let table = table();
        let owner = Uuid::new_v4();
        let (id, rx) = table.create(owner, Instant::now() + Duration::from_secs(1));

        table.deliver_stream_start(&id, 200, Headers::new());
        let mut handle = match rx.await.unwrap() {
            FirstReply::Stream(handle) => handle,
            _ => panic!("expected stream reply"),
        };

        table.deliver_response(&id, unary(200));
        match handle.events.recv().await.unwrap() {
            StreamEvent::End { error, .. } => {
                assert_eq!(error.as_deref(), Some("protocol_error"))
            }
            _ => panic!("expected end event"),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn dead_consumer_discards_entry() {
        let table = table();
        let owner = Uuid::new_v4();
        let (id, rx) = table.create(owner, Instant::now() + Duration::from_secs(1));

        table.deliver_stream_start(&id, 200, Headers::new());
        let handle = match rx.await.unwrap() {
            FirstReply::Stream(handle) => handle,
            _ => panic!("expected stream reply"),
        };
        drop(handle); // public client went away

        table.deliver_stream_chunk(&id, "x".to_string(), 0).await;
        assert!(table.is_empty());
    }
}
