//! Per-domain connection registry.
//!
//! At most one agent holds a domain at any instant. Binding is keyed by
//! token lookup against the store; the map swap itself happens under the
//! domain's entry lock so no interleaving bind can observe two connections
//! for the same domain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use tunely_core::{Message, TunnelError, TunnelResult};
use uuid::Uuid;

use crate::store::{DomainRecord, TunnelMode, TunnelStore};

/// One bound control channel. Created on successful authentication and
/// destroyed on channel close or preemption.
#[derive(Debug)]
pub struct ActiveConnection {
    /// Identity of this binding, distinct per accepted channel.
    pub conn_id: Uuid,
    pub domain: String,
    pub tunnel_id: String,
    pub bound_at: Instant,
    outbound: mpsc::Sender<Message>,
    last_alive: Mutex<Instant>,
    preempt: Notify,
    preempted: AtomicBool,
}

impl ActiveConnection {
    fn new(record: &DomainRecord, outbound: mpsc::Sender<Message>) -> Self {
        let now = Instant::now();
        Self {
            conn_id: Uuid::new_v4(),
            domain: record.domain.clone(),
            tunnel_id: record.tunnel_id.clone(),
            bound_at: now,
            outbound,
            last_alive: Mutex::new(now),
            preempt: Notify::new(),
            preempted: AtomicBool::new(false),
        }
    }

    /// Queue a frame onto the session's single writer.
    pub async fn send(&self, message: Message) -> TunnelResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TunnelError::session_closed("control channel writer is gone"))
    }

    /// Note evidence of liveness from the agent.
    pub fn mark_alive(&self) {
        *self.last_alive.lock().expect("liveness lock poisoned") = Instant::now();
    }

    /// Time since the agent last showed signs of life.
    pub fn since_last_alive(&self) -> std::time::Duration {
        self.last_alive
            .lock()
            .expect("liveness lock poisoned")
            .elapsed()
    }

    /// Resolves once a forcing bind has replaced this connection.
    pub async fn wait_preempted(&self) {
        if self.preempted.load(Ordering::Acquire) {
            return;
        }
        self.preempt.notified().await;
    }

    pub fn is_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    fn signal_preempted(&self) {
        self.preempted.store(true, Ordering::Release);
        self.preempt.notify_one();
    }
}

/// Process-wide `domain → active connection` map.
#[derive(Default)]
pub struct DomainRegistry {
    connections: DashMap<String, Arc<ActiveConnection>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate a token against the store and bind its domain.
    ///
    /// When `force` is set and the domain is already held, the existing
    /// session is signalled to terminate and replaced; its own teardown
    /// fails any in-flight requests.
    pub async fn bind(
        &self,
        store: &TunnelStore,
        token: &str,
        force: bool,
        outbound: mpsc::Sender<Message>,
    ) -> TunnelResult<(Arc<ActiveConnection>, DomainRecord)> {
        let record = store
            .lookup_by_token(token)
            .await?
            .ok_or_else(|| TunnelError::auth_failed("invalid token"))?;

        if !record.enabled {
            return Err(TunnelError::tunnel_disabled("tunnel is disabled"));
        }
        if record.mode != TunnelMode::Http {
            return Err(TunnelError::tunnel_disabled(
                "tunnel is not in http mode",
            ));
        }

        let conn = Arc::new(ActiveConnection::new(&record, outbound));

        match self.connections.entry(record.domain.clone()) {
            Entry::Occupied(mut occupied) => {
                if !force {
                    return Err(TunnelError::already_connected(
                        "an active connection exists for this domain; reconnect with force to preempt it",
                    ));
                }
                let old = occupied.insert(conn.clone());
                old.signal_preempted();
                info!(
                    domain = %record.domain,
                    old_conn = %old.conn_id,
                    new_conn = %conn.conn_id,
                    "connection preempted by forcing bind"
                );
            }
            Entry::Vacant(vacant) => {
                vacant.insert(conn.clone());
                info!(domain = %record.domain, conn = %conn.conn_id, "tunnel bound");
            }
        }

        store.mark_connected(token).await?;
        Ok((conn, record))
    }

    pub fn lookup(&self, domain: &str) -> Option<Arc<ActiveConnection>> {
        self.connections.get(domain).map(|entry| entry.clone())
    }

    /// Remove `conn` if it is still the current holder of its domain.
    /// Idempotent; a connection already replaced by a preemptor is left
    /// untouched.
    pub fn unbind(&self, conn: &ActiveConnection) {
        let removed = self
            .connections
            .remove_if(&conn.domain, |_, current| current.conn_id == conn.conn_id);
        if removed.is_some() {
            info!(domain = %conn.domain, conn = %conn.conn_id, "tunnel unbound");
        } else {
            debug!(domain = %conn.domain, conn = %conn.conn_id, "unbind skipped, no longer current");
        }
    }

    pub fn is_connected(&self, domain: &str) -> bool {
        self.connections.contains_key(domain)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}
