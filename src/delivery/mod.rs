//! Delivery gateway: pushes terminal envelopes to connected clients.
//!
//! WebSocket is the primary path; polling `GET /v1/jobs/{id}` is the
//! fallback (clients may start polling after 90 seconds of silence, every
//! 5 seconds, capped at 5 minutes). Envelopes are routed by
//! (tenant, user) and forwarded verbatim; each connection de-duplicates by
//! job ID because bus delivery is at-least-once.

mod ws;

pub use ws::ws_handler;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc, watch};
use tokio_stream::StreamExt;

use crate::bus::{BusTopic, Envelope, EventBus};
use crate::error::BusError;

const CLIENT_BUFFER: usize = 64;

struct Client {
    tenant_id: String,
    user_id: String,
    tx: mpsc::Sender<Envelope>,
}

/// Fan-out hub from the bus to connected sockets.
#[derive(Default)]
pub struct DeliveryGateway {
    clients: RwLock<HashMap<u64, Client>>,
    next_id: AtomicU64,
}

impl DeliveryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client; returns its handle ID and envelope stream.
    pub async fn register(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> (u64, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().await.insert(
            id,
            Client {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                tx,
            },
        );
        tracing::debug!(client = id, tenant_id, user_id, "delivery client attached");
        (id, rx)
    }

    pub async fn deregister(&self, id: u64) {
        self.clients.write().await.remove(&id);
        tracing::debug!(client = id, "delivery client detached");
    }

    /// Route one envelope to every matching client. Returns how many
    /// received it.
    pub async fn dispatch(&self, envelope: &Envelope) -> usize {
        let (tenant_id, user_id) = envelope.routing();
        let clients = self.clients.read().await;

        let mut delivered = 0;
        for client in clients.values() {
            if client.tenant_id != tenant_id || client.user_id != user_id {
                continue;
            }
            // A slow client drops envelopes rather than stalling the hub;
            // polling covers the gap.
            if client.tx.try_send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Subscribe and spawn the forwarding loop. The subscription is live
    /// before this returns.
    pub async fn start(
        self: Arc<Self>,
        bus: Arc<dyn EventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<tokio::task::JoinHandle<()>, BusError> {
        let stream = bus.subscribe(BusTopic::Terminal).await?;
        tracing::info!("delivery gateway started");
        Ok(tokio::spawn(self.consume(stream, shutdown)))
    }

    async fn consume(
        self: Arc<Self>,
        mut stream: crate::bus::EnvelopeStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                envelope = stream.next() => {
                    let Some(envelope) = envelope else {
                        return;
                    };
                    let delivered = self.dispatch(&envelope).await;
                    tracing::debug!(
                        job_id = %envelope.job_id(),
                        delivered,
                        "terminal envelope dispatched"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("delivery gateway shutting down");
                        return;
                    }
                }
            }
        }
    }
}
