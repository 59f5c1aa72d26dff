//! Event bus capability.
//!
//! Delivery is at-least-once: consumers must de-duplicate by job ID. Ordering
//! is preserved per publisher, which is sufficient for the per-job guarantee
//! (a job's terminal envelope is published after its created envelope by the
//! same actor chain).

mod envelope;

pub use envelope::{
    AnalysisCreated, Envelope, MessageCompleted, MessageCreated, MessageFailed,
};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::BusError;

/// Which envelopes a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTopic {
    /// `message.created` / `analysis.created` — consumed by the worker.
    Created,
    /// `message.completed` / `message.failed` — consumed by delivery.
    Terminal,
}

impl BusTopic {
    fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            BusTopic::Created => !envelope.is_terminal(),
            BusTopic::Terminal => envelope.is_terminal(),
        }
    }
}

/// Stream of envelopes for one subscriber.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// Event bus capability trait.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    async fn subscribe(&self, topic: BusTopic) -> Result<EnvelopeStream, BusError>;
}

const CHANNEL_CAPACITY: usize = 256;

/// In-memory bus for tests and single-process runs.
///
/// `duplicate_deliveries` makes every publish deliver twice, exercising the
/// consumers' de-duplication paths the way a redelivering broker would.
pub struct MemoryBus {
    subscribers: Mutex<Vec<(BusTopic, mpsc::Sender<Envelope>)>>,
    duplicate_deliveries: bool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            duplicate_deliveries: false,
        }
    }

    /// Bus that redelivers every envelope once.
    pub fn with_duplicate_deliveries() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            duplicate_deliveries: true,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock().await;
        // Drop subscribers whose receiving end is gone.
        subscribers.retain(|(_, tx)| !tx.is_closed());

        let copies = if self.duplicate_deliveries { 2 } else { 1 };
        for (topic, tx) in subscribers.iter() {
            if !topic.matches(&envelope) {
                continue;
            }
            for _ in 0..copies {
                tx.send(envelope.clone())
                    .await
                    .map_err(|e| BusError::Publish {
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: BusTopic) -> Result<EnvelopeStream, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.lock().await.push((topic, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
