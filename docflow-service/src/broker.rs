//! In-process message channels with broker semantics.
//!
//! Each stage consumes from its own named queue; topics fan out to every
//! queue bound to them. Queues are bounded (publishing applies backpressure),
//! messages expire after a TTL, and deliveries that exhaust their redelivery
//! budget land in the queue's dead-letter store for operator inspection.
//! Dead-lettered messages are never replayed automatically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::events::StageEvent;

/// One delivery attempt of an event on a queue.
#[derive(Debug)]
pub struct Delivery {
    pub event: StageEvent,
    /// How many times this message has been requeued.
    pub redeliveries: u32,
    /// First enqueue time; the TTL is measured against this, not against
    /// requeues, so a bouncing message cannot live forever.
    enqueued_at: Instant,
}

impl Delivery {
    fn new(event: StageEvent) -> Self {
        Self {
            event,
            redeliveries: 0,
            enqueued_at: Instant::now(),
        }
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    Expired,
    RedeliveriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::RedeliveriesExhausted => "redeliveries_exhausted",
        }
    }
}

/// A message parked on a dead-letter store.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: StageEvent,
    pub reason: DeadLetterReason,
    pub dead_at: DateTime<Utc>,
}

/// A bounded queue with a paired dead-letter store.
pub struct Queue {
    name: String,
    tx: mpsc::Sender<Delivery>,
    rx: AsyncMutex<mpsc::Receiver<Delivery>>,
    dead_letters: std::sync::Mutex<Vec<DeadLetter>>,
    message_ttl: Duration,
    max_redeliveries: u32,
}

impl Queue {
    fn new(name: &str, config: &BrokerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            name: name.to_string(),
            tx,
            rx: AsyncMutex::new(rx),
            dead_letters: std::sync::Mutex::new(Vec::new()),
            message_ttl: config.message_ttl(),
            max_redeliveries: config.max_redeliveries,
        }
    }

    /// Receive the next live delivery. Expired messages are dead-lettered
    /// transparently. Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let delivery = self.rx.lock().await.recv().await?;
            if delivery.enqueued_at.elapsed() >= self.message_ttl {
                warn!(
                    queue = %self.name,
                    message_id = %delivery.event.message_id,
                    "Message TTL exceeded, dead-lettering"
                );
                self.dead_letter(delivery.event, DeadLetterReason::Expired);
                continue;
            }
            return Some(delivery);
        }
    }

    /// Return a delivery to the queue after a transport-level failure. Once
    /// the redelivery budget is spent the message is dead-lettered instead.
    pub async fn requeue(&self, mut delivery: Delivery) -> Result<(), BrokerError> {
        delivery.redeliveries += 1;
        if delivery.redeliveries > self.max_redeliveries {
            warn!(
                queue = %self.name,
                message_id = %delivery.event.message_id,
                redeliveries = delivery.redeliveries,
                "Redelivery budget exhausted, dead-lettering"
            );
            self.dead_letter(delivery.event, DeadLetterReason::RedeliveriesExhausted);
            return Ok(());
        }

        debug!(
            queue = %self.name,
            message_id = %delivery.event.message_id,
            redeliveries = delivery.redeliveries,
            "Requeueing message"
        );
        self.tx
            .send(delivery)
            .await
            .map_err(|_| BrokerError::QueueClosed {
                queue: self.name.clone(),
            })
    }

    fn dead_letter(&self, event: StageEvent, reason: DeadLetterReason) {
        counter!(
            "docflow_dead_letters_total",
            "queue" => self.name.clone(),
            "reason" => reason.as_str(),
        )
        .increment(1);
        self.dead_letters.lock().unwrap().push(DeadLetter {
            event,
            reason,
            dead_at: Utc::now(),
        });
    }

    /// Snapshot of the dead-letter store.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().unwrap().clone()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().unwrap().len()
    }

    async fn enqueue(&self, event: StageEvent) -> Result<(), BrokerError> {
        self.tx
            .send(Delivery::new(event))
            .await
            .map_err(|_| BrokerError::QueueClosed {
                queue: self.name.clone(),
            })
    }
}

/// Topic router over named queues.
pub struct Broker {
    queues: DashMap<String, Arc<Queue>>,
    bindings: DashMap<String, Vec<Arc<Queue>>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            queues: DashMap::new(),
            bindings: DashMap::new(),
            config,
        }
    }

    /// Get or create a named queue.
    pub fn declare_queue(&self, name: &str) -> Arc<Queue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Queue::new(name, &self.config)))
            .clone()
    }

    /// Bind a queue to a topic; published events fan out to all bound queues.
    pub fn bind(&self, queue_name: &str, topic: &str) -> Result<(), BrokerError> {
        let queue = self
            .queues
            .get(queue_name)
            .map(|q| q.clone())
            .ok_or_else(|| BrokerError::UnknownQueue {
                queue: queue_name.to_string(),
            })?;
        self.bindings
            .entry(topic.to_string())
            .or_default()
            .push(queue);
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    /// Publish an event to every queue bound to the topic. Blocks while any
    /// bound queue is full, which is the pipeline's backpressure.
    pub async fn publish(&self, topic: &str, event: &StageEvent) -> Result<(), BrokerError> {
        let queues = match self.bindings.get(topic) {
            Some(bound) => bound.clone(),
            None => {
                warn!(topic = %topic, message_id = %event.message_id, "Publish to topic with no bound queues");
                return Ok(());
            }
        };

        for queue in &queues {
            queue.enqueue(event.clone()).await?;
        }

        counter!("docflow_events_published_total", "topic" => topic.to_string()).increment(1);
        debug!(
            topic = %topic,
            message_id = %event.message_id,
            queues = queues.len(),
            "Event published"
        );
        Ok(())
    }
}
