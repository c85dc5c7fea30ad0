//! Manual-review tickets for failures that need an operator.
//!
//! Tickets are delivered by a single background worker reading from a
//! bounded channel. Raising a ticket never blocks the saga: when the channel
//! is full the ticket is dropped and the drop is logged and counted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::SagaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    /// A step's side effect could not be reversed (e.g. a refund already sent).
    IrreversibleSideEffect,
    /// At least one compensation returned an error.
    CompensationFailed,
    /// The recovery worker gave up on the saga.
    DeadLettered,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::IrreversibleSideEffect => "irreversible_side_effect",
            ReviewReason::CompensationFailed => "compensation_failed",
            ReviewReason::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewTicket {
    pub saga_id: SagaId,
    pub business_id: String,
    pub saga_type: String,
    pub step: Option<String>,
    pub reason: ReviewReason,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

/// Destination for review tickets (pager, ticketing system, table).
#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn deliver(&self, ticket: &ReviewTicket) -> Result<(), SagaError>;
}

/// Handle for raising tickets. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReviewQueue {
    sender: mpsc::Sender<ReviewTicket>,
}

impl ReviewQueue {
    /// Starts the delivery worker. The worker exits once every handle is dropped.
    pub fn spawn(sink: Arc<dyn ReviewSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<ReviewTicket>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(ticket) = receiver.recv().await {
                match sink.deliver(&ticket).await {
                    Ok(()) => {
                        metrics::counter!("saga_review_tickets_total", "reason" => ticket.reason.as_str())
                            .increment(1);
                    }
                    Err(e) => {
                        metrics::counter!("saga_review_delivery_failures_total").increment(1);
                        tracing::error!(
                            saga_id = %ticket.saga_id,
                            business_id = %ticket.business_id,
                            reason = ticket.reason.as_str(),
                            error = %e,
                            "failed to deliver review ticket"
                        );
                    }
                }
            }
            tracing::debug!("review queue worker stopped");
        });

        (Self { sender }, worker)
    }

    /// Enqueues a ticket without waiting.
    pub fn raise(&self, ticket: ReviewTicket) {
        match self.sender.try_send(ticket) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ticket)) => {
                metrics::counter!("saga_review_tickets_dropped_total").increment(1);
                tracing::warn!(
                    saga_id = %ticket.saga_id,
                    business_id = %ticket.business_id,
                    reason = ticket.reason.as_str(),
                    "review queue full, ticket dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(ticket)) => {
                tracing::warn!(
                    saga_id = %ticket.saga_id,
                    business_id = %ticket.business_id,
                    "review queue closed, ticket dropped"
                );
            }
        }
    }
}

/// Sink that writes tickets to the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingReviewSink;

#[async_trait]
impl ReviewSink for LoggingReviewSink {
    async fn deliver(&self, ticket: &ReviewTicket) -> Result<(), SagaError> {
        tracing::warn!(
            saga_id = %ticket.saga_id,
            business_id = %ticket.business_id,
            saga_type = %ticket.saga_type,
            step = ticket.step.as_deref().unwrap_or("-"),
            reason = ticket.reason.as_str(),
            detail = %ticket.detail,
            "manual review required"
        );
        Ok(())
    }
}

/// Sink that keeps tickets in memory, for tests and the ops surface.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReviewSink {
    tickets: Arc<Mutex<Vec<ReviewTicket>>>,
    notify: Arc<Notify>,
}

impl InMemoryReviewSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tickets(&self) -> Vec<ReviewTicket> {
        self.tickets.lock().await.clone()
    }

    /// Waits until at least `count` tickets have been delivered.
    pub async fn wait_for(&self, count: usize) -> Vec<ReviewTicket> {
        loop {
            let notified = self.notify.notified();
            {
                let tickets = self.tickets.lock().await;
                if tickets.len() >= count {
                    return tickets.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ReviewSink for InMemoryReviewSink {
    async fn deliver(&self, ticket: &ReviewTicket) -> Result<(), SagaError> {
        self.tickets.lock().await.push(ticket.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
