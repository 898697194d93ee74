//! The outbox processor: a periodic loop per table that claims due rows
//! inside a transaction, re-emits their messages to the inbound broker
//! topic, and applies publish backoff. A secondary reaper loop
//! garbage-collects SENT rows past the retention window.
//!
//! The processor is also the fork join's merge point: concurrent join rows
//! for the same `(workflow, position)` are folded into one message here,
//! because the relational store is the only place sibling branch markers can
//! meet.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use snafu::prelude::*;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, TOPIC_IN};
use crate::config::OutboxConfig;
use crate::message::Message;
use crate::outbox::{OutboxStore, OutboxTable};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("outbox store error: {source}"))]
    Store { source: crate::outbox::Error },

    #[snafu(display("message codec error: {source}"))]
    Codec { source: crate::message::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    table: OutboxTable,
    config: OutboxConfig,
}

impl OutboxProcessor {
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        table: OutboxTable,
        config: OutboxConfig,
    ) -> Self {
        OutboxProcessor {
            store,
            broker,
            table,
            config,
        }
    }

    /// Run the claim/publish loop until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            table = self.table.table_name(),
            interval_ms = self.config.interval_ms,
            batch = self.config.batch,
            "starting outbox processor"
        );
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.process_batch().await {
                    error!(table = self.table.table_name(), "outbox pass failed: {e}");
                }
                sleep(self.config.interval()).await;
            }
        })
    }

    /// One pass: claim, publish, mark, commit. Returns the number of rows
    /// published.
    pub async fn process_batch(&self) -> Result<usize> {
        let mut claim = self
            .store
            .claim_due(self.table, self.config.batch, self.config.max_attempts)
            .await
            .context(StoreSnafu)?;
        if claim.rows().is_empty() {
            claim.commit().await.context(StoreSnafu)?;
            return Ok(0);
        }

        let rows = claim.rows().to_vec();
        debug!(
            table = self.table.table_name(),
            claimed = rows.len(),
            "claimed due outbox rows"
        );

        let mut published = 0usize;
        let mut joins: HashMap<(String, String), Vec<(Uuid, i32, Message)>> = HashMap::new();

        for row in rows {
            let message = match Message::decode(&row.message) {
                Ok(message) => message,
                Err(e) => {
                    // Poison row: it will never decode, park it as FAILED.
                    warn!(id = %row.id, "undecodable outbox message: {e}");
                    claim
                        .mark_failed(row.id, &format!("undecodable message: {e}"))
                        .await
                        .context(StoreSnafu)?;
                    continue;
                }
            };

            if is_join_message(&message) {
                let key = (
                    message.workflow_id().unwrap_or_default().to_string(),
                    message.position.to_string(),
                );
                joins
                    .entry(key)
                    .or_default()
                    .push((row.id, row.attempt_count, message));
                continue;
            }

            match self.broker.publish(TOPIC_IN, &row.message).await {
                Ok(()) => {
                    claim.mark_sent(row.id).await.context(StoreSnafu)?;
                    published += 1;
                }
                Err(e) => {
                    self.handle_publish_failure(
                        claim.as_mut(),
                        row.id,
                        row.attempt_count,
                        &row.message,
                        &e.to_string(),
                    )
                    .await?;
                }
            }
        }

        for ((workflow, position), mut group) in joins {
            let (first_id, first_attempts, mut merged) = group.remove(0);
            for (other_id, _, other) in group {
                merge_join_states(&mut merged, &other);
                claim.mark_sent(other_id).await.context(StoreSnafu)?;
            }
            let payload = merged.encode().context(CodecSnafu)?;

            if join_complete(&merged) {
                match self.broker.publish(TOPIC_IN, &payload).await {
                    Ok(()) => {
                        claim.mark_sent(first_id).await.context(StoreSnafu)?;
                        published += 1;
                        debug!(workflow, position, "published completed fork join");
                    }
                    Err(e) => {
                        self.handle_publish_failure(
                            claim.as_mut(),
                            first_id,
                            first_attempts,
                            &payload,
                            &e.to_string(),
                        )
                        .await?;
                    }
                }
            } else {
                // Some branch is still running: keep one merged row polling.
                let next_due = Utc::now()
                    + ChronoDuration::from_std(self.config.interval())
                        .unwrap_or_else(|_| ChronoDuration::zero());
                claim
                    .reschedule(first_id, &payload, next_due, None)
                    .await
                    .context(StoreSnafu)?;
                debug!(workflow, position, "fork join still waiting on branches");
            }
        }

        claim.commit().await.context(StoreSnafu)?;
        Ok(published)
    }

    async fn handle_publish_failure(
        &self,
        claim: &mut dyn crate::outbox::ClaimedBatch,
        id: Uuid,
        attempt_count: i32,
        payload: &str,
        error: &str,
    ) -> Result<()> {
        if attempt_count + 1 >= self.config.max_attempts {
            warn!(%id, attempts = attempt_count + 1, "publish attempts exhausted, marking FAILED");
            claim.mark_failed(id, error).await.context(StoreSnafu)?;
        } else {
            let backoff = self.config.publish_backoff(attempt_count);
            let next_due = Utc::now()
                + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::zero());
            warn!(%id, ?backoff, "publish failed, backing off: {error}");
            claim
                .reschedule(id, payload, next_due, Some(error))
                .await
                .context(StoreSnafu)?;
        }
        Ok(())
    }
}

/// A join message resumes at a fork: its own position's state carries a fork
/// slot.
fn is_join_message(message: &Message) -> bool {
    message
        .states
        .get(&message.position)
        .and_then(|state| state.pointer("/slot/kind"))
        .and_then(Value::as_str)
        == Some("fork")
}

/// All branch markers present?
fn join_complete(message: &Message) -> bool {
    message
        .states
        .get(&message.position)
        .and_then(|state| state.pointer("/slot/branches"))
        .and_then(Value::as_object)
        .map(|branches| branches.values().all(|marker| !marker.is_null()))
        .unwrap_or(false)
}

/// Union `other`'s states into `target`: completion markers merge at the
/// fork position, unknown positions are adopted as-is.
fn merge_join_states(target: &mut Message, other: &Message) {
    let fork_position = target.position.clone();
    for (position, state) in &other.states {
        if *position == fork_position {
            if let Some(existing) = target.states.get_mut(position) {
                let incoming = state.pointer("/slot/branches").cloned();
                if let (Some(branches), Some(Value::Object(incoming))) =
                    (existing.pointer_mut("/slot/branches"), incoming)
                {
                    if let Value::Object(branches) = branches {
                        for (name, marker) in incoming {
                            if !marker.is_null() {
                                branches.insert(name, marker);
                            }
                        }
                    }
                }
                continue;
            }
        }
        target
            .states
            .entry(position.clone())
            .or_insert_with(|| state.clone());
    }
}

/// Deletes SENT rows past the retention window.
pub struct SentReaper {
    store: Arc<dyn OutboxStore>,
    table: OutboxTable,
    config: OutboxConfig,
}

impl SentReaper {
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, table: OutboxTable, config: OutboxConfig) -> Self {
        SentReaper {
            store,
            table,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let cutoff = Utc::now()
                    - ChronoDuration::from_std(self.config.retention())
                        .unwrap_or_else(|_| ChronoDuration::zero());
                match self
                    .store
                    .reap_sent(self.table, cutoff, self.config.batch)
                    .await
                {
                    Ok(0) => {}
                    Ok(reaped) => {
                        debug!(table = self.table.table_name(), reaped, "reaped sent rows");
                    }
                    Err(e) => {
                        error!(table = self.table.table_name(), "reaper pass failed: {e}");
                    }
                }
                sleep(self.config.gc_interval()).await;
            }
        })
    }
}
