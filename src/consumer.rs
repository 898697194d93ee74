//! Consumer adapter: decodes inbound messages, hands them to the
//! interpreter, and persists every resulting continuation into the correct
//! outbox table in a single transaction before the delivery is acknowledged.
//!
//! Infrastructure failures leave the delivery unacknowledged so the broker
//! redelivers; terminal workflow failures are acknowledged and recorded.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use snafu::prelude::*;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::TOPIC_IN;
use crate::context::CoreContext;
use crate::errors::WorkflowError;
use crate::interpreter::{self, Outcome};
use crate::message::Message;
use crate::outbox::{OutboxTable, PendingMessage};
use crate::parser;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("message codec error: {source}"))]
    Codec { source: crate::message::Error },

    #[snafu(display("parser error: {source}"))]
    Parser { source: crate::parser::Error },

    #[snafu(display("interpreter error: {source}"))]
    Interpreter { source: crate::interpreter::Error },

    #[snafu(display("outbox store error: {source}"))]
    Outbox { source: crate::outbox::Error },

    #[snafu(display("broker error: {source}"))]
    Broker { source: crate::broker::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// What handling one delivery produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    Completed(Value),
    Suspended(usize),
    Failed(WorkflowError),
}

#[derive(Debug, Clone)]
pub struct Consumer {
    core: CoreContext,
}

impl Consumer {
    #[must_use]
    pub fn new(core: CoreContext) -> Self {
        Consumer { core }
    }

    /// Subscribe to the inbound topic and handle deliveries until the task
    /// is aborted. A handling error is logged and NOT acknowledged; the
    /// driver's redelivery is the retry path for infrastructure failures.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut deliveries = match self.core.broker.subscribe(TOPIC_IN).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!("cannot subscribe to {TOPIC_IN}: {e}");
                    return;
                }
            };
            info!(topic = TOPIC_IN, "consumer subscribed");
            while let Some(delivery) = deliveries.recv().await {
                match self.handle(&delivery.payload).await {
                    Ok(Handled::Completed(_)) => {}
                    Ok(Handled::Suspended(count)) => {
                        debug!(count, "persisted continuations");
                    }
                    Ok(Handled::Failed(failure)) => {
                        info!(%failure, "workflow terminated as failed");
                    }
                    Err(e) => {
                        error!("delivery not acknowledged, awaiting redelivery: {e}");
                    }
                }
            }
        })
    }

    /// Handle one inbound payload: decode → run → persist continuations
    /// atomically. Returning `Ok` is the signal to acknowledge.
    pub async fn handle(&self, payload: &str) -> Result<Handled> {
        let message = Message::decode(payload).context(CodecSnafu)?;
        debug!(
            workflow = message.name,
            version = message.version,
            position = %message.position,
            "handling delivery"
        );

        let tree = parser::parse(
            self.core.definitions.as_ref(),
            &message.name,
            &message.version,
        )
        .await
        .context(ParserSnafu)?;

        let outcome = interpreter::run(&self.core, &tree, message.states, message.position)
            .await
            .context(InterpreterSnafu)?;

        match outcome {
            Outcome::Completed(output) => {
                info!(workflow = tree.name, "workflow completed");
                Ok(Handled::Completed(output))
            }
            Outcome::Suspended(continuations) => {
                let mut batch = Vec::with_capacity(continuations.len());
                for continuation in &continuations {
                    let delayed_until = Utc::now()
                        + ChronoDuration::from_std(continuation.delay)
                            .unwrap_or_else(|_| ChronoDuration::zero());
                    batch.push(PendingMessage {
                        table: continuation.table,
                        message: continuation.message.encode().context(CodecSnafu)?,
                        delayed_until,
                    });
                }
                self.core
                    .outbox
                    .enqueue_batch(&batch)
                    .await
                    .context(OutboxSnafu)?;
                Ok(Handled::Suspended(batch.len()))
            }
            Outcome::Failed(failure) => {
                // Terminal state: record it on the retries table so the
                // failure survives the ack.
                self.core
                    .outbox
                    .record_failed(OutboxTable::Retries, payload, &failure.to_value().to_string())
                    .await
                    .context(OutboxSnafu)?;
                Ok(Handled::Failed(failure))
            }
        }
    }

    /// Start a fresh workflow instance: write its initial continuation to
    /// the waits table so the processor publishes it durably.
    pub async fn start(
        &self,
        name: &str,
        version: &str,
        input: Value,
    ) -> Result<String> {
        let tree = parser::parse(self.core.definitions.as_ref(), name, version)
            .await
            .context(ParserSnafu)?;
        let workflow_id = uuid::Uuid::now_v7().to_string();
        let message = interpreter::initial_message(&tree, &workflow_id, input);
        self.core
            .outbox
            .enqueue(
                OutboxTable::Waits,
                &message.encode().context(CodecSnafu)?,
                Utc::now(),
            )
            .await
            .context(OutboxSnafu)?;
        info!(workflow = name, version, id = workflow_id, "workflow started");
        Ok(workflow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::HttpActivities;
    use crate::broker::InMemoryBroker;
    use crate::config::EngineConfig;
    use crate::outbox::{MemoryOutboxStore, OutboxStatus, OutboxStore};
    use crate::store::{DefinitionStore, MemoryDefinitionStore};
    use serde_json::json;
    use std::sync::Arc;

    const LINEAR: &str = r#"
document:
  dsl: '1.0.0'
  name: linear
  version: '0.1.0'
do:
  - first:
      set:
        y: "${ .x + 1 }"
"#;

    async fn consumer_with(store: Arc<MemoryOutboxStore>) -> Consumer {
        let definitions = Arc::new(MemoryDefinitionStore::new());
        definitions
            .insert("linear", "0.1.0", LINEAR)
            .await
            .unwrap();
        Consumer::new(CoreContext::new(
            definitions,
            store,
            Arc::new(InMemoryBroker::new()),
            Arc::new(HttpActivities::new()),
            json!({}),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn start_enqueues_the_initial_continuation() {
        let store = Arc::new(MemoryOutboxStore::new());
        let consumer = consumer_with(store.clone()).await;
        let workflow_id = consumer
            .start("linear", "0.1.0", json!({"x": 1}))
            .await
            .unwrap();

        let rows = store.fetch_all(OutboxTable::Waits).await.unwrap();
        assert_eq!(rows.len(), 1);
        let message = Message::decode(&rows[0].message).unwrap();
        assert_eq!(message.workflow_id(), Some(workflow_id.as_str()));
        assert!(message.position.is_root());
    }

    #[tokio::test]
    async fn completed_run_leaves_no_outbox_rows() {
        let store = Arc::new(MemoryOutboxStore::new());
        let consumer = consumer_with(store.clone()).await;
        consumer.start("linear", "0.1.0", json!({"x": 1})).await.unwrap();
        let rows = store.fetch_all(OutboxTable::Waits).await.unwrap();

        let handled = consumer.handle(&rows[0].message).await.unwrap();
        let Handled::Completed(output) = handled else {
            panic!("expected completion, got {handled:?}");
        };
        assert_eq!(output, json!({"x": 1, "y": 2}));
        assert_eq!(
            store
                .count(OutboxTable::Retries, OutboxStatus::Pending)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn unknown_definition_is_not_acknowledged() {
        let store = Arc::new(MemoryOutboxStore::new());
        let consumer = consumer_with(store).await;
        let message = Message {
            name: "ghost".to_string(),
            version: "9.9.9".to_string(),
            states: Default::default(),
            position: crate::position::NodePosition::root(),
        };
        let result = consumer.handle(&message.encode().unwrap()).await;
        assert!(matches!(result, Err(Error::Parser { .. })));
    }
}
