//! End-to-end scenarios over the in-memory providers: broker-in → consumer →
//! interpreter → outbox → processor → broker-in, the full durable loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shrike::activities::HttpActivities;
use shrike::broker::{InMemoryBroker, TOPIC_IN};
use shrike::config::EngineConfig;
use shrike::consumer::{Consumer, Handled};
use shrike::context::CoreContext;
use shrike::errors::ErrorKind;
use shrike::outbox::processor::OutboxProcessor;
use shrike::outbox::{MemoryOutboxStore, OutboxStatus, OutboxStore, OutboxTable};
use shrike::store::{DefinitionStore, MemoryDefinitionStore};

struct Harness {
    store: Arc<MemoryOutboxStore>,
    broker: Arc<InMemoryBroker>,
    consumer: Consumer,
    waits: OutboxProcessor,
    retries: OutboxProcessor,
}

impl Harness {
    async fn new(definitions: &[(&str, &str, &str)]) -> Self {
        let definition_store = Arc::new(MemoryDefinitionStore::new());
        for (name, version, text) in definitions {
            definition_store.insert(name, version, text).await.unwrap();
        }
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let core = CoreContext::new(
            definition_store,
            store.clone(),
            broker.clone(),
            Arc::new(HttpActivities::new()),
            json!({}),
            EngineConfig::default(),
        );
        let config = core.config.outbox.clone();
        Harness {
            store: store.clone(),
            broker: broker.clone(),
            consumer: Consumer::new(core),
            waits: OutboxProcessor::new(
                store.clone(),
                broker.clone(),
                OutboxTable::Waits,
                config.clone(),
            ),
            retries: OutboxProcessor::new(store, broker, OutboxTable::Retries, config),
        }
    }

    async fn start(&self, name: &str, version: &str, input: Value) -> String {
        self.consumer.start(name, version, input).await.unwrap()
    }

    /// One scheduler tick: run both outbox processors, then feed every
    /// published message through the consumer. Returns what each delivery
    /// produced.
    async fn pump(&self) -> Vec<Handled> {
        self.waits.process_batch().await.unwrap();
        self.retries.process_batch().await.unwrap();
        let mut handled = Vec::new();
        for payload in self.broker.drain(TOPIC_IN).await {
            handled.push(self.consumer.handle(&payload).await.unwrap());
        }
        handled
    }

    /// Pump until something terminal shows up or `max_ticks` elapse,
    /// backdating pending rows between ticks to stand in for the clock.
    async fn drive(&self, max_ticks: usize) -> Handled {
        for _ in 0..max_ticks {
            for handled in self.pump().await {
                match handled {
                    Handled::Suspended(_) => {}
                    terminal => return terminal,
                }
            }
            self.store.backdate(OutboxTable::Waits, Duration::from_secs(3600));
            self.store
                .backdate(OutboxTable::Retries, Duration::from_secs(3600));
        }
        panic!("workflow did not terminate within {max_ticks} ticks");
    }

    async fn pending(&self, table: OutboxTable) -> i64 {
        self.store.count(table, OutboxStatus::Pending).await.unwrap()
    }
}

// S1: linear `do` over two `set` tasks.
#[tokio::test]
async fn linear_do_completes_in_one_delivery() {
    let harness = Harness::new(&[(
        "linear",
        "0.1.0",
        r#"
document:
  dsl: '1.0.0'
  name: linear
  version: '0.1.0'
do:
  - inc:
      set:
        y: "${ .x + 1 }"
  - double:
      set:
        z: "${ .y * 2 }"
"#,
    )])
    .await;

    harness.start("linear", "0.1.0", json!({"x": 1})).await;
    let handled = harness.pump().await;

    assert_eq!(handled.len(), 1, "exactly one inbound message");
    let Handled::Completed(output) = &handled[0] else {
        panic!("expected completion, got {handled:?}");
    };
    assert_eq!(*output, json!({"x": 1, "y": 2, "z": 4}));

    assert_eq!(harness.pending(OutboxTable::Waits).await, 0);
    assert_eq!(harness.pending(OutboxTable::Retries).await, 0);
}

// S2: `wait` suspends into the waits table and resumes once due.
#[tokio::test]
async fn wait_parks_a_row_then_resumes() {
    let harness = Harness::new(&[(
        "sleepy",
        "0.1.0",
        r#"
document:
  dsl: '1.0.0'
  name: sleepy
  version: '0.1.0'
do:
  - pause:
      wait:
        seconds: 5
  - finish:
      set:
        done: true
"#,
    )])
    .await;

    harness.start("sleepy", "0.1.0", json!({})).await;
    let before = Utc::now();
    let handled = harness.pump().await;
    assert!(matches!(handled.as_slice(), [Handled::Suspended(1)]));

    let rows = harness.store.fetch_all(OutboxTable::Waits).await.unwrap();
    let parked: Vec<_> = rows
        .iter()
        .filter(|row| row.status == OutboxStatus::Pending)
        .collect();
    assert_eq!(parked.len(), 1);
    let due_in = parked[0].delayed_until - before;
    assert!(due_in >= chrono::Duration::milliseconds(4_500));
    assert!(due_in <= chrono::Duration::milliseconds(5_500));

    // Not due yet: the inbound topic stays quiet.
    assert!(harness.pump().await.is_empty());

    // Advance the clock past the delay.
    harness
        .store
        .backdate(OutboxTable::Waits, Duration::from_secs(6));
    let handled = harness.pump().await;
    let [Handled::Completed(output)] = handled.as_slice() else {
        panic!("expected completion, got {handled:?}");
    };
    assert_eq!(output["done"], json!(true));

    let rows = harness.store.fetch_all(OutboxTable::Waits).await.unwrap();
    assert!(rows.iter().all(|row| row.status == OutboxStatus::Sent));
}

fn retrying_call(uri: &str) -> String {
    format!(
        r#"
document:
  dsl: '1.0.0'
  name: flaky
  version: '0.1.0'
do:
  - fetch:
      call: http
      with:
        method: get
        endpoint: {uri}/flaky
      retry:
        maxAttempts: 3
        backoff: exponential
        base: PT1S
        multiplier: 2
        jitter:
          to: PT1S
"#
    )
}

// S3: two 500s then a 200; retry delays fall inside the jitter windows.
#[tokio::test]
async fn retry_with_jitter_schedules_backoff_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let definition = retrying_call(&server.uri());
    let harness = Harness::new(&[("flaky", "0.1.0", &definition)]).await;
    harness.start("flaky", "0.1.0", json!({})).await;

    // First attempt: 500 → a retries row due in [1s, 2s].
    let before = Utc::now();
    let handled = harness.pump().await;
    assert!(matches!(handled.as_slice(), [Handled::Suspended(1)]));
    let rows = harness.store.fetch_all(OutboxTable::Retries).await.unwrap();
    assert_eq!(rows.len(), 1);
    let due_in = rows[0].delayed_until - before;
    assert!(due_in >= chrono::Duration::milliseconds(900), "{due_in}");
    assert!(due_in <= chrono::Duration::milliseconds(2_200), "{due_in}");

    // Second attempt: 500 → a second row due in [2s, 3s].
    harness
        .store
        .backdate(OutboxTable::Retries, Duration::from_secs(5));
    let before = Utc::now();
    let handled = harness.pump().await;
    assert!(matches!(handled.as_slice(), [Handled::Suspended(1)]));
    let rows = harness.store.fetch_all(OutboxTable::Retries).await.unwrap();
    assert_eq!(rows.len(), 2);
    let second = rows
        .iter()
        .find(|row| row.status == OutboxStatus::Pending)
        .unwrap();
    let due_in = second.delayed_until - before;
    assert!(due_in >= chrono::Duration::milliseconds(1_900), "{due_in}");
    assert!(due_in <= chrono::Duration::milliseconds(3_200), "{due_in}");

    // Third attempt succeeds.
    harness
        .store
        .backdate(OutboxTable::Retries, Duration::from_secs(5));
    let handled = harness.pump().await;
    let [Handled::Completed(output)] = handled.as_slice() else {
        panic!("expected completion, got {handled:?}");
    };
    assert_eq!(output["ok"], json!(true));
}

// S4: a raised error is caught by the matching filter and handled.
#[tokio::test]
async fn caught_error_diverts_to_the_handler() {
    let harness = Harness::new(&[(
        "catches",
        "0.1.0",
        r#"
document:
  dsl: '1.0.0'
  name: catches
  version: '0.1.0'
do:
  - guard:
      try:
        - boom:
            raise:
              error:
                type: runtime
                status: 500
      catch:
        errors:
          with:
            type: runtime
        as: error
        do:
          - handle:
              set:
                handled: "${ $error.type }"
"#,
    )])
    .await;

    harness.start("catches", "0.1.0", json!({})).await;
    let handled = harness.pump().await;
    let [Handled::Completed(output)] = handled.as_slice() else {
        panic!("expected completion, got {handled:?}");
    };
    assert_eq!(output["handled"], json!("runtime"));
}

// S5: an endpoint that never recovers exhausts the retry policy; the
// terminal failure is recorded as a FAILED retries row.
#[tokio::test]
async fn retry_exhaustion_surfaces_as_failed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let definition = retrying_call(&server.uri());
    let harness = Harness::new(&[("flaky", "0.1.0", &definition)]).await;
    harness.start("flaky", "0.1.0", json!({})).await;

    let terminal = harness.drive(10).await;
    let Handled::Failed(error) = terminal else {
        panic!("expected failure, got {terminal:?}");
    };
    assert_eq!(error.kind, ErrorKind::Communication);
    assert_eq!(error.status, 500);

    // Two retry continuations were consumed, and the terminal state ends as
    // a FAILED row.
    let rows = harness.store.fetch_all(OutboxTable::Retries).await.unwrap();
    assert_eq!(
        rows.iter()
            .filter(|row| row.status == OutboxStatus::Sent)
            .count(),
        2
    );
    let failed: Vec<_> = rows
        .iter()
        .filter(|row| row.status == OutboxStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("communication"));
}

// S6: concurrent claims over 100 due rows split them disjointly.
#[tokio::test]
async fn concurrent_claims_partition_the_backlog() {
    let store = Arc::new(MemoryOutboxStore::new());
    for i in 0..100 {
        store
            .enqueue(OutboxTable::Retries, &format!("m{i}"), Utc::now())
            .await
            .unwrap();
    }

    let (first, second) = tokio::join!(
        store.claim_due(OutboxTable::Retries, 50, 5),
        store.claim_due(OutboxTable::Retries, 50, 5),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.rows().len(), 50);
    assert_eq!(second.rows().len(), 50);

    let mut union: Vec<_> = first
        .rows()
        .iter()
        .chain(second.rows().iter())
        .map(|row| row.id)
        .collect();
    union.sort();
    union.dedup();
    assert_eq!(union.len(), 100, "no row is claimed twice");
}

// A non-compete fork splits, branches run as separate deliveries, and the
// join merges the markers back together.
#[tokio::test]
async fn fork_splits_and_joins_through_the_outbox() {
    let harness = Harness::new(&[(
        "forky",
        "0.1.0",
        r#"
document:
  dsl: '1.0.0'
  name: forky
  version: '0.1.0'
do:
  - split:
      fork:
        compete: false
        branches:
          - left:
              set:
                l: 1
          - right:
              set:
                r: 2
  - after:
      set:
        joined: true
"#,
    )])
    .await;

    harness.start("forky", "0.1.0", json!({})).await;

    // Tick 1: the start message splits into two branch continuations.
    let handled = harness.pump().await;
    assert!(matches!(handled.as_slice(), [Handled::Suspended(2)]));

    let terminal = harness.drive(5).await;
    let Handled::Completed(output) = terminal else {
        panic!("expected completion, got {terminal:?}");
    };
    assert_eq!(output["joined"], json!(true));
    assert_eq!(output["split"]["left"]["l"], json!(1));
    assert_eq!(output["split"]["right"]["r"], json!(2));
}

// then: end short-circuits the rest of the workflow.
#[tokio::test]
async fn then_end_terminates_early() {
    let harness = Harness::new(&[(
        "short",
        "0.1.0",
        r#"
document:
  dsl: '1.0.0'
  name: short
  version: '0.1.0'
do:
  - first:
      set:
        a: 1
      then: end
  - unreachable:
      set:
        b: 2
"#,
    )])
    .await;

    harness.start("short", "0.1.0", json!({})).await;
    let handled = harness.pump().await;
    let [Handled::Completed(output)] = handled.as_slice() else {
        panic!("expected completion, got {handled:?}");
    };
    assert_eq!(output["a"], json!(1));
    assert!(output.get("b").is_none());
}
