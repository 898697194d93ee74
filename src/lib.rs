//! # Shrike - Durable Serverless Workflow Engine
//!
//! Shrike is a durable, outbox-driven execution engine for
//! [Serverless Workflow](https://serverlessworkflow.io/) definitions.
//!
//! ## Features
//!
//! - **Durable Execution**: execution state is serialised into continuation
//!   messages and persisted through a transactional outbox, so instances
//!   survive process restarts and broker redeliveries
//! - **At-Least-Once Semantics**: a continuation is only acknowledged after
//!   its successor is durably committed; node re-execution is idempotent for
//!   side-effect-free nodes
//! - **JQ Expressions**: workflow expressions evaluate through jaq with the
//!   full scope bundle (`$context`, `$input`, `$secrets`, ...)
//! - **Database-Level Concurrency**: wait and retry scheduling claims rows
//!   with `FOR UPDATE SKIP LOCKED`, so any number of processors can share
//!   the tables
//!
//! ## Core Modules
//!
//! - [`interpreter`] - the execution state machine over node activations
//! - [`parser`] - DSL loading and lowering into the position-indexed tree
//! - [`node`] - node descriptors and per-activation instance state
//! - [`message`] - the continuation wire codec
//! - [`outbox`] - wait/retry tables, processor and reaper
//! - [`consumer`] - the broker-facing adapter
//! - [`expressions`] - JQ expression evaluation with the scope bundle
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use shrike::broker::InMemoryBroker;
//! use shrike::activities::HttpActivities;
//! use shrike::config::EngineConfig;
//! use shrike::consumer::Consumer;
//! use shrike::context::CoreContext;
//! use shrike::outbox::MemoryOutboxStore;
//! use shrike::store::{DefinitionStore, MemoryDefinitionStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definitions = Arc::new(MemoryDefinitionStore::new());
//! definitions.insert("hello", "0.1.0", r#"
//! document:
//!   dsl: '1.0.0'
//!   name: hello
//!   version: '0.1.0'
//! do:
//!   - greet:
//!       set:
//!         message: Hello World!
//! "#).await?;
//!
//! let core = CoreContext::new(
//!     definitions,
//!     Arc::new(MemoryOutboxStore::new()),
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(HttpActivities::new()),
//!     serde_json::json!({}),
//!     EngineConfig::default(),
//! );
//!
//! let consumer = Consumer::new(core);
//! let workflow_id = consumer.start("hello", "0.1.0", serde_json::json!({})).await?;
//! println!("started {workflow_id}");
//! # Ok(())
//! # }
//! ```

pub mod activities;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod context;
pub mod descriptors;
pub mod dsl;
pub mod errors;
pub mod expressions;
pub mod interpreter;
pub mod message;
pub mod node;
pub mod outbox;
pub mod parser;
pub mod position;
pub mod retry;
pub mod store;
