//! The workflow interpreter: a state machine over a stack of
//! [`NodeInstance`] activations. Each activation either completes the
//! workflow, suspends it into one or more persistable continuations, or
//! fails it with a [`WorkflowError`].
//!
//! Control flow is an explicit loop over a `Step` sum type — there is no
//! exception-driven flow and no coroutine suspension. A node that needs to
//! wait must emit a continuation describing how to resume; that is the only
//! legal form of suspension.

use std::collections::BTreeMap;
use std::time::Duration;

use async_recursion::async_recursion;
use chrono::Utc;
use serde_json::{json, Map, Value};
use snafu::prelude::*;
use tracing::{debug, info};
use uuid::Uuid;

use crate::activities::{HttpCallRequest, OutputHint};
use crate::context::CoreContext;
use crate::descriptors::{TaskDescriptor, WorkflowDescriptor};
use crate::dsl::{FlowDirective, SetValue};
use crate::errors::{ErrorKind, WorkflowError};
use crate::expressions::{self, Scope};
use crate::message::Message;
use crate::node::{
    BranchMarker, NodeInstance, NodeKind, NodeSlot, NodeTask, Phase, RunTarget,
};
use crate::outbox::OutboxTable;
use crate::parser::{self, WorkflowTree};
use crate::position::NodePosition;

/// Poll delay for a fork join waiting on sibling completion markers.
const JOIN_POLL_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("position {position} does not name a node of this workflow"))]
    UnknownPosition { position: NodePosition },

    #[snafu(display("no persisted state for {position}; the message is not resumable"))]
    MissingState { position: NodePosition },

    #[snafu(display("node state error: {source}"))]
    State { source: crate::node::Error },

    #[snafu(display("message codec error: {source}"))]
    Codec { source: crate::message::Error },

    #[snafu(display("parser error: {source}"))]
    Parser { source: crate::parser::Error },

    #[snafu(display("broker error: {source}"))]
    Broker { source: crate::broker::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A suspended execution, ready to be persisted into an outbox table.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub table: OutboxTable,
    pub message: Message,
    pub delay: Duration,
}

/// Terminal result of one interpreter activation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Suspended(Vec<Continuation>),
    Failed(WorkflowError),
}

/// One transition of the interpreter loop.
enum Step {
    Continue(NodePosition),
    Complete(Value),
    Wait { at: NodePosition, delay: Duration },
    Retry { at: NodePosition, delay: Duration },
    Split(Vec<NodePosition>),
    Fail(WorkflowError),
}

/// Build the message that starts a fresh instance of `tree` at the root.
#[must_use]
pub fn initial_message(tree: &WorkflowTree, workflow_id: &str, input: Value) -> Message {
    let mut root = NodeInstance::new(input);
    root.workflow_id = Some(workflow_id.to_string());
    root.context = Some(json!({}));

    let mut states = BTreeMap::new();
    states.insert(NodePosition::root(), root.encode());
    Message {
        name: tree.name.clone(),
        version: tree.version.clone(),
        states,
        position: NodePosition::root(),
    }
}

/// Run one activation: resume `tree` from `states` at `position` and drive it
/// until it completes, suspends, or fails.
pub async fn run(
    core: &CoreContext,
    tree: &WorkflowTree,
    states: BTreeMap<NodePosition, Value>,
    position: NodePosition,
) -> Result<Outcome> {
    run_at(core, tree, states, position, NodePosition::root()).await
}

#[async_recursion]
async fn run_at(
    core: &CoreContext,
    tree: &WorkflowTree,
    states: BTreeMap<NodePosition, Value>,
    position: NodePosition,
    boundary: NodePosition,
) -> Result<Outcome> {
    let mut interpreter = Interpreter::restore(core, tree, states, boundary)?;

    let mut step = interpreter.activate(position).await?;
    loop {
        match step {
            Step::Continue(next) => {
                step = interpreter.activate(next).await?;
            }
            Step::Complete(output) => {
                info!(workflow = %tree.name, id = %interpreter.workflow_id, "workflow activation completed");
                return Ok(Outcome::Completed(output));
            }
            Step::Wait { at, delay } => {
                let continuation =
                    interpreter.continuation(&at, OutboxTable::Waits, delay)?;
                return Ok(Outcome::Suspended(vec![continuation]));
            }
            Step::Retry { at, delay } => {
                let continuation =
                    interpreter.continuation(&at, OutboxTable::Retries, delay)?;
                return Ok(Outcome::Suspended(vec![continuation]));
            }
            Step::Split(branches) => {
                let mut continuations = Vec::with_capacity(branches.len());
                for branch in &branches {
                    continuations.push(interpreter.continuation(
                        branch,
                        OutboxTable::Waits,
                        Duration::ZERO,
                    )?);
                }
                return Ok(Outcome::Suspended(continuations));
            }
            Step::Fail(error) => {
                info!(workflow = %tree.name, id = %interpreter.workflow_id, %error, "workflow failed");
                return Ok(Outcome::Failed(error));
            }
        }
    }
}

struct Interpreter<'a> {
    core: &'a CoreContext,
    tree: &'a WorkflowTree,
    boundary: NodePosition,
    workflow_id: String,
    instances: BTreeMap<NodePosition, NodeInstance>,
    /// The instance context, updated by `set` and `export.as`.
    context: Value,
}

impl<'a> Interpreter<'a> {
    fn restore(
        core: &'a CoreContext,
        tree: &'a WorkflowTree,
        states: BTreeMap<NodePosition, Value>,
        boundary: NodePosition,
    ) -> Result<Self> {
        let mut instances = BTreeMap::new();
        for (position, state) in &states {
            let node = tree
                .node_at(position)
                .context(UnknownPositionSnafu {
                    position: position.clone(),
                })?;
            let instance = NodeInstance::decode(node, state).context(StateSnafu)?;
            instances.insert(position.clone(), instance);
        }

        let root = instances
            .get(&NodePosition::root())
            .context(MissingStateSnafu {
                position: NodePosition::root(),
            })?;
        let workflow_id = root
            .workflow_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let context = root.context.clone().unwrap_or_else(|| json!({}));

        Ok(Interpreter {
            core,
            tree,
            boundary,
            workflow_id,
            instances,
            context,
        })
    }

    fn node(&self, position: &NodePosition) -> Result<&'a NodeTask> {
        self.tree.node_at(position).context(UnknownPositionSnafu {
            position: position.clone(),
        })
    }

    fn instance(&mut self, position: &NodePosition) -> Result<&mut NodeInstance> {
        self.instances.get_mut(position).context(MissingStateSnafu {
            position: position.clone(),
        })
    }

    fn instance_ref(&self, position: &NodePosition) -> Result<&NodeInstance> {
        self.instances.get(position).context(MissingStateSnafu {
            position: position.clone(),
        })
    }

    // -- scope ------------------------------------------------------------

    /// Assemble the expression scope at a node. Locals come from enclosing
    /// `try` handlers (the caught error) and `for` loops (item + index).
    fn scope_for(&self, position: &NodePosition, input: Value) -> Scope {
        let root = self.instances.get(&NodePosition::root());
        let workflow = root
            .map(|r| {
                serde_json::to_value(WorkflowDescriptor {
                    id: self.workflow_id.clone(),
                    definition: self.tree.definition.clone(),
                    input: r.raw_input.clone(),
                    started_at: r.started_at.into(),
                })
                .unwrap_or(Value::Null)
            })
            .unwrap_or(Value::Null);

        let task = self.tree.node_at(position).map(|node| {
            let definition = self
                .tree
                .definition
                .pointer(&position.to_string())
                .cloned()
                .unwrap_or(Value::Null);
            let instance = self.instances.get(position);
            serde_json::to_value(TaskDescriptor {
                name: node.name.clone(),
                reference: position.to_string(),
                definition,
                input: instance
                    .map(|i| i.raw_input.clone())
                    .unwrap_or(Value::Null),
                output: instance.and_then(|i| i.raw_output.clone()),
                started_at: instance
                    .map(|i| i.started_at)
                    .unwrap_or_else(Utc::now)
                    .into(),
            })
            .unwrap_or(Value::Null)
        });

        let mut scope = Scope {
            context: self.context.clone(),
            input,
            output: self
                .instances
                .get(position)
                .and_then(|i| i.raw_output.clone())
                .unwrap_or(Value::Null),
            secrets: self.core.secrets_for(&self.tree.secrets),
            authorization: None,
            task,
            workflow,
            runtime: serde_json::to_value(&self.core.runtime).unwrap_or(Value::Null),
            locals: Default::default(),
        };

        for ancestor in self.tree.ancestors_of(position) {
            let Some(instance) = self.instances.get(&ancestor.position) else {
                continue;
            };
            match (&ancestor.kind, &instance.slot) {
                (NodeKind::For { each, at, .. }, NodeSlot::For { items, cursor }) => {
                    if let Some(item) = items.get(*cursor) {
                        scope.locals.insert(each.clone(), item.clone());
                        scope.locals.insert(at.clone(), json!(cursor));
                    }
                }
                (
                    NodeKind::Try { .. },
                    NodeSlot::Try {
                        caught: Some(error),
                        in_catch: true,
                    },
                ) => {
                    if let Some(catch) = &ancestor.catch {
                        scope
                            .locals
                            .insert(catch.var_name.clone(), error.to_value());
                    }
                }
                _ => {}
            }
        }

        scope
    }

    /// Evaluate a transform hook (`input.from`, `output.as`, `export.as`): a
    /// string is an expression, any other JSON value is a template.
    fn transform(
        &self,
        position: &NodePosition,
        template: &Value,
        data: &Value,
        scope: &Scope,
    ) -> std::result::Result<Value, WorkflowError> {
        let result = match template {
            Value::String(expr) => expressions::evaluate(expr, data, scope),
            other => expressions::evaluate_template(other, data, scope, false),
        };
        result.map_err(|e| WorkflowError::expression(e.to_string()).at(position))
    }

    // -- activation -------------------------------------------------------

    async fn activate(&mut self, position: NodePosition) -> Result<Step> {
        let node = self.node(&position)?;
        debug!(position = %position, kind = node.kind.tag(), "activating node");

        // Timeout boundary: honoured at the next step after suspension.
        {
            let instance = self.instance(&position)?;
            if let Some(deadline) = instance.deadline {
                if Utc::now() > deadline {
                    instance.deadline = None;
                    let error = WorkflowError::timeout(format!(
                        "node {} exceeded its timeout",
                        node.name
                    ))
                    .at(&position);
                    return self.handle_error(&position, error);
                }
            }
        }

        // `if` guard: a falsy condition skips the task, output = raw input.
        if self.instance_ref(&position)?.phase == Phase::New {
            if let Some(condition) = &node.if_cond {
                let raw_input = self.instance_ref(&position)?.raw_input.clone();
                let scope = self.scope_for(&position, raw_input.clone());
                let verdict = expressions::evaluate(condition, &raw_input, &scope)
                    .map_err(|e| WorkflowError::expression(e.to_string()).at(&position));
                match verdict {
                    Ok(value) if !expressions::is_truthy(&value) => {
                        let instance = self.instance(&position)?;
                        instance.transformed_input = Some(instance.raw_input.clone());
                        instance.raw_output = Some(instance.raw_input.clone());
                        instance.transformed_output = Some(instance.raw_input.clone());
                        instance.phase = Phase::Done;
                        return self.advance_after(&position);
                    }
                    Ok(_) => {}
                    Err(error) => return self.handle_error(&position, error),
                }
            }
        }

        // Input transform.
        if self.instance_ref(&position)?.transformed_input.is_none() {
            let raw_input = self.instance_ref(&position)?.raw_input.clone();
            let scope = self.scope_for(&position, raw_input.clone());
            let transformed = match &node.input_from {
                Some(template) => {
                    match self.transform(&position, template, &raw_input, &scope) {
                        Ok(value) => value,
                        Err(error) => return self.handle_error(&position, error),
                    }
                }
                None => raw_input,
            };
            let instance = self.instance(&position)?;
            instance.transformed_input = Some(transformed);
            if instance.phase == Phase::New {
                instance.phase = Phase::InputReady;
            }
        }

        let input = self
            .instance_ref(&position)?
            .transformed_input
            .clone()
            .unwrap_or(Value::Null);
        {
            let instance = self.instance(&position)?;
            if instance.phase == Phase::InputReady {
                instance.phase = Phase::BodyRunning;
            }
        }

        match &node.kind {
            NodeKind::Do | NodeKind::Try { .. } => {
                if node.children.is_empty() {
                    self.instance(&position)?.raw_output = Some(input);
                    return self.finish(&position);
                }
                let body_len = match node.kind {
                    NodeKind::Try { body_len } => body_len,
                    _ => node.children.len(),
                };
                if body_len == 0 {
                    self.instance(&position)?.raw_output = Some(input);
                    return self.finish(&position);
                }
                self.enter_child(&position, 0, input)
            }

            NodeKind::For { in_expr, .. } => {
                let scope = self.scope_for(&position, input.clone());
                let collection = match expressions::evaluate(in_expr, &input, &scope) {
                    Ok(value) => value,
                    Err(e) => {
                        let error =
                            WorkflowError::expression(e.to_string()).at(&position);
                        return self.handle_error(&position, error);
                    }
                };
                let Some(items) = collection.as_array().cloned() else {
                    let error = WorkflowError::validation(format!(
                        "`for.in` must evaluate to an array, got {collection}"
                    ))
                    .at(&position);
                    return self.handle_error(&position, error);
                };
                if items.is_empty() || node.children.is_empty() {
                    self.instance(&position)?.raw_output = Some(input);
                    return self.finish(&position);
                }
                self.instance(&position)?.slot = NodeSlot::For { items, cursor: 0 };
                self.enter_child(&position, 0, input)
            }

            NodeKind::Set { value } => {
                let scope = self.scope_for(&position, input.clone());
                let evaluated = match value {
                    SetValue::Map(map) => {
                        let template = Value::Object(
                            map.iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect::<Map<String, Value>>(),
                        );
                        self.transform(&position, &template, &input, &scope)
                    }
                    SetValue::Expression(expr) => expressions::evaluate(expr, &input, &scope)
                        .map_err(|e| {
                            WorkflowError::expression(e.to_string()).at(&position)
                        }),
                };
                let evaluated = match evaluated {
                    Ok(value) => value,
                    Err(error) => return self.handle_error(&position, error),
                };

                // `set` merges its pairs into the instance context, and its
                // output pipes the merged view onward.
                if let Value::Object(pairs) = &evaluated {
                    if !self.context.is_object() {
                        self.context = Value::Object(Map::new());
                    }
                    if let Some(context) = self.context.as_object_mut() {
                        for (key, value) in pairs {
                            context.insert(key.clone(), value.clone());
                        }
                    }
                }
                let output = match (&input, &evaluated) {
                    (Value::Object(base), Value::Object(pairs)) => {
                        let mut merged = base.clone();
                        for (key, value) in pairs {
                            merged.insert(key.clone(), value.clone());
                        }
                        Value::Object(merged)
                    }
                    _ => evaluated,
                };
                self.instance(&position)?.raw_output = Some(output);
                self.finish(&position)
            }

            NodeKind::Raise { error } => {
                let Some(kind) = ErrorKind::parse(&error.type_) else {
                    let error = WorkflowError::configuration(format!(
                        "unknown error type {:?} in raise",
                        error.type_
                    ))
                    .at(&position);
                    return self.handle_error(&position, error);
                };
                let mut raised = WorkflowError::new(kind)
                    .with_status(error.status)
                    .at(&position);
                raised.title = error.title.clone();
                raised.detail = error.detail.clone();
                self.instance(&position)?.phase = Phase::Raised;
                self.handle_error(&position, raised)
            }

            NodeKind::Wait { duration } => {
                if matches!(
                    self.instance_ref(&position)?.slot,
                    NodeSlot::Wait { resumed: true }
                ) {
                    // The delivery only arrives once the delay elapsed.
                    self.instance(&position)?.raw_output = Some(input);
                    return self.finish(&position);
                }
                let delay = *duration;
                let instance = self.instance(&position)?;
                instance.slot = NodeSlot::Wait { resumed: true };
                instance.phase = Phase::Waiting;
                if let Some(timeout) = node.timeout_after {
                    instance.deadline = Some(
                        instance.started_at
                            + chrono::Duration::from_std(timeout)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                }
                Ok(Step::Wait {
                    at: position,
                    delay,
                })
            }

            NodeKind::Listen { .. } => {
                if let NodeSlot::Listen { event: Some(event) } =
                    self.instance_ref(&position)?.slot.clone()
                {
                    self.instance(&position)?.raw_output = Some(event);
                    return self.finish(&position);
                }
                let park = Duration::from_secs(self.core.config.wait.event_park_secs);
                let instance = self.instance(&position)?;
                instance.slot = NodeSlot::Listen { event: None };
                instance.phase = Phase::Waiting;
                Ok(Step::Wait {
                    at: position,
                    delay: park,
                })
            }

            NodeKind::Switch { cases } => {
                let scope = self.scope_for(&position, input.clone());
                let mut selected = None;
                for (case_name, case) in cases {
                    let truthy = match &case.when {
                        None => true,
                        Some(when) => match expressions::evaluate(when, &input, &scope) {
                            Ok(value) => expressions::is_truthy(&value),
                            Err(e) => {
                                let error = WorkflowError::expression(e.to_string())
                                    .at(&position);
                                return self.handle_error(&position, error);
                            }
                        },
                    };
                    if truthy {
                        selected = Some(case_name.clone());
                        break;
                    }
                }
                let Some(selected) = selected else {
                    // The parser guarantees a fallback: the task's own
                    // `then` carries the default when every case is guarded.
                    if node.then.is_some() {
                        let instance = self.instance(&position)?;
                        instance.raw_output = Some(input);
                        return self.finish(&position);
                    }
                    let error = WorkflowError::configuration(
                        "no switch case matched and no default case is declared",
                    )
                    .at(&position);
                    return self.handle_error(&position, error);
                };
                let instance = self.instance(&position)?;
                instance.slot = NodeSlot::Switch {
                    selected: Some(selected),
                };
                instance.raw_output = Some(input);
                self.finish(&position)
            }

            NodeKind::Call { protocol, with } => {
                let scope = self.scope_for(&position, input.clone());
                let template = Value::Object(
                    with.iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<Map<String, Value>>(),
                );
                let arguments =
                    match self.transform(&position, &template, &input, &scope) {
                        Ok(value) => value,
                        Err(error) => return self.handle_error(&position, error),
                    };
                let call = self.call_activity(&position, *protocol, &arguments);
                let result = match node.timeout_after {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(WorkflowError::timeout(format!(
                            "call {} exceeded its timeout",
                            node.name
                        ))),
                    },
                    None => call.await,
                };
                match result {
                    Ok(output) => {
                        self.instance(&position)?.raw_output = Some(output);
                        self.finish(&position)
                    }
                    Err(error) => self.handle_error(&position, error.at(&position)),
                }
            }

            NodeKind::Emit { event } => {
                let scope = self.scope_for(&position, input.clone());
                let template = Value::Object(
                    event
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<Map<String, Value>>(),
                );
                let attributes =
                    match self.transform(&position, &template, &input, &scope) {
                        Ok(value) => value,
                        Err(error) => return self.handle_error(&position, error),
                    };

                let event_id = Uuid::now_v7().to_string();
                let mut envelope = Map::new();
                envelope.insert("id".to_string(), json!(event_id));
                envelope.insert("specversion".to_string(), json!("1.0"));
                envelope.insert(
                    "source".to_string(),
                    json!(format!("/shrike/{}", self.tree.name)),
                );
                envelope.insert("time".to_string(), json!(Utc::now().to_rfc3339()));
                if let Value::Object(attrs) = attributes {
                    for (key, value) in attrs {
                        envelope.insert(key, value);
                    }
                }

                let payload = Value::Object(envelope).to_string();
                self.core
                    .broker
                    .publish(crate::broker::TOPIC_OUT, &payload)
                    .await
                    .context(BrokerSnafu)?;

                self.instance(&position)?.raw_output = Some(json!(event_id));
                self.finish(&position)
            }

            NodeKind::Run { target } => {
                let result = self.run_target(&position, target, &input).await?;
                match result {
                    Ok(output) => {
                        self.instance(&position)?.raw_output = Some(output);
                        self.finish(&position)
                    }
                    Err(error) => self.handle_error(&position, error.at(&position)),
                }
            }

            NodeKind::Fork { compete } => {
                if *compete {
                    let winner = self.race_branches(&position, node, &input).await?;
                    match winner {
                        Ok(output) => {
                            self.instance(&position)?.raw_output = Some(output);
                            self.finish(&position)
                        }
                        Err(error) => self.handle_error(&position, error.at(&position)),
                    }
                } else {
                    self.fork_or_join(&position, node, input)
                }
            }
        }
    }

    /// Dispatch a `call` through the host activity seam.
    async fn call_activity(
        &self,
        position: &NodePosition,
        protocol: crate::node::CallProtocol,
        arguments: &Value,
    ) -> std::result::Result<Value, WorkflowError> {
        use crate::node::CallProtocol::*;
        match protocol {
            Http => {
                let hint = match arguments.get("output").and_then(Value::as_str) {
                    Some(text) => OutputHint::parse(text)?,
                    None => OutputHint::default(),
                };
                let uri = arguments
                    .get("endpoint")
                    .or_else(|| arguments.get("uri"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        WorkflowError::validation("call: http requires an endpoint")
                            .at(position)
                    })?
                    .to_string();
                let headers = arguments
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| {
                                (
                                    k.clone(),
                                    v.as_str().map(str::to_string).unwrap_or_else(|| {
                                        v.to_string()
                                    }),
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let request = HttpCallRequest {
                    method: arguments
                        .get("method")
                        .and_then(Value::as_str)
                        .unwrap_or("get")
                        .to_string(),
                    uri,
                    headers,
                    body: arguments.get("body").cloned(),
                };
                let response = self.core.activities.http_call(&request).await?;
                response.into_output(&request, hint)
            }
            Grpc => self.core.activities.grpc_call(arguments).await,
            AsyncApi => self.core.activities.async_api_call(arguments).await,
        }
    }

    /// Execute a `run` target: sub-workflows run through the interpreter,
    /// everything else goes through the host seam.
    async fn run_target(
        &self,
        position: &NodePosition,
        target: &RunTarget,
        input: &Value,
    ) -> Result<std::result::Result<Value, WorkflowError>> {
        match target {
            RunTarget::Workflow {
                name,
                version,
                input: declared,
            } => {
                let subtree =
                    match parser::parse(self.core.definitions.as_ref(), name, version).await {
                        Ok(subtree) => subtree,
                        Err(e) => {
                            return Ok(Err(WorkflowError::configuration(e.to_string())
                                .at(position)))
                        }
                    };
                let sub_input = match declared {
                    Some(template) => {
                        let scope = self.scope_for(position, input.clone());
                        match self.transform(position, template, input, &scope) {
                            Ok(value) => value,
                            Err(error) => return Ok(Err(error)),
                        }
                    }
                    None => input.clone(),
                };

                let sub_id = format!("{}/{}", self.workflow_id, Uuid::now_v7());
                let message = initial_message(&subtree, &sub_id, sub_input);
                let outcome = run_at(
                    self.core,
                    &subtree,
                    message.states,
                    NodePosition::root(),
                    NodePosition::root(),
                )
                .await?;
                Ok(match outcome {
                    Outcome::Completed(output) => Ok(output),
                    Outcome::Failed(error) => Err(error),
                    Outcome::Suspended(_) => Err(WorkflowError::runtime(
                        "sub-workflows may not suspend inside their parent's activation",
                    )
                    .at(position)),
                })
            }
            other => Ok(self.core.activities.run_process(other, input).await),
        }
    }

    /// Compete-mode fork: race every branch inside this activation; the
    /// first terminal outcome wins and the losers are dropped.
    async fn race_branches(
        &self,
        position: &NodePosition,
        node: &NodeTask,
        input: &Value,
    ) -> Result<std::result::Result<Value, WorkflowError>> {
        if node.children.is_empty() {
            return Ok(Ok(json!({})));
        }

        let root_position = NodePosition::root();
        let mut root = self
            .instances
            .get(&root_position)
            .cloned()
            .unwrap_or_else(|| NodeInstance::new(Value::Null));
        root.context = Some(self.context.clone());

        let mut futures = Vec::with_capacity(node.children.len());
        for branch in &node.children {
            let mut states = BTreeMap::new();
            states.insert(root_position.clone(), root.encode());
            states.insert(
                branch.position.clone(),
                NodeInstance::new(input.clone()).encode(),
            );
            let branch_position = branch.position.clone();
            futures.push(run_at(
                self.core,
                self.tree,
                states,
                branch_position.clone(),
                branch_position,
            ));
        }

        let (first, _index, _losers) = futures::future::select_all(futures).await;
        Ok(match first? {
            Outcome::Completed(output) => Ok(output),
            Outcome::Failed(error) => Err(error),
            Outcome::Suspended(_) => Err(WorkflowError::runtime(
                "branches of a competing fork may not suspend",
            )
            .at(position)),
        })
    }

    /// Non-compete fork: first activation splits into one continuation per
    /// branch; a later activation at the fork position is a join delivery.
    fn fork_or_join(
        &mut self,
        position: &NodePosition,
        node: &NodeTask,
        input: Value,
    ) -> Result<Step> {
        match self.instance_ref(position)?.slot.clone() {
            NodeSlot::None => {
                if node.children.is_empty() {
                    self.instance(position)?.raw_output = Some(json!({}));
                    return self.finish(position);
                }
                let mut branches = indexmap::IndexMap::new();
                let mut split = Vec::with_capacity(node.children.len());
                for branch in &node.children {
                    branches.insert(branch.name.clone(), None);
                    self.instances
                        .insert(branch.position.clone(), NodeInstance::new(input.clone()));
                    split.push(branch.position.clone());
                }
                let instance = self.instance(position)?;
                instance.slot = NodeSlot::Fork { branches };
                instance.phase = Phase::Waiting;
                Ok(Step::Split(split))
            }
            NodeSlot::Fork { branches } => {
                if let Some(error) = branches
                    .values()
                    .flatten()
                    .find_map(|marker| marker.error.clone())
                {
                    // Fail-fast join: the first branch error wins; remaining
                    // branch results are discarded.
                    return self.handle_error(position, error);
                }
                if branches.values().all(Option::is_some) {
                    let mut merged = Map::new();
                    for (name, marker) in &branches {
                        if let Some(BranchMarker {
                            output: Some(output),
                            ..
                        }) = marker
                        {
                            merged.insert(name.clone(), output.clone());
                        }
                    }
                    self.instance(position)?.raw_output = Some(Value::Object(merged));
                    return self.finish(position);
                }
                // Partial join: wait for sibling completion markers; the
                // outbox processor merges concurrent join rows.
                Ok(Step::Wait {
                    at: position.clone(),
                    delay: JOIN_POLL_DELAY,
                })
            }
            other => {
                debug!(position = %position, slot = ?other, "unexpected fork slot");
                UnknownPositionSnafu {
                    position: position.clone(),
                }
                .fail()
            }
        }
    }

    // -- completion -------------------------------------------------------

    /// Apply `output.as` then `export.as`, mark the node done, and hand
    /// control to the parent.
    fn finish(&mut self, position: &NodePosition) -> Result<Step> {
        let node = self.node(position)?;
        let raw_output = self
            .instance_ref(position)?
            .raw_output
            .clone()
            .unwrap_or(Value::Null);
        let transformed_input = self
            .instance_ref(position)?
            .transformed_input
            .clone()
            .unwrap_or(Value::Null);

        let mut scope = self.scope_for(position, transformed_input);
        scope.output = raw_output.clone();

        let transformed_output = match &node.output_as {
            Some(template) => {
                match self.transform(position, template, &raw_output, &scope) {
                    Ok(value) => value,
                    Err(error) => return self.handle_error(position, error),
                }
            }
            None => raw_output,
        };
        {
            let instance = self.instance(position)?;
            instance.transformed_output = Some(transformed_output.clone());
            instance.phase = Phase::OutputReady;
        }

        // `export.as` runs against the transformed output and replaces the
        // instance context; on key collisions the export wins.
        if let Some(template) = &node.export_as {
            let exported =
                match self.transform(position, template, &transformed_output, &scope) {
                    Ok(value) => value,
                    Err(error) => return self.handle_error(position, error),
                };
            self.context = exported;
        }
        {
            let instance = self.instance(position)?;
            instance.phase = Phase::Done;
        }
        self.advance_after(position)
    }

    /// The parent chooses the next active position from its composition rule
    /// and the completed child's flow directive.
    fn advance_after(&mut self, position: &NodePosition) -> Result<Step> {
        if *position == self.boundary {
            let output = self
                .instance_ref(position)?
                .transformed_output
                .clone()
                .unwrap_or(Value::Null);
            return Ok(Step::Complete(output));
        }

        let node = self.node(position)?;
        let parent = self
            .tree
            .parent_of(position)
            .context(UnknownPositionSnafu {
                position: position.clone(),
            })?;
        let parent_position = parent.position.clone();
        let output = self
            .instance_ref(position)?
            .transformed_output
            .clone()
            .unwrap_or(Value::Null);

        let child_index = parent
            .children
            .iter()
            .position(|child| &child.position == position)
            .context(UnknownPositionSnafu {
                position: position.clone(),
            })?;

        // Fork parents join through completion markers, not sequencing.
        if let NodeKind::Fork { compete: false } = parent.kind {
            let branch_name = node.name.clone();
            let parent_instance = self.instance(&parent_position)?;
            if let NodeSlot::Fork { branches } = &mut parent_instance.slot {
                branches.insert(
                    branch_name,
                    Some(BranchMarker {
                        output: Some(output),
                        error: None,
                    }),
                );
            }
            return Ok(Step::Wait {
                at: parent_position,
                delay: Duration::ZERO,
            });
        }

        let directive = self.effective_then(node, position);
        match directive {
            Some(FlowDirective::End) => self.terminate(output),
            Some(FlowDirective::Exit) => {
                self.instance(&parent_position)?.raw_output = Some(output);
                self.finish(&parent_position)
            }
            Some(FlowDirective::Task(target)) => {
                let target_index = parent
                    .children
                    .iter()
                    .position(|child| child.name == target)
                    .context(UnknownPositionSnafu {
                        position: position.clone(),
                    })?;
                self.enter_child(&parent_position, target_index, output)
            }
            Some(FlowDirective::Continue) | None => {
                self.advance_sequential(parent, &parent_position, child_index, output)
            }
        }
    }

    fn advance_sequential(
        &mut self,
        parent: &'a NodeTask,
        parent_position: &NodePosition,
        child_index: usize,
        output: Value,
    ) -> Result<Step> {
        match &parent.kind {
            NodeKind::Try { body_len } => {
                let in_handler = child_index >= *body_len;
                let end = if in_handler {
                    parent.children.len()
                } else {
                    *body_len
                };
                if child_index + 1 < end {
                    self.enter_child(parent_position, child_index + 1, output)
                } else {
                    let children = parent.children.len() as i64;
                    let instance = self.instance(parent_position)?;
                    instance.child_index = children;
                    instance.raw_output = Some(output);
                    self.finish(parent_position)
                }
            }
            NodeKind::For { .. } => {
                if child_index + 1 < parent.children.len() {
                    return self.enter_child(parent_position, child_index + 1, output);
                }
                // Body finished: next iteration or done.
                let iteration_input = self
                    .instance_ref(parent_position)?
                    .transformed_input
                    .clone()
                    .unwrap_or(Value::Null);
                let more = {
                    let instance = self.instance(parent_position)?;
                    match &mut instance.slot {
                        NodeSlot::For { items, cursor } => {
                            *cursor += 1;
                            *cursor < items.len()
                        }
                        _ => {
                            return UnknownPositionSnafu {
                                position: parent_position.clone(),
                            }
                            .fail()
                        }
                    }
                };
                if more {
                    // Restart the body: loop children re-enter fresh.
                    let parent_pos = parent_position.clone();
                    self.instances.retain(|position, _| {
                        !(parent_pos.is_prefix_of(position) && position != &parent_pos)
                    });
                    self.enter_child(parent_position, 0, iteration_input)
                } else {
                    let children = parent.children.len() as i64;
                    let instance = self.instance(parent_position)?;
                    instance.child_index = children;
                    instance.raw_output = Some(output);
                    self.finish(parent_position)
                }
            }
            _ => {
                if child_index + 1 < parent.children.len() {
                    self.enter_child(parent_position, child_index + 1, output)
                } else {
                    let children = parent.children.len() as i64;
                    let instance = self.instance(parent_position)?;
                    instance.child_index = children;
                    instance.raw_output = Some(output);
                    self.finish(parent_position)
                }
            }
        }
    }

    /// A switch's directive comes from its selected case; everything else
    /// uses the task's own `then`.
    fn effective_then(&self, node: &NodeTask, position: &NodePosition) -> Option<FlowDirective> {
        if let NodeKind::Switch { cases } = &node.kind {
            if let Some(NodeSlot::Switch {
                selected: Some(selected),
            }) = self.instances.get(position).map(|i| &i.slot)
            {
                return cases
                    .iter()
                    .find(|(name, _)| name == selected)
                    .map(|(_, case)| case.then.clone());
            }
        }
        node.then.clone()
    }

    /// Terminate the workflow (`then: end`) with the given output.
    fn terminate(&mut self, output: Value) -> Result<Step> {
        let boundary = self.boundary.clone();
        self.instance(&boundary)?.raw_output = Some(output);
        self.finish(&boundary)
    }

    fn enter_child(
        &mut self,
        parent_position: &NodePosition,
        child_index: usize,
        input: Value,
    ) -> Result<Step> {
        let parent = self.node(parent_position)?;
        let child = parent
            .children
            .get(child_index)
            .context(UnknownPositionSnafu {
                position: parent_position.clone(),
            })?;
        self.instance(parent_position)?.child_index = child_index as i64;
        self.instances
            .insert(child.position.clone(), NodeInstance::new(input));
        Ok(Step::Continue(child.position.clone()))
    }

    // -- errors -----------------------------------------------------------

    /// Walk the activation stack upward looking for a retry policy with
    /// attempts left, then a matching `try`. Crossing a fork boundary records
    /// an error marker for the join instead of climbing further.
    fn handle_error(&mut self, position: &NodePosition, error: WorkflowError) -> Result<Step> {
        let error = error.at(position);
        debug!(position = %position, %error, "handling workflow error");

        let ancestors: Vec<&NodeTask> = self
            .tree
            .ancestors_of(position)
            .into_iter()
            .rev()
            .collect();

        for (depth, node) in ancestors.iter().enumerate() {
            // Retry policy with attempts remaining?
            if let Some(policy) = &node.retry {
                if let Some(instance) = self.instances.get(&node.position) {
                    if policy.attempts_remaining(instance.attempt_index) {
                        let delay = policy.delay_for_attempt(instance.attempt_index);
                        let retry_position = node.position.clone();
                        self.instances.retain(|p, _| {
                            !(retry_position.is_prefix_of(p) && p != &retry_position)
                        });
                        let instance = self.instance(&retry_position)?;
                        instance.attempt_index += 1;
                        instance.reset_for_retry();
                        return Ok(Step::Retry {
                            at: retry_position,
                            delay,
                        });
                    }
                }
            }

            // Matching catch? Only errors from the try body are caught.
            if let (NodeKind::Try { body_len }, Some(catch)) = (&node.kind, &node.catch) {
                let from_body = position == &node.position
                    || node.children[..*body_len]
                        .iter()
                        .any(|child| child.position.is_prefix_of(position));
                if from_body && self.catch_matches(catch, &error) {
                    let try_position = node.position.clone();
                    // Clear body state below the try before diverting.
                    self.instances
                        .retain(|p, _| !(try_position.is_prefix_of(p) && p != &try_position));
                    let input = self
                        .instance_ref(&try_position)?
                        .transformed_input
                        .clone()
                        .unwrap_or(Value::Null);
                    let instance = self.instance(&try_position)?;
                    instance.slot = NodeSlot::Try {
                        caught: Some(error.clone()),
                        in_catch: true,
                    };
                    if catch.handler_len == 0 {
                        instance.raw_output = Some(error.to_value());
                        return self.finish(&try_position);
                    }
                    return self.enter_child(&try_position, *body_len, input);
                }
            }

            // An error escaping a fork branch becomes an error marker; the
            // join is where it propagates further. `ancestors` runs self →
            // root, so the branch root is the entry just before the fork.
            if let NodeKind::Fork { compete: false } = node.kind {
                if depth > 0 && self.instances.contains_key(&node.position) {
                    let branch_name = ancestors[depth - 1].name.clone();
                    let fork_position = node.position.clone();
                    let instance = self.instance(&fork_position)?;
                    if let NodeSlot::Fork { branches } = &mut instance.slot {
                        branches.insert(
                            branch_name,
                            Some(BranchMarker {
                                output: None,
                                error: Some(error),
                            }),
                        );
                    }
                    return Ok(Step::Wait {
                        at: fork_position,
                        delay: Duration::ZERO,
                    });
                }
            }

            if node.position == self.boundary {
                break;
            }
        }

        Ok(Step::Fail(error))
    }

    /// `catch.errors.with` is a property filter over the error's JSON
    /// projection; `when`/`exceptWhen` refine it with expressions evaluated
    /// against the error.
    fn catch_matches(&self, catch: &crate::node::CatchSpec, error: &WorkflowError) -> bool {
        let projection = error.to_value();
        for (key, expected) in &catch.with {
            let Some(actual) = projection.get(key) else {
                return false;
            };
            if !values_match(expected, actual) {
                return false;
            }
        }

        let scope = Scope::default().with_local(catch.var_name.clone(), projection.clone());
        if let Some(when) = &catch.when {
            match expressions::evaluate(when, &projection, &scope) {
                Ok(value) if expressions::is_truthy(&value) => {}
                _ => return false,
            }
        }
        if let Some(except) = &catch.except_when {
            match expressions::evaluate(except, &projection, &scope) {
                Ok(value) if expressions::is_truthy(&value) => return false,
                _ => {}
            }
        }
        true
    }

    // -- continuations ----------------------------------------------------

    /// Encode the ancestor chain of `at` into a persistable continuation.
    fn continuation(
        &mut self,
        at: &NodePosition,
        table: OutboxTable,
        delay: Duration,
    ) -> Result<Continuation> {
        // The root instance carries the instance context across suspensions.
        let context = self.context.clone();
        let workflow_id = self.workflow_id.clone();
        {
            let root = self.instance(&NodePosition::root())?;
            root.context = Some(context);
            root.workflow_id = Some(workflow_id);
        }

        let mut states = BTreeMap::new();
        for node in self.tree.ancestors_of(at) {
            let instance = self
                .instances
                .get(&node.position)
                .context(MissingStateSnafu {
                    position: node.position.clone(),
                })?;
            states.insert(node.position.clone(), instance.encode());
        }

        Ok(Continuation {
            table,
            message: Message {
                name: self.tree.name.clone(),
                version: self.tree.version.clone(),
                states,
                position: at.clone(),
            },
            delay,
        })
    }
}

/// Loose equality for catch filters: integer and float forms of the same
/// number match.
fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => e.as_f64() == a.as_f64(),
        _ => expected == actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::HttpActivities;
    use crate::broker::InMemoryBroker;
    use crate::outbox::MemoryOutboxStore;
    use crate::store::MemoryDefinitionStore;
    use std::sync::Arc;

    fn test_core() -> CoreContext {
        CoreContext::new(
            Arc::new(MemoryDefinitionStore::new()),
            Arc::new(MemoryOutboxStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(HttpActivities::new()),
            json!({}),
            crate::config::EngineConfig::default(),
        )
    }

    async fn run_to_outcome(text: &str, input: Value) -> Outcome {
        let core = test_core();
        let tree = parser::parse_str(text).unwrap();
        let message = initial_message(&tree, "wf-test", input);
        run(&core, &tree, message.states, message.position)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn linear_do_pipes_outputs() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: linear
  version: '0.1.0'
do:
  - first:
      set:
        y: "${ .x + 1 }"
  - second:
      set:
        z: "${ .y * 2 }"
"#,
            json!({"x": 1}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output, json!({"x": 1, "y": 2, "z": 4}));
    }

    #[tokio::test]
    async fn switch_takes_first_truthy_case() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: switchy
  version: '0.1.0'
do:
  - decide:
      switch:
        - small:
            when: "${ .n < 10 }"
            then: tag-small
        - default:
            then: tag-big
  - tag-small:
      set:
        size: small
      then: end
  - tag-big:
      set:
        size: big
"#,
            json!({"n": 3}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["size"], "small");
    }

    #[tokio::test]
    async fn switch_falls_back_to_its_then_when_no_case_matches() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: fallthrough
  version: '0.1.0'
do:
  - decide:
      switch:
        - big:
            when: "${ .n > 10 }"
            then: end
      then: mark
  - mark:
      set:
        fell_through: true
"#,
            json!({"n": 1}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["fell_through"], json!(true));
    }

    #[tokio::test]
    async fn raise_is_caught_by_matching_filter() {
        let outcome = run_to_outcome(
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
            json!({}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["handled"], "runtime");
    }

    #[tokio::test]
    async fn unmatched_error_fails_the_workflow() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: uncaught
  version: '0.1.0'
do:
  - guard:
      try:
        - boom:
            raise:
              error:
                type: timeout
                status: 408
      catch:
        errors:
          with:
            type: communication
        do:
          - never:
              set:
                reached: true
"#,
            json!({}),
        )
        .await;
        let Outcome::Failed(error) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.status, 408);
        assert_eq!(
            error.instance.as_ref().map(ToString::to_string).as_deref(),
            Some("/do/0/guard/try/0/boom")
        );
    }

    #[tokio::test]
    async fn wait_suspends_into_the_waits_table() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: sleepy
  version: '0.1.0'
do:
  - pause:
      wait:
        seconds: 5
  - after:
      set:
        done: true
"#,
            json!({}),
        )
        .await;
        let Outcome::Suspended(continuations) = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert_eq!(continuations.len(), 1);
        let continuation = &continuations[0];
        assert_eq!(continuation.table, OutboxTable::Waits);
        assert_eq!(continuation.delay, Duration::from_secs(5));
        assert_eq!(continuation.message.position.to_string(), "/do/0/pause");
        assert!(continuation.message.states.len() >= 2);
    }

    #[tokio::test]
    async fn resumed_wait_completes_the_workflow() {
        let core = test_core();
        let tree = parser::parse_str(
            r#"
document:
  dsl: '1.0.0'
  name: sleepy
  version: '0.1.0'
do:
  - pause:
      wait:
        seconds: 5
  - after:
      set:
        done: true
"#,
        )
        .unwrap();
        let message = initial_message(&tree, "wf-1", json!({}));
        let Outcome::Suspended(continuations) =
            run(&core, &tree, message.states, message.position)
                .await
                .unwrap()
        else {
            panic!("expected suspension");
        };

        let resume = continuations[0].message.clone();
        let outcome = run(&core, &tree, resume.states, resume.position)
            .await
            .unwrap();
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["done"], json!(true));
    }

    #[tokio::test]
    async fn for_loop_rebinds_the_loop_variable() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: loopy
  version: '0.1.0'
do:
  - total:
      set:
        sum: 0
  - accumulate:
      for:
        each: n
        in: "${ .values }"
      do:
        - add:
            set:
              sum: "${ $context.sum + $n }"
"#,
            json!({"values": [1, 2, 3]}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["sum"], json!(6));
    }

    #[tokio::test]
    async fn fork_splits_into_branch_continuations() {
        let outcome = run_to_outcome(
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
"#,
            json!({}),
        )
        .await;
        let Outcome::Suspended(continuations) = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert_eq!(continuations.len(), 2);
        let positions: Vec<String> = continuations
            .iter()
            .map(|c| c.message.position.to_string())
            .collect();
        assert!(positions.contains(&"/do/0/split/fork/branches/0/left".to_string()));
        assert!(positions.contains(&"/do/0/split/fork/branches/1/right".to_string()));
        for continuation in &continuations {
            assert_eq!(continuation.delay, Duration::ZERO);
            assert_eq!(continuation.table, OutboxTable::Waits);
        }
    }

    #[tokio::test]
    async fn fork_branches_join_through_markers() {
        let core = test_core();
        let tree = parser::parse_str(
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
        )
        .unwrap();
        let message = initial_message(&tree, "wf-1", json!({}));
        let Outcome::Suspended(split) = run(&core, &tree, message.states, message.position)
            .await
            .unwrap()
        else {
            panic!("expected split");
        };

        // Run both branch continuations; each yields a join continuation.
        let mut joins = Vec::new();
        for continuation in split {
            let msg = continuation.message;
            let Outcome::Suspended(mut next) = run(&core, &tree, msg.states, msg.position)
                .await
                .unwrap()
            else {
                panic!("expected join continuation");
            };
            assert_eq!(next.len(), 1);
            joins.push(next.remove(0).message);
        }

        // Merge the join messages the way the outbox processor does, then
        // deliver the merged message.
        let mut merged = joins.remove(0);
        for other in joins {
            for (position, state) in other.states {
                match merged.states.get_mut(&position) {
                    Some(existing) => merge_fork_states(existing, &state),
                    None => {
                        merged.states.insert(position, state);
                    }
                }
            }
        }
        let outcome = run(&core, &tree, merged.states, merged.position)
            .await
            .unwrap();
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["joined"], json!(true));
        assert_eq!(output["split"]["left"]["l"], json!(1));
        assert_eq!(output["split"]["right"]["r"], json!(2));
    }

    fn merge_fork_states(target: &mut Value, incoming: &Value) {
        let (Some(t), Some(i)) = (
            target.pointer_mut("/slot/branches"),
            incoming.pointer("/slot/branches"),
        ) else {
            return;
        };
        if let (Value::Object(t), Value::Object(i)) = (t, i) {
            for (name, marker) in i {
                if !marker.is_null() {
                    t.insert(name.clone(), marker.clone());
                }
            }
        }
    }

    #[tokio::test]
    async fn compete_fork_returns_first_branch_result() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: racer
  version: '0.1.0'
do:
  - race:
      fork:
        compete: true
        branches:
          - fast:
              set:
                winner: fast
          - slow:
              set:
                winner: slow
"#,
            json!({}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(output["winner"] == json!("fast") || output["winner"] == json!("slow"));
    }

    #[tokio::test]
    async fn retry_policy_schedules_a_retries_continuation() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: retries
  version: '0.1.0'
do:
  - flaky:
      raise:
        error:
          type: communication
          status: 503
      retry:
        maxAttempts: 3
        backoff: exponential
        base: PT1S
        multiplier: 2
"#,
            json!({}),
        )
        .await;
        let Outcome::Suspended(continuations) = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert_eq!(continuations.len(), 1);
        let continuation = &continuations[0];
        assert_eq!(continuation.table, OutboxTable::Retries);
        assert_eq!(continuation.delay, Duration::from_secs(1));

        let state = &continuation.message.states[&continuation.message.position];
        assert_eq!(state["attempt_index"], json!(1));
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_the_workflow() {
        let core = test_core();
        let tree = parser::parse_str(
            r#"
document:
  dsl: '1.0.0'
  name: retries
  version: '0.1.0'
do:
  - flaky:
      raise:
        error:
          type: communication
          status: 503
      retry:
        maxAttempts: 2
        base: PT1S
"#,
        )
        .unwrap();
        let message = initial_message(&tree, "wf-1", json!({}));
        let Outcome::Suspended(continuations) =
            run(&core, &tree, message.states, message.position)
                .await
                .unwrap()
        else {
            panic!("expected first suspension");
        };

        let resume = continuations[0].message.clone();
        let outcome = run(&core, &tree, resume.states, resume.position)
            .await
            .unwrap();
        let Outcome::Failed(error) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(error.status, 503);
    }

    #[tokio::test]
    async fn if_guard_skips_the_task() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: guarded
  version: '0.1.0'
do:
  - maybe:
      if: "${ .enabled }"
      set:
        ran: true
"#,
            json!({"enabled": false}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output, json!({"enabled": false}));
    }

    #[tokio::test]
    async fn export_as_replaces_the_context() {
        let outcome = run_to_outcome(
            r#"
document:
  dsl: '1.0.0'
  name: exports
  version: '0.1.0'
do:
  - stash:
      set:
        v: 41
      export:
        as: "${ { stashed: .v } }"
  - read:
      set:
        answer: "${ $context.stashed + 1 }"
"#,
            json!({}),
        )
        .await;
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["answer"], json!(42));
    }

    #[tokio::test]
    async fn emit_publishes_and_returns_the_event_id() {
        let broker = Arc::new(InMemoryBroker::new());
        let core = CoreContext::new(
            Arc::new(MemoryDefinitionStore::new()),
            Arc::new(MemoryOutboxStore::new()),
            broker.clone(),
            Arc::new(HttpActivities::new()),
            json!({}),
            crate::config::EngineConfig::default(),
        );
        let tree = parser::parse_str(
            r#"
document:
  dsl: '1.0.0'
  name: emitter
  version: '0.1.0'
do:
  - announce:
      emit:
        event:
          with:
            type: io.example.done
            data: "${ { n: .n } }"
"#,
        )
        .unwrap();
        let message = initial_message(&tree, "wf-1", json!({"n": 9}));
        let outcome = run(&core, &tree, message.states, message.position)
            .await
            .unwrap();
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        let events = broker.drain(crate::broker::TOPIC_OUT).await;
        assert_eq!(events.len(), 1);
        let envelope: Value = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(envelope["type"], "io.example.done");
        assert_eq!(envelope["data"]["n"], json!(9));
        assert_eq!(output, envelope["id"]);
    }
}
