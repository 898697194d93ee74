//! The executable node model: immutable [`NodeTask`] descriptors produced by
//! the parser, and mutable [`NodeInstance`] state for one activation of a
//! node within one workflow instance.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::dsl::{ErrorDef, FlowDirective, SetValue, SwitchCase};
use crate::errors::WorkflowError;
use crate::position::NodePosition;
use crate::retry::RetryPolicy;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("node state at {position} does not deserialise: {source}"))]
    Malformed {
        position: NodePosition,
        source: serde_json::Error,
    },

    #[snafu(display(
        "node state at {position} carries a {found} slot but the node is a {expected}"
    ))]
    KindMismatch {
        position: NodePosition,
        expected: &'static str,
        found: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallProtocol {
    Http,
    Grpc,
    AsyncApi,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunTarget {
    Workflow {
        name: String,
        version: String,
        input: Option<Value>,
    },
    Shell(Value),
    Script(Value),
    Container(Value),
}

/// The closed set of task kinds, with their kind-specific payloads. Children
/// live on the owning [`NodeTask`]; a `Try` node's children are its body
/// followed by its catch handler (`body_len` marks the split).
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Do,
    Fork {
        compete: bool,
    },
    For {
        each: String,
        at: String,
        in_expr: String,
    },
    Switch {
        cases: Vec<(String, SwitchCase)>,
    },
    Try {
        body_len: usize,
    },
    Raise {
        error: ErrorDef,
    },
    Set {
        value: SetValue,
    },
    Wait {
        duration: Duration,
    },
    Run {
        target: RunTarget,
    },
    Call {
        protocol: CallProtocol,
        with: IndexMap<String, Value>,
    },
    Emit {
        event: IndexMap<String, Value>,
    },
    Listen {
        to: Value,
    },
}

impl NodeKind {
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Do => "do",
            NodeKind::Fork { .. } => "fork",
            NodeKind::For { .. } => "for",
            NodeKind::Switch { .. } => "switch",
            NodeKind::Try { .. } => "try",
            NodeKind::Raise { .. } => "raise",
            NodeKind::Set { .. } => "set",
            NodeKind::Wait { .. } => "wait",
            NodeKind::Run { .. } => "run",
            NodeKind::Call { .. } => "call",
            NodeKind::Emit { .. } => "emit",
            NodeKind::Listen { .. } => "listen",
        }
    }
}

/// How a caught error is matched and handled.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatchSpec {
    /// Property filter from `catch.errors.with`; every entry must equal the
    /// corresponding field of the error's JSON projection.
    pub with: IndexMap<String, Value>,
    pub when: Option<String>,
    pub except_when: Option<String>,
    /// Name the error is bound under in the handler's scope.
    pub var_name: String,
    /// Number of handler children appended after the try body.
    pub handler_len: usize,
}

/// Immutable node descriptor. Parents are relation + lookup through
/// [`crate::parser::WorkflowTree`], never owned back-references.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTask {
    pub name: String,
    pub position: NodePosition,
    pub kind: NodeKind,
    pub children: Vec<NodeTask>,
    pub input_from: Option<Value>,
    pub output_as: Option<Value>,
    pub export_as: Option<Value>,
    pub timeout_after: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub catch: Option<CatchSpec>,
    pub then: Option<FlowDirective>,
    pub if_cond: Option<String>,
}

/// Per-node lifecycle phase; transitions are driven exclusively by the
/// interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    New,
    InputReady,
    BodyRunning,
    OutputReady,
    Exported,
    Done,
    Waiting,
    Retrying,
    Raised,
}

/// Completion marker of one fork branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchMarker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
}

/// Node-kind-specific runtime state. The tag doubles as the codec key: a
/// persisted slot must match the kind of the node at its position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeSlot {
    #[default]
    None,
    Fork {
        /// Branch name → completion marker; `None` while still running.
        branches: IndexMap<String, Option<BranchMarker>>,
    },
    Switch {
        selected: Option<String>,
    },
    For {
        items: Vec<Value>,
        cursor: usize,
    },
    Try {
        caught: Option<WorkflowError>,
        in_catch: bool,
    },
    Wait {
        resumed: bool,
    },
    Listen {
        event: Option<Value>,
    },
}

impl NodeSlot {
    fn tag(&self) -> &'static str {
        match self {
            NodeSlot::None => "none",
            NodeSlot::Fork { .. } => "fork",
            NodeSlot::Switch { .. } => "switch",
            NodeSlot::For { .. } => "for",
            NodeSlot::Try { .. } => "try",
            NodeSlot::Wait { .. } => "wait",
            NodeSlot::Listen { .. } => "listen",
        }
    }

    fn compatible_with(&self, kind: &NodeKind) -> bool {
        match self {
            NodeSlot::None => true,
            NodeSlot::Fork { .. } => matches!(kind, NodeKind::Fork { .. }),
            NodeSlot::Switch { .. } => matches!(kind, NodeKind::Switch { .. }),
            NodeSlot::For { .. } => matches!(kind, NodeKind::For { .. }),
            NodeSlot::Try { .. } => matches!(kind, NodeKind::Try { .. }),
            NodeSlot::Wait { .. } => matches!(kind, NodeKind::Wait { .. }),
            NodeSlot::Listen { .. } => matches!(kind, NodeKind::Listen { .. }),
        }
    }
}

/// Mutable per-activation state for one [`NodeTask`] in one workflow
/// instance. Serialises to and from a `NodeState` JSON object without loss
/// for any field needed after resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Present on the root instance only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub raw_input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformed_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformed_output: Option<Value>,
    /// The instance context; carried on the root instance only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Index of the child currently executing; -1 before entry.
    pub child_index: i64,
    pub started_at: DateTime<Utc>,
    pub attempt_index: u32,
    /// Wall-clock deadline derived from `timeoutAfter` when the node
    /// suspends; checked at the next activation step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub slot: NodeSlot,
}

impl NodeInstance {
    #[must_use]
    pub fn new(raw_input: Value) -> Self {
        NodeInstance {
            workflow_id: None,
            raw_input,
            transformed_input: None,
            raw_output: None,
            transformed_output: None,
            context: None,
            child_index: -1,
            started_at: Utc::now(),
            attempt_index: 0,
            deadline: None,
            phase: Phase::New,
            slot: NodeSlot::None,
        }
    }

    /// Encode into a `NodeState` JSON object.
    #[must_use]
    pub fn encode(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decode a persisted `NodeState`, verifying that its slot matches the
    /// kind of the node at `position`.
    pub fn decode(node: &NodeTask, state: &Value) -> Result<Self> {
        let instance: NodeInstance =
            serde_json::from_value(state.clone()).context(MalformedSnafu {
                position: node.position.clone(),
            })?;
        ensure!(
            instance.slot.compatible_with(&node.kind),
            KindMismatchSnafu {
                position: node.position.clone(),
                expected: node.kind.tag(),
                found: instance.slot.tag(),
            }
        );
        Ok(instance)
    }

    /// Reset body progress for re-entry (retry of a failed node). The raw
    /// input is kept; derived fields are recomputed on the next activation.
    pub fn reset_for_retry(&mut self) {
        self.transformed_input = None;
        self.raw_output = None;
        self.transformed_output = None;
        self.child_index = -1;
        self.phase = Phase::Retrying;
        self.deadline = None;
        self.slot = NodeSlot::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wait_node() -> NodeTask {
        NodeTask {
            name: "pause".to_string(),
            position: "/do/0/pause".parse().unwrap(),
            kind: NodeKind::Wait {
                duration: Duration::from_secs(5),
            },
            children: Vec::new(),
            input_from: None,
            output_as: None,
            export_as: None,
            timeout_after: None,
            retry: None,
            catch: None,
            then: None,
            if_cond: None,
        }
    }

    #[test]
    fn state_round_trips_without_loss() {
        let mut instance = NodeInstance::new(json!({"x": 1}));
        instance.transformed_input = Some(json!({"x": 1}));
        instance.attempt_index = 2;
        instance.phase = Phase::Waiting;
        instance.slot = NodeSlot::Wait { resumed: false };

        let node = wait_node();
        let encoded = instance.encode();
        let decoded = NodeInstance::decode(&node, &encoded).unwrap();
        assert_eq!(decoded, instance);
    }

    #[test]
    fn mismatched_slot_kind_is_rejected() {
        let mut instance = NodeInstance::new(Value::Null);
        instance.slot = NodeSlot::Fork {
            branches: IndexMap::new(),
        };
        let node = wait_node();
        let err = NodeInstance::decode(&node, &instance.encode()).unwrap_err();
        assert!(err.to_string().contains("fork"));
    }

    #[test]
    fn reset_for_retry_keeps_raw_input_and_attempts() {
        let mut instance = NodeInstance::new(json!({"x": 1}));
        instance.transformed_input = Some(json!({"x": 1}));
        instance.raw_output = Some(json!(2));
        instance.child_index = 3;
        instance.attempt_index = 1;
        instance.reset_for_retry();
        assert_eq!(instance.raw_input, json!({"x": 1}));
        assert_eq!(instance.attempt_index, 1);
        assert_eq!(instance.child_index, -1);
        assert_eq!(instance.raw_output, None);
        assert_eq!(instance.phase, Phase::Retrying);
    }

    #[test]
    fn fork_markers_survive_the_codec() {
        let mut branches = IndexMap::new();
        branches.insert(
            "left".to_string(),
            Some(BranchMarker {
                output: Some(json!({"n": 1})),
                error: None,
            }),
        );
        branches.insert("right".to_string(), None);

        let mut instance = NodeInstance::new(Value::Null);
        instance.slot = NodeSlot::Fork { branches };

        let node = NodeTask {
            kind: NodeKind::Fork { compete: false },
            ..wait_node()
        };
        let decoded = NodeInstance::decode(&node, &instance.encode()).unwrap();
        let NodeSlot::Fork { branches } = decoded.slot else {
            panic!("expected fork slot");
        };
        assert_eq!(branches["left"].as_ref().unwrap().output, Some(json!({"n": 1})));
        assert!(branches["right"].is_none());
    }
}
