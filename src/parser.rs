//! Loads workflow definitions by `(name, version)` and lowers them into the
//! executable [`WorkflowTree`], assigning every node its JSON-pointer
//! position.

use std::collections::HashMap;

use serde_json::Value;
use snafu::prelude::*;

use crate::dsl::{
    FlowDirective, RunClause, TaskDefinition, TaskList, WorkflowDefinition,
};
use crate::node::{CallProtocol, CatchSpec, NodeKind, NodeTask, RunTarget};
use crate::position::NodePosition;
use crate::store::DefinitionStore;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unknown workflow definition {name} {version}"))]
    UnknownDefinition { name: String, version: String },

    #[snafu(display("workflow document does not parse: {source}"))]
    InvalidDocument { source: serde_yaml::Error },

    #[snafu(display("invalid duration at {position}: {source}"))]
    BadDuration {
        position: NodePosition,
        source: crate::dsl::InvalidDuration,
    },

    #[snafu(display("invalid retry policy at {position}: {source}"))]
    BadRetry {
        position: NodePosition,
        source: crate::dsl::RetryResolveError,
    },

    #[snafu(display("unsupported call protocol {protocol:?} at {position}"))]
    UnsupportedCall {
        position: NodePosition,
        protocol: String,
    },

    #[snafu(display("run task at {position} must name exactly one target"))]
    AmbiguousRun { position: NodePosition },

    #[snafu(display("task {target:?} referenced by `then` at {position} has no such sibling"))]
    DanglingThen {
        position: NodePosition,
        target: String,
    },

    #[snafu(display(
        "switch at {position} can fall through: add a case without `when` or a task-level `then`"
    ))]
    SwitchWithoutDefault { position: NodePosition },

    #[snafu(display("definition store error: {source}"))]
    Store { source: crate::store::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A parsed workflow: the node tree plus a position index for parent lookup.
#[derive(Debug, Clone)]
pub struct WorkflowTree {
    pub name: String,
    pub version: String,
    /// The document as parsed JSON, exposed to expressions via `$workflow`.
    pub definition: Value,
    /// Secret names the workflow declares under `use.secrets`.
    pub secrets: Vec<String>,
    pub root: NodeTask,
    index: HashMap<NodePosition, Vec<usize>>,
}

impl WorkflowTree {
    /// Look up the node at a position; `None` when the pointer does not name
    /// a node of this tree.
    #[must_use]
    pub fn node_at(&self, position: &NodePosition) -> Option<&NodeTask> {
        let path = self.index.get(position)?;
        let mut node = &self.root;
        for &child in path {
            node = node.children.get(child)?;
        }
        Some(node)
    }

    /// The parent of the node at `position` (relation + lookup, never an
    /// owned back-reference).
    #[must_use]
    pub fn parent_of(&self, position: &NodePosition) -> Option<&NodeTask> {
        let path = self.index.get(position)?;
        if path.is_empty() {
            return None;
        }
        let mut node = &self.root;
        for &child in &path[..path.len() - 1] {
            node = node.children.get(child)?;
        }
        Some(node)
    }

    /// The chain of nodes from the root down to (and including) `position`.
    #[must_use]
    pub fn ancestors_of(&self, position: &NodePosition) -> Vec<&NodeTask> {
        let Some(path) = self.index.get(position) else {
            return Vec::new();
        };
        let mut chain = Vec::with_capacity(path.len() + 1);
        let mut node = &self.root;
        chain.push(node);
        for &child in path {
            match node.children.get(child) {
                Some(next) => {
                    node = next;
                    chain.push(node);
                }
                None => return Vec::new(),
            }
        }
        chain
    }
}

/// Load and parse a definition from the store.
pub async fn parse(store: &dyn DefinitionStore, name: &str, version: &str) -> Result<WorkflowTree> {
    let record = store
        .get(name, version)
        .await
        .context(StoreSnafu)?
        .context(UnknownDefinitionSnafu { name, version })?;
    parse_str(&record.definition)
}

/// Parse a serialised definition (YAML or JSON; YAML is a superset).
pub fn parse_str(text: &str) -> Result<WorkflowTree> {
    let document: WorkflowDefinition = serde_yaml::from_str(text).context(InvalidDocumentSnafu)?;
    build_tree(document)
}

fn build_tree(document: WorkflowDefinition) -> Result<WorkflowTree> {
    let definition = serde_json::to_value(&document).unwrap_or(Value::Null);
    let root_position = NodePosition::root();
    let children = lower_list(&document.do_, &root_position, "do")?;

    let root = NodeTask {
        name: document.document.name.clone(),
        position: root_position,
        kind: NodeKind::Do,
        children,
        input_from: document.input.as_ref().and_then(|i| i.from.clone()),
        output_as: document.output.as_ref().and_then(|o| o.as_.clone()),
        export_as: None,
        timeout_after: None,
        retry: None,
        catch: None,
        then: None,
        if_cond: None,
    };

    let mut index = HashMap::new();
    index_node(&root, &mut Vec::new(), &mut index);

    Ok(WorkflowTree {
        name: document.document.name,
        version: document.document.version,
        definition,
        secrets: document
            .use_
            .and_then(|u| u.secrets)
            .unwrap_or_default(),
        root,
        index,
    })
}

fn index_node(
    node: &NodeTask,
    path: &mut Vec<usize>,
    index: &mut HashMap<NodePosition, Vec<usize>>,
) {
    index.insert(node.position.clone(), path.clone());
    for (i, child) in node.children.iter().enumerate() {
        path.push(i);
        index_node(child, path, index);
        path.pop();
    }
}

/// Lower a named task list under `segment` (`do`, `try`, `catch/do`, ...),
/// producing children positioned at `<parent>/<segment>/<i>/<name>`.
fn lower_list(list: &TaskList, parent: &NodePosition, segment: &str) -> Result<Vec<NodeTask>> {
    let mut base = parent.clone();
    for part in segment.split('/') {
        base = base.name(part);
    }

    let mut children = Vec::with_capacity(list.len());
    for (i, (name, task)) in list.iter().enumerate() {
        let position = base.index(i).name(name);
        children.push(lower_task(name, task, position)?);
    }

    // `then: someTask` must reference a sibling in the same list.
    for child in &children {
        if let Some(FlowDirective::Task(target)) = &child.then {
            ensure!(
                children.iter().any(|sibling| &sibling.name == target),
                DanglingThenSnafu {
                    position: child.position.clone(),
                    target: target.clone(),
                }
            );
        }
    }
    Ok(children)
}

fn lower_task(name: &str, task: &TaskDefinition, position: NodePosition) -> Result<NodeTask> {
    let base = task.base();

    let timeout_after = base
        .timeout
        .as_ref()
        .map(|t| t.after.to_duration())
        .transpose()
        .context(BadDurationSnafu {
            position: position.clone(),
        })?;
    let retry = base
        .retry
        .as_ref()
        .map(|r| r.resolve())
        .transpose()
        .context(BadRetrySnafu {
            position: position.clone(),
        })?;

    let (kind, children, catch, extra_retry) = match task {
        TaskDefinition::Do(def) => {
            let children = lower_list(&def.do_, &position, "do")?;
            (NodeKind::Do, children, None, None)
        }
        TaskDefinition::For(def) => {
            let children = lower_list(&def.do_, &position, "do")?;
            let kind = NodeKind::For {
                each: def.for_.each.clone(),
                at: def.for_.at.clone().unwrap_or_else(|| "index".to_string()),
                in_expr: def.for_.in_.clone(),
            };
            (kind, children, None, None)
        }
        TaskDefinition::Try(def) => {
            let mut children = lower_list(&def.try_, &position, "try")?;
            let body_len = children.len();
            let handler = match &def.catch.do_ {
                Some(handler) => lower_list(handler, &position, "catch/do")?,
                None => Vec::new(),
            };
            let handler_len = handler.len();
            children.extend(handler);

            let catch = CatchSpec {
                with: def
                    .catch
                    .errors
                    .as_ref()
                    .and_then(|e| e.with.clone())
                    .unwrap_or_default(),
                when: def.catch.when.clone(),
                except_when: def.catch.except_when.clone(),
                var_name: def
                    .catch
                    .as_
                    .clone()
                    .unwrap_or_else(|| "error".to_string()),
                handler_len,
            };
            let catch_retry = def
                .catch
                .retry
                .as_ref()
                .map(|r| r.resolve())
                .transpose()
                .context(BadRetrySnafu {
                    position: position.clone(),
                })?;
            (
                NodeKind::Try { body_len },
                children,
                Some(catch),
                catch_retry,
            )
        }
        TaskDefinition::Fork(def) => {
            let children = lower_list(&def.fork.branches, &position, "fork/branches")?;
            (
                NodeKind::Fork {
                    compete: def.fork.compete,
                },
                children,
                None,
                None,
            )
        }
        TaskDefinition::Switch(def) => {
            let cases = def.switch.0.clone();
            // Definitions are immutable once uploaded, so a switch that can
            // miss every case is rejected here, not at runtime: it needs a
            // when-less default case or the task's own `then` as fallback.
            let has_default = cases.iter().any(|(_, case)| case.when.is_none());
            ensure!(
                has_default || base.then.is_some(),
                SwitchWithoutDefaultSnafu {
                    position: position.clone()
                }
            );
            (NodeKind::Switch { cases }, Vec::new(), None, None)
        }
        TaskDefinition::Raise(def) => (
            NodeKind::Raise {
                error: def.raise.error.clone(),
            },
            Vec::new(),
            None,
            None,
        ),
        TaskDefinition::Set(def) => (
            NodeKind::Set {
                value: def.set.clone(),
            },
            Vec::new(),
            None,
            None,
        ),
        TaskDefinition::Wait(def) => {
            let duration = def.wait.to_duration().context(BadDurationSnafu {
                position: position.clone(),
            })?;
            (NodeKind::Wait { duration }, Vec::new(), None, None)
        }
        TaskDefinition::Run(def) => {
            let target = lower_run(&def.run, &position)?;
            (NodeKind::Run { target }, Vec::new(), None, None)
        }
        TaskDefinition::Call(def) => {
            let protocol = match def.call.as_str() {
                "http" => CallProtocol::Http,
                "grpc" => CallProtocol::Grpc,
                "asyncapi" => CallProtocol::AsyncApi,
                other => {
                    return UnsupportedCallSnafu {
                        position,
                        protocol: other.to_string(),
                    }
                    .fail()
                }
            };
            (
                NodeKind::Call {
                    protocol,
                    with: def.with.clone().unwrap_or_default(),
                },
                Vec::new(),
                None,
                None,
            )
        }
        TaskDefinition::Emit(def) => (
            NodeKind::Emit {
                event: def.emit.event.with.clone(),
            },
            Vec::new(),
            None,
            None,
        ),
        TaskDefinition::Listen(def) => (
            NodeKind::Listen {
                to: def.listen.to.clone(),
            },
            Vec::new(),
            None,
            None,
        ),
    };

    Ok(NodeTask {
        name: name.to_string(),
        position,
        kind,
        children,
        input_from: base.input.as_ref().and_then(|i| i.from.clone()),
        output_as: base.output.as_ref().and_then(|o| o.as_.clone()),
        export_as: base.export.as_ref().and_then(|e| e.as_.clone()),
        timeout_after,
        // A retry policy on the task itself wins; `catch.retry` covers the
        // try body when no task-level policy is present.
        retry: retry.or(extra_retry),
        catch,
        then: base.then.clone(),
        if_cond: base.if_.clone(),
    })
}

fn lower_run(run: &RunClause, position: &NodePosition) -> Result<RunTarget> {
    let mut targets: Vec<RunTarget> = Vec::new();
    if let Some(subflow) = &run.workflow {
        targets.push(RunTarget::Workflow {
            name: subflow.name.clone(),
            version: subflow.version.clone(),
            input: subflow.input.clone(),
        });
    }
    if let Some(shell) = &run.shell {
        targets.push(RunTarget::Shell(shell.clone()));
    }
    if let Some(script) = &run.script {
        targets.push(RunTarget::Script(script.clone()));
    }
    if let Some(container) = &run.container {
        targets.push(RunTarget::Container(container.clone()));
    }
    ensure!(
        targets.len() == 1,
        AmbiguousRunSnafu {
            position: position.clone()
        }
    );
    Ok(targets.remove(0))
}
