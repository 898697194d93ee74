//! Serde model of the Serverless Workflow DSL document.
//!
//! Deserialises from YAML or JSON. The model is deliberately close to the
//! wire shape; lowering into the executable node tree happens in
//! [`crate::parser`].

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::retry::{Backoff, Jitter, RetryPolicy};

/// An ordered list of named entries, serialised as a sequence of single-entry
/// maps (`- taskName: {...}`), the shape the DSL uses for `do`, `try`,
/// `fork.branches` and `switch`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NamedList<T>(pub Vec<(String, T)>);

impl<T> NamedList<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, T)> {
        self.0.iter()
    }
}

impl<T: Serialize> Serialize for NamedList<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            let mut entry = IndexMap::with_capacity(1);
            entry.insert(name, value);
            seq.serialize_element(&entry)?;
        }
        seq.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedList<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries: Vec<IndexMap<String, T>> = Vec::deserialize(deserializer)?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.len() != 1 {
                return Err(de::Error::custom(
                    "expected a single-entry map per list item",
                ));
            }
            for (name, value) in entry {
                items.push((name, value));
            }
        }
        Ok(NamedList(items))
    }
}

pub type TaskList = NamedList<TaskDefinition>;

/// Top-level workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub document: DocumentMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputClause>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<UseClause>,
    #[serde(rename = "do")]
    pub do_: TaskList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub dsl: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UseClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputClause {
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExportClause {
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutClause {
    pub after: DurationSpec,
}

/// Fields shared by every task kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskBase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
}

/// Where control flows after a task completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowDirective {
    Continue,
    Exit,
    End,
    Task(String),
}

impl Serialize for FlowDirective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = match self {
            FlowDirective::Continue => "continue",
            FlowDirective::Exit => "exit",
            FlowDirective::End => "end",
            FlowDirective::Task(name) => name,
        };
        serializer.serialize_str(text)
    }
}

impl<'de> Deserialize<'de> for FlowDirective {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(match text.as_str() {
            "continue" => FlowDirective::Continue,
            "exit" => FlowDirective::Exit,
            "end" => FlowDirective::End,
            _ => FlowDirective::Task(text),
        })
    }
}

/// A duration, either inline components or an ISO 8601 expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    Inline(DurationInline),
    Iso8601(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DurationInline {
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
    #[serde(default)]
    pub milliseconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidDuration {
    pub text: String,
}

impl fmt::Display for InvalidDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ISO 8601 duration: {:?}", self.text)
    }
}

impl std::error::Error for InvalidDuration {}

impl DurationSpec {
    pub fn to_duration(&self) -> Result<Duration, InvalidDuration> {
        match self {
            DurationSpec::Inline(inline) => {
                let millis = inline.days * 86_400_000
                    + inline.hours * 3_600_000
                    + inline.minutes * 60_000
                    + inline.seconds * 1_000
                    + inline.milliseconds;
                Ok(Duration::from_millis(millis))
            }
            DurationSpec::Iso8601(text) => parse_iso8601_duration(text),
        }
    }
}

/// Parse an ISO 8601 duration of the `P[nD][T[nH][nM][nS]]` form. Fractional
/// time components are accepted (`PT0.5S`); calendar components beyond days
/// are not.
fn parse_iso8601_duration(text: &str) -> Result<Duration, InvalidDuration> {
    let pattern = Regex::new(
        r"^P(?:(\d+(?:\.\d+)?)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .expect("duration pattern is valid");

    let trimmed = text.trim();
    let captures = pattern.captures(trimmed).ok_or_else(|| InvalidDuration {
        text: text.to_string(),
    })?;
    if captures
        .iter()
        .skip(1)
        .all(|capture| capture.is_none())
    {
        return Err(InvalidDuration {
            text: text.to_string(),
        });
    }

    let component = |index: usize| -> f64 {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    let total_ms = component(1) * 86_400_000.0
        + component(2) * 3_600_000.0
        + component(3) * 60_000.0
        + component(4) * 1_000.0;
    Ok(Duration::from_millis(total_ms as u64))
}

/// Retry policy as written in the DSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyDef {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    pub base: DurationSpec,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<JitterDef>,
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DurationSpec>,
}

#[derive(Debug)]
pub enum RetryResolveError {
    Duration(InvalidDuration),
    Jitter(crate::retry::Error),
}

impl fmt::Display for RetryResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryResolveError::Duration(e) => write!(f, "{e}"),
            RetryResolveError::Jitter(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RetryResolveError {}

impl RetryPolicyDef {
    /// Resolve into an executable [`RetryPolicy`], validating durations and
    /// the jitter range.
    pub fn resolve(&self) -> Result<RetryPolicy, RetryResolveError> {
        let base = self
            .base
            .to_duration()
            .map_err(RetryResolveError::Duration)?;
        let cap = self
            .cap
            .as_ref()
            .map(DurationSpec::to_duration)
            .transpose()
            .map_err(RetryResolveError::Duration)?;
        let jitter = match &self.jitter {
            None => None,
            Some(def) => {
                let from = def
                    .from
                    .as_ref()
                    .map(DurationSpec::to_duration)
                    .transpose()
                    .map_err(RetryResolveError::Duration)?;
                let to = def
                    .to
                    .as_ref()
                    .map(DurationSpec::to_duration)
                    .transpose()
                    .map_err(RetryResolveError::Duration)?;
                Some(Jitter::new(from, to).map_err(RetryResolveError::Jitter)?)
            }
        };
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            base,
            multiplier: self.multiplier,
            cap,
            jitter,
        })
    }
}

/// Error definition inside a `raise` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDef {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseClause {
    pub error: ErrorDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(
        rename = "exceptWhen",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub except_when: Option<String>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyDef>,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<IndexMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkClause {
    pub branches: TaskList,
    #[serde(default)]
    pub compete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForClause {
    #[serde(default = "default_loop_var")]
    pub each: String,
    #[serde(rename = "in")]
    pub in_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

fn default_loop_var() -> String {
    "item".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    pub then: FlowDirective,
}

/// Values of a `set` task: a map of templates, or a single expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetValue {
    Map(IndexMap<String, Value>),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<SubflowDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubflowDef {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitClause {
    pub event: EventDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDef {
    pub with: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenClause {
    pub to: Value,
}

// Task definitions. Untagged: each variant is discriminated by its required
// keyword. `For` and `Try` carry a `do`/`try` body and must precede plain
// `Do` so the more specific shape wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskDefinition {
    For(ForTaskDef),
    Try(TryTaskDef),
    Fork(ForkTaskDef),
    Switch(SwitchTaskDef),
    Raise(RaiseTaskDef),
    Call(CallTaskDef),
    Emit(EmitTaskDef),
    Listen(ListenTaskDef),
    Run(RunTaskDef),
    Set(SetTaskDef),
    Wait(WaitTaskDef),
    Do(DoTaskDef),
}

impl TaskDefinition {
    #[must_use]
    pub fn base(&self) -> &TaskBase {
        match self {
            TaskDefinition::For(t) => &t.common,
            TaskDefinition::Try(t) => &t.common,
            TaskDefinition::Fork(t) => &t.common,
            TaskDefinition::Switch(t) => &t.common,
            TaskDefinition::Raise(t) => &t.common,
            TaskDefinition::Call(t) => &t.common,
            TaskDefinition::Emit(t) => &t.common,
            TaskDefinition::Listen(t) => &t.common,
            TaskDefinition::Run(t) => &t.common,
            TaskDefinition::Set(t) => &t.common,
            TaskDefinition::Wait(t) => &t.common,
            TaskDefinition::Do(t) => &t.common,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            TaskDefinition::For(_) => "for",
            TaskDefinition::Try(_) => "try",
            TaskDefinition::Fork(_) => "fork",
            TaskDefinition::Switch(_) => "switch",
            TaskDefinition::Raise(_) => "raise",
            TaskDefinition::Call(_) => "call",
            TaskDefinition::Emit(_) => "emit",
            TaskDefinition::Listen(_) => "listen",
            TaskDefinition::Run(_) => "run",
            TaskDefinition::Set(_) => "set",
            TaskDefinition::Wait(_) => "wait",
            TaskDefinition::Do(_) => "do",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoTaskDef {
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTaskDef {
    #[serde(rename = "for")]
    pub for_: ForClause,
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryTaskDef {
    #[serde(rename = "try")]
    pub try_: TaskList,
    pub catch: CatchClause,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkTaskDef {
    pub fork: ForkClause,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchTaskDef {
    pub switch: NamedList<SwitchCase>,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTaskDef {
    pub raise: RaiseClause,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTaskDef {
    pub call: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<IndexMap<String, Value>>,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTaskDef {
    pub emit: EmitClause,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTaskDef {
    pub listen: ListenClause,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTaskDef {
    pub run: RunClause,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTaskDef {
    pub set: SetValue,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTaskDef {
    pub wait: DurationSpec,
    #[serde(flatten)]
    pub common: TaskBase,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
document:
  dsl: '1.0.0'
  namespace: examples
  name: linear
  version: '0.1.0'
do:
  - first:
      set:
        y: "${ .x + 1 }"
  - second:
      set:
        z: "${ .y * 2 }"
"#;

    #[test]
    fn parses_linear_document() {
        let workflow: WorkflowDefinition = serde_yaml::from_str(LINEAR).unwrap();
        assert_eq!(workflow.document.name, "linear");
        assert_eq!(workflow.do_.len(), 2);
        let (name, task) = &workflow.do_.0[0];
        assert_eq!(name, "first");
        assert!(matches!(task, TaskDefinition::Set(_)));
    }

    #[test]
    fn for_wins_over_do_in_untagged_order() {
        let yaml = r#"
for:
  each: color
  in: "${ .colors }"
do:
  - paint:
      set:
        painted: "${ $color }"
"#;
        let task: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(task, TaskDefinition::For(_)));
    }

    #[test]
    fn try_catch_parses_with_filter() {
        let yaml = r#"
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
"#;
        let task: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        let TaskDefinition::Try(try_task) = task else {
            panic!("expected try task");
        };
        let with = try_task.catch.errors.unwrap().with.unwrap();
        assert_eq!(with["type"], "runtime");
        assert_eq!(try_task.catch.as_.as_deref(), Some("error"));
    }

    #[test]
    fn wait_parses_inline_and_iso_durations() {
        let inline: TaskDefinition = serde_yaml::from_str("wait:\n  seconds: 5\n").unwrap();
        let TaskDefinition::Wait(wait) = inline else {
            panic!("expected wait task");
        };
        assert_eq!(wait.wait.to_duration().unwrap(), Duration::from_secs(5));

        let iso: TaskDefinition = serde_yaml::from_str("wait: PT1M30S\n").unwrap();
        let TaskDefinition::Wait(wait) = iso else {
            panic!("expected wait task");
        };
        assert_eq!(wait.wait.to_duration().unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn iso_duration_rejects_garbage() {
        assert!(parse_iso8601_duration("5S").is_err());
        assert!(parse_iso8601_duration("PT").is_err());
        assert!(parse_iso8601_duration("P1Y").is_err());
        assert_eq!(
            parse_iso8601_duration("PT0.5S").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            parse_iso8601_duration("P1DT1H").unwrap(),
            Duration::from_secs(90_000)
        );
    }

    #[test]
    fn flow_directive_keywords() {
        let switch: NamedList<SwitchCase> = serde_yaml::from_str(
            r#"
- big:
    when: "${ .n > 10 }"
    then: huge
- default:
    then: end
"#,
        )
        .unwrap();
        assert_eq!(
            switch.0[0].1.then,
            FlowDirective::Task("huge".to_string())
        );
        assert_eq!(switch.0[1].1.then, FlowDirective::End);
    }

    #[test]
    fn retry_policy_resolves_with_jitter() {
        let yaml = r#"
maxAttempts: 3
backoff: exponential
base: PT1S
multiplier: 2
jitter:
  to: PT1S
"#;
        let def: RetryPolicyDef = serde_yaml::from_str(yaml).unwrap();
        let policy = def.resolve().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base, Duration::from_secs(1));
        let jitter = policy.jitter.unwrap();
        assert_eq!(jitter.from, Duration::ZERO);
        assert_eq!(jitter.to, Duration::from_secs(1));
    }

    #[test]
    fn inverted_jitter_fails_resolution() {
        let yaml = r#"
maxAttempts: 2
base: PT1S
jitter:
  from: PT2S
  to: PT1S
"#;
        let def: RetryPolicyDef = serde_yaml::from_str(yaml).unwrap();
        assert!(def.resolve().is_err());
    }

    #[test]
    fn named_list_round_trips_through_json() {
        let workflow: WorkflowDefinition = serde_yaml::from_str(LINEAR).unwrap();
        let json = serde_json::to_string(&workflow).unwrap();
        let reparsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed, workflow);
    }
}
