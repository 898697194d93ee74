use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::position::NodePosition;

/// The closed set of workflow error kinds defined by the DSL.
///
/// These are *domain* errors: they participate in `try`/`catch` matching and
/// retry policies. Infrastructure failures (store outage, codec bug) are kept
/// out of this taxonomy on purpose and abort the activation instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Expression,
    Authentication,
    Authorization,
    Timeout,
    Communication,
    Runtime,
}

impl ErrorKind {
    /// The default HTTP-style status carried by this kind.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Configuration | ErrorKind::Validation | ErrorKind::Expression => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Timeout => 408,
            ErrorKind::Communication | ErrorKind::Runtime => 500,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Expression => "expression",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Communication => "communication",
            ErrorKind::Runtime => "runtime",
        }
    }

    /// The canonical error type URI for this kind.
    #[must_use]
    pub fn type_uri(self) -> String {
        format!(
            "https://serverlessworkflow.io/spec/1.0.0/errors/{}",
            self.as_str()
        )
    }

    /// Parse a kind from either its short name or its full type URI.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let short = value.rsplit('/').next().unwrap_or(value);
        match short {
            "configuration" => Some(ErrorKind::Configuration),
            "validation" => Some(ErrorKind::Validation),
            "expression" => Some(ErrorKind::Expression),
            "authentication" => Some(ErrorKind::Authentication),
            "authorization" => Some(ErrorKind::Authorization),
            "timeout" => Some(ErrorKind::Timeout),
            "communication" => Some(ErrorKind::Communication),
            "runtime" => Some(ErrorKind::Runtime),
            _ => None,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raised workflow error, JSON-serialisable so that `catch` blocks can bind
/// it in scope as `$error`.
///
/// The `type` field carries the short kind name as raised by the workflow
/// (matching what `raise` blocks and `catch.errors.with` filters use); the
/// full URI form is available through [`ErrorKind::type_uri`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<NodePosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Value>>,
}

impl WorkflowError {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        WorkflowError {
            kind,
            status: kind.status(),
            title: None,
            detail: None,
            instance: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach the raising node's position if none is recorded yet. Errors keep
    /// the position of the node that raised them as they bubble up.
    #[must_use]
    pub fn at(mut self, position: &NodePosition) -> Self {
        if self.instance.is_none() {
            self.instance = Some(position.clone());
        }
        self
    }

    pub fn expression(detail: impl Into<String>) -> Self {
        WorkflowError::new(ErrorKind::Expression).with_detail(detail)
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        WorkflowError::new(ErrorKind::Configuration).with_detail(detail)
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        WorkflowError::new(ErrorKind::Validation).with_detail(detail)
    }

    pub fn runtime(detail: impl Into<String>) -> Self {
        WorkflowError::new(ErrorKind::Runtime).with_detail(detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        WorkflowError::new(ErrorKind::Timeout).with_detail(detail)
    }

    pub fn communication(status: u16, detail: impl Into<String>) -> Self {
        WorkflowError::new(ErrorKind::Communication)
            .with_status(status)
            .with_detail(detail)
    }

    /// The JSON projection bound as `$error` inside catch handlers.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Display for WorkflowError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} error (status {})", self.kind, self.status)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(instance) = &self.instance {
            write!(f, " at {instance}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkflowError {}
