//! Host-provided activities: the side-effecting bodies of `call`, `run` and
//! friends. From the interpreter's view each activity is a one-step async
//! operation that returns JSON or raises a [`WorkflowError`]; the interpreter
//! itself never blocks on I/O it owns.

use async_trait::async_trait;
use base64::Engine as _;
use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::errors::WorkflowError;
use crate::node::RunTarget;

/// How a `call: http` response is projected into the task's raw output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputHint {
    /// Parsed body (JSON when the content type says so, text otherwise).
    #[default]
    Content,
    /// Base64 of the response body.
    Raw,
    /// Full response descriptor: status code, headers, parsed content.
    Response,
}

impl OutputHint {
    pub fn parse(text: &str) -> Result<Self, WorkflowError> {
        match text {
            "content" => Ok(OutputHint::Content),
            "raw" => Ok(OutputHint::Raw),
            "response" => Ok(OutputHint::Response),
            other => Err(WorkflowError::validation(format!(
                "unknown call output hint {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpCallRequest {
    pub method: String,
    pub uri: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct HttpCallResponse {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpCallResponse {
    fn content(&self) -> Value {
        let is_json = self
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v.contains("json"));
        if is_json {
            if let Ok(value) = serde_json::from_slice(&self.body) {
                return value;
            }
        }
        Value::String(String::from_utf8_lossy(&self.body).into_owned())
    }

    /// Project the response per the DSL output hint. Non-2xx responses raise
    /// a communication error carrying the status.
    pub fn into_output(
        self,
        request: &HttpCallRequest,
        hint: OutputHint,
    ) -> Result<Value, WorkflowError> {
        if !(200..300).contains(&self.status) {
            return Err(WorkflowError::communication(
                self.status,
                format!("{} {} returned {}", request.method, request.uri, self.status),
            ));
        }
        let output = match hint {
            OutputHint::Raw => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(&self.body))
            }
            OutputHint::Content => self.content(),
            OutputHint::Response => {
                let headers: serde_json::Map<String, Value> = self
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                json!({
                    "request": {"method": request.method, "uri": request.uri},
                    "statusCode": self.status,
                    "headers": headers,
                    "content": self.content(),
                })
            }
        };
        Ok(output)
    }
}

/// Capability contract supplied by the host. Defaults raise runtime errors so
/// a deployment only wires what it supports.
#[async_trait]
pub trait ActivityHandler: Send + Sync + std::fmt::Debug {
    async fn http_call(&self, request: &HttpCallRequest)
        -> Result<HttpCallResponse, WorkflowError>;

    async fn grpc_call(&self, _with: &Value) -> Result<Value, WorkflowError> {
        Err(WorkflowError::runtime(
            "no gRPC call capability is configured",
        ))
    }

    async fn async_api_call(&self, _with: &Value) -> Result<Value, WorkflowError> {
        Err(WorkflowError::runtime(
            "no AsyncAPI call capability is configured",
        ))
    }

    async fn run_process(
        &self,
        _target: &RunTarget,
        _input: &Value,
    ) -> Result<Value, WorkflowError> {
        Err(WorkflowError::runtime(
            "no process execution capability is configured",
        ))
    }
}

/// Default activity set: HTTP through reqwest, everything else unconfigured.
#[derive(Debug, Default)]
pub struct HttpActivities {
    client: reqwest::Client,
}

impl HttpActivities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityHandler for HttpActivities {
    async fn http_call(
        &self,
        request: &HttpCallRequest,
    ) -> Result<HttpCallResponse, WorkflowError> {
        let method: reqwest::Method = request
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| WorkflowError::validation(format!("bad method {:?}", request.method)))?;

        let mut builder = self.client.request(method, &request.uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            WorkflowError::communication(503, format!("request to {} failed: {e}", request.uri))
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| {
                WorkflowError::communication(503, format!("reading response body failed: {e}"))
            })?
            .to_vec();

        Ok(HttpCallResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HttpCallRequest {
        HttpCallRequest {
            method: "get".to_string(),
            uri: "http://example.test/pets".to_string(),
            headers: IndexMap::new(),
            body: None,
        }
    }

    fn json_response(status: u16, body: &str) -> HttpCallResponse {
        let mut headers = IndexMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/json".to_string(),
        );
        HttpCallResponse {
            status,
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn content_hint_parses_json_bodies() {
        let output = json_response(200, r#"{"id": 7}"#)
            .into_output(&request(), OutputHint::Content)
            .unwrap();
        assert_eq!(output, json!({"id": 7}));
    }

    #[test]
    fn raw_hint_base64_encodes() {
        let output = json_response(200, "ok")
            .into_output(&request(), OutputHint::Raw)
            .unwrap();
        assert_eq!(output, json!("b2s="));
    }

    #[test]
    fn response_hint_builds_a_descriptor() {
        let output = json_response(201, r#"{"id": 7}"#)
            .into_output(&request(), OutputHint::Response)
            .unwrap();
        assert_eq!(output["statusCode"], 201);
        assert_eq!(output["content"], json!({"id": 7}));
        assert_eq!(output["request"]["method"], "get");
    }

    #[test]
    fn non_2xx_raises_communication_error() {
        let err = json_response(500, "boom")
            .into_output(&request(), OutputHint::Content)
            .unwrap_err();
        assert_eq!(err.status, 500);
        assert_eq!(err.kind, crate::errors::ErrorKind::Communication);
    }

    #[test]
    fn unknown_hint_is_a_validation_error() {
        assert!(OutputHint::parse("verbose").is_err());
        assert_eq!(OutputHint::parse("raw").unwrap(), OutputHint::Raw);
    }
}
