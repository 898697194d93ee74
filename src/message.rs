//! Wire codec for resumable workflow continuations.
//!
//! A message is the only form in which execution state crosses a process
//! boundary: `{"n": name, "v": version, "s": {pointer: NodeState, ...},
//! "p": pointer}` with compact field names. `s` holds the minimal ancestor
//! chain needed to resume at `p`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::position::NodePosition;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("message does not encode: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display("message does not decode: {source}"))]
    Decode { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub version: String,
    /// Position → encoded `NodeState`. A `BTreeMap` keeps key order stable so
    /// that decode/encode round-trips are byte-equal.
    #[serde(rename = "s")]
    pub states: BTreeMap<NodePosition, Value>,
    #[serde(rename = "p")]
    pub position: NodePosition,
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context(EncodeSnafu)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).context(DecodeSnafu)
    }

    /// The workflow instance id, carried on the root node's state.
    #[must_use]
    pub fn workflow_id(&self) -> Option<&str> {
        self.states
            .get(&NodePosition::root())
            .and_then(|state| state.get("workflow_id"))
            .and_then(Value::as_str)
    }
}
