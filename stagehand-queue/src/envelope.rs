//! Job envelope: the serialized reference to a backgrounded call.
//!
//! An envelope never carries a record body, only the record's primary key,
//! so a model-instance job always acts on the record as it exists when the
//! job runs.
//!
//! Wire shape:
//!
//! ```json
//! {"targetKind": "modelInstance", "globalName": "User", "recordId": 7,
//!  "method": "sendWelcome", "args": ["hi"]}
//! ```

use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Primary key of a model record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId::Int(id)
    }
}

impl From<i32> for RecordId {
    fn from(id: i32) -> Self {
        RecordId::Int(id.into())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId::Text(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Text(id.to_string())
    }
}

/// Broker job name, one per target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "BackgroundJobQueueStaticJob")]
    Static,
    #[serde(rename = "BackgroundJobQueueModelInstanceJob")]
    ModelInstance,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Static => "BackgroundJobQueueStaticJob",
            JobType::ModelInstance => "BackgroundJobQueueModelInstanceJob",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A static method on a registered class.
    Static { global_name: String },
    /// An instance method on a record fetched by primary key.
    ModelInstance {
        global_name: String,
        record_id: RecordId,
    },
}

impl Target {
    pub fn global_name(&self) -> &str {
        match self {
            Target::Static { global_name } | Target::ModelInstance { global_name, .. } => {
                global_name
            }
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Target::Static { .. } => JobType::Static,
            Target::ModelInstance { .. } => JobType::ModelInstance,
        }
    }
}

/// Serialized call: target, method name and positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct JobEnvelope {
    target: Target,
    method: String,
    args: Vec<Value>,
}

impl JobEnvelope {
    /// Envelope for a static method call.
    pub fn for_static(
        global_name: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            target: Target::Static {
                global_name: global_name.into(),
            },
            method: method.into(),
            args,
        }
    }

    /// Envelope for an instance method on the record with `record_id`.
    pub fn for_record(
        global_name: impl Into<String>,
        record_id: impl Into<RecordId>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            target: Target::ModelInstance {
                global_name: global_name.into(),
                record_id: record_id.into(),
            },
            method: method.into(),
            args,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn global_name(&self) -> &str {
        self.target.global_name()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn job_type(&self) -> JobType {
        self.target.job_type()
    }

    /// Encode into the JSON job payload.
    pub fn encode(&self) -> QueueResult<Value> {
        serde_json::to_value(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    /// Decode a JSON job payload.
    pub fn decode(payload: &Value) -> QueueResult<Self> {
        Self::deserialize(payload).map_err(|e| QueueError::InvalidEnvelope(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum TargetKind {
    Static,
    ModelInstance,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    target_kind: TargetKind,
    global_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record_id: Option<RecordId>,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl TryFrom<WireEnvelope> for JobEnvelope {
    type Error = QueueError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.global_name.is_empty() {
            return Err(QueueError::InvalidEnvelope("empty globalName".into()));
        }
        if wire.method.is_empty() {
            return Err(QueueError::InvalidEnvelope("empty method".into()));
        }

        let target = match (wire.target_kind, wire.record_id) {
            (TargetKind::Static, None) => Target::Static {
                global_name: wire.global_name,
            },
            (TargetKind::Static, Some(_)) => {
                return Err(QueueError::InvalidEnvelope(
                    "static target must not carry a recordId".into(),
                ));
            }
            (TargetKind::ModelInstance, Some(record_id)) => Target::ModelInstance {
                global_name: wire.global_name,
                record_id,
            },
            (TargetKind::ModelInstance, None) => {
                return Err(QueueError::InvalidEnvelope(
                    "model instance target requires a recordId".into(),
                ));
            }
        };

        Ok(Self {
            target,
            method: wire.method,
            args: wire.args,
        })
    }
}

impl From<JobEnvelope> for WireEnvelope {
    fn from(envelope: JobEnvelope) -> Self {
        let (target_kind, global_name, record_id) = match envelope.target {
            Target::Static { global_name } => (TargetKind::Static, global_name, None),
            Target::ModelInstance {
                global_name,
                record_id,
            } => (TargetKind::ModelInstance, global_name, Some(record_id)),
        };

        Self {
            target_kind,
            global_name,
            record_id,
            method: envelope.method,
            args: envelope.args,
        }
    }
}
