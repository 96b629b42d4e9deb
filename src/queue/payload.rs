/// Type-specific job payload shapes
///
/// The queue stores payloads as opaque JSON but refuses to persist one that
/// the worker for its type could never interpret. Workers deserialize the same
/// structs when they pick a job up. Extra keys (node input, execution context)
/// are carried along untouched.

use crate::error::QueueError;
use crate::queue::types::JobType;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

const HTTP_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptType {
    Bash,
    Python,
    Node,
}

impl ScriptType {
    /// Interpreter binary used to run scripts of this type
    pub fn interpreter(&self) -> &'static str {
        match self {
            ScriptType::Bash => "bash",
            ScriptType::Python => "python3",
            ScriptType::Node => "node",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpec {
    #[serde(rename = "type")]
    pub script_type: ScriptType,
    pub content: String,
    pub working_directory: Option<String>,
}

/// SCRIPT: `{ "script": {...}, "environment": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub script: ScriptSpec,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSpec {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

/// HTTP_REQUEST: `{ "http": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpPayload {
    pub http: HttpSpec,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolActionSpec {
    pub tool_type: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
}

/// TOOL_ACTION: `{ "toolAction": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolActionPayload {
    pub tool_action: ToolActionSpec,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshTargetSpec {
    pub server_id: String,
}

/// SSH: `{ "target": {"serverId": ...}, "script": {...}, "payloadRef": ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshPayload {
    pub target: SshTargetSpec,
    pub script: ScriptSpec,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Versioned, checksummed reference to the packaged script archive
    pub payload_ref: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// Reject payloads that do not match their job type
pub fn validate(job_type: JobType, payload: &Value) -> Result<(), QueueError> {
    let invalid = |reason: String| QueueError::InvalidPayload { job_type, reason };

    match job_type {
        JobType::Script => {
            let parsed: ScriptPayload = parse(job_type, payload)?;
            if parsed.script.content.trim().is_empty() {
                return Err(invalid("script content is empty".to_string()));
            }
        }
        JobType::HttpRequest => {
            let parsed: HttpPayload = parse(job_type, payload)?;
            let method = parsed.http.method.to_uppercase();
            if !HTTP_METHODS.contains(&method.as_str()) {
                return Err(invalid(format!("unsupported HTTP method {}", parsed.http.method)));
            }
            let url = reqwest::Url::parse(&parsed.http.url)
                .map_err(|e| invalid(format!("bad url {}: {}", parsed.http.url, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!("unsupported url scheme {}", url.scheme())));
            }
        }
        JobType::ToolAction => {
            let parsed: ToolActionPayload = parse(job_type, payload)?;
            if parsed.tool_action.tool_type.is_empty() || parsed.tool_action.action.is_empty() {
                return Err(invalid("toolType and action are required".to_string()));
            }
        }
        JobType::Ssh => {
            let parsed: SshPayload = parse(job_type, payload)?;
            if parsed.target.server_id.is_empty() {
                return Err(invalid("target.serverId is required".to_string()));
            }
            if parsed.script.content.trim().is_empty() {
                return Err(invalid("script content is empty".to_string()));
            }
        }
    }

    Ok(())
}

fn parse<T: DeserializeOwned>(job_type: JobType, payload: &Value) -> Result<T, QueueError> {
    T::deserialize(payload).map_err(|e| QueueError::InvalidPayload {
        job_type,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_payloads() {
        let script = json!({ "script": { "type": "BASH", "content": "echo hi" } });
        assert!(validate(JobType::Script, &script).is_ok());

        let http = json!({ "http": { "method": "post", "url": "https://example.com/hook" } });
        assert!(validate(JobType::HttpRequest, &http).is_ok());

        let tool = json!({ "toolAction": { "toolType": "slack", "action": "send" } });
        assert!(validate(JobType::ToolAction, &tool).is_ok());

        let ssh = json!({
            "target": { "serverId": "srv-1" },
            "script": { "type": "PYTHON", "content": "print(1)" }
        });
        assert!(validate(JobType::Ssh, &ssh).is_ok());
    }

    #[test]
    fn rejects_mismatched_payloads() {
        let empty_script = json!({ "script": { "type": "BASH", "content": "   " } });
        assert!(matches!(
            validate(JobType::Script, &empty_script),
            Err(QueueError::InvalidPayload { job_type: JobType::Script, .. })
        ));

        let bad_method = json!({ "http": { "method": "TRACE", "url": "https://example.com" } });
        assert!(validate(JobType::HttpRequest, &bad_method).is_err());

        let bad_scheme = json!({ "http": { "method": "GET", "url": "ftp://example.com" } });
        assert!(validate(JobType::HttpRequest, &bad_scheme).is_err());

        // A script payload is not an SSH payload: no target
        let script = json!({ "script": { "type": "BASH", "content": "echo hi" } });
        assert!(validate(JobType::Ssh, &script).is_err());
    }
}
