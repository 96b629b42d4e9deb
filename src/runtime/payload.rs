/// Job payload construction
///
/// Turns an event definition plus a node's transformed input into the JSON
/// payload a worker will interpret. SSH events additionally get a versioned,
/// checksummed `payloadRef` naming the packaged script archive; producing the
/// archive itself is the packaging service's job.

use crate::queue::types::JobType;
use crate::workflow::events::EventDefinition;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Where a payload is being built for
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub execution_id: &'a str,
    pub workflow_id: &'a str,
    pub node_id: &'a str,
    pub user_id: &'a str,
    pub input: &'a Value,
}

/// `BuildPayload(event, executionContext)`
pub trait PayloadBuilder: Send + Sync {
    fn build_payload(&self, event: &EventDefinition, ctx: &PayloadContext<'_>) -> Result<Value, String>;
}

/// Event spec + `input` + `context`, plus `payloadRef` for SSH events
#[derive(Debug, Clone, Default)]
pub struct DefaultPayloadBuilder;

impl PayloadBuilder for DefaultPayloadBuilder {
    fn build_payload(&self, event: &EventDefinition, ctx: &PayloadContext<'_>) -> Result<Value, String> {
        let Value::Object(mut payload) = event.spec.clone() else {
            return Err(format!("event '{}' spec must be a JSON object", event.id));
        };

        payload.insert("input".to_string(), ctx.input.clone());
        payload.insert(
            "context".to_string(),
            json!({
                "executionId": ctx.execution_id,
                "workflowId": ctx.workflow_id,
                "nodeId": ctx.node_id,
                "userId": ctx.user_id,
                "eventId": event.id,
                "eventVersion": event.version,
            }),
        );

        if event.job_type == JobType::Ssh && !payload.contains_key("payloadRef") {
            payload.insert("payloadRef".to_string(), Value::String(payload_ref(event)));
        }

        Ok(Value::Object(payload))
    }
}

/// `payloads/<event>/v<version>-<sha256 prefix of the spec>`
pub fn payload_ref(event: &EventDefinition) -> String {
    let digest = Sha256::digest(event.spec.to_string().as_bytes());
    let checksum = format!("{:x}", digest);
    format!("payloads/{}/v{}-{}", event.id, event.version, &checksum[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::JobPriority;

    fn event(job_type: JobType, spec: Value) -> EventDefinition {
        EventDefinition {
            id: "ev-deploy".to_string(),
            name: "deploy".to_string(),
            job_type,
            spec,
            priority: JobPriority::Normal,
            max_attempts: None,
            timeout_seconds: None,
            version: 3,
        }
    }

    fn ctx(input: &Value) -> PayloadContext<'_> {
        PayloadContext {
            execution_id: "exec-1",
            workflow_id: "wf-1",
            node_id: "deploy",
            user_id: "user-1",
            input,
        }
    }

    #[test]
    fn ssh_payloads_get_a_stable_versioned_reference() {
        let ev = event(
            JobType::Ssh,
            json!({ "target": { "serverId": "srv-1" }, "script": { "type": "BASH", "content": "make" } }),
        );
        let input = json!({ "branch": "main" });

        let first = DefaultPayloadBuilder.build_payload(&ev, &ctx(&input)).unwrap();
        let second = DefaultPayloadBuilder.build_payload(&ev, &ctx(&input)).unwrap();

        let reference = first["payloadRef"].as_str().unwrap();
        assert!(reference.starts_with("payloads/ev-deploy/v3-"));
        assert_eq!(reference.len(), "payloads/ev-deploy/v3-".len() + 12);
        assert_eq!(first["payloadRef"], second["payloadRef"]);
        assert_eq!(first["input"], input);
        assert_eq!(first["context"]["nodeId"], "deploy");
    }

    #[test]
    fn non_object_specs_are_rejected() {
        let ev = event(JobType::Script, json!("echo hi"));
        assert!(DefaultPayloadBuilder.build_payload(&ev, &ctx(&Value::Null)).is_err());

        let http = event(JobType::HttpRequest, json!({ "http": { "method": "GET", "url": "http://x" } }));
        let payload = DefaultPayloadBuilder.build_payload(&http, &ctx(&Value::Null)).unwrap();
        assert!(payload.get("payloadRef").is_none());
    }
}
