/// Job handlers, one per job type
///
/// An orchestrator looks the claimed job's type up in the `HandlerRegistry`
/// and awaits the handler. Handlers return the job result as JSON; any error
/// becomes the job's `lastError` and goes through the queue's retry policy.

use crate::error::HandlerError;
use crate::queue::payload::{HttpPayload, ScriptPayload, SshPayload, ToolActionPayload};
use crate::queue::types::{Job, JobType};
use crate::worker::targets::{ExecutionTarget, TargetResolver};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Env var carrying the node input (JSON) into scripts
pub const INPUT_ENV_VAR: &str = "TASKLOOM_INPUT";

/// Longest response/stream excerpt quoted in an error message
const ERROR_EXCERPT: usize = 512;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError>;
}

/// Handlers keyed by job type
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP and local script handlers; SSH and tool actions need wiring by the caller
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(JobType::HttpRequest, Arc::new(HttpRequestHandler::new()));
        registry.register(JobType::Script, Arc::new(LocalScriptHandler));
        registry
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Job types this registry can serve
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let handler = self
            .get(job.job_type)
            .ok_or(HandlerError::NoHandler(job.job_type))?;
        handler.handle(job).await
    }
}

/// HTTP_REQUEST jobs
#[derive(Debug, Clone, Default)]
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl JobHandler for HttpRequestHandler {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: HttpPayload = serde_json::from_value(job.payload.clone())?;
        let http = payload.http;
        let method = reqwest::Method::from_bytes(http.method.to_uppercase().as_bytes())
            .map_err(|_| HandlerError::NodeExecution(format!("unsupported HTTP method {}", http.method)))?;

        tracing::debug!("🌍 HTTP Request: {} {} (job {})", method, http.url, job.id);

        let mut request = self.client.request(method.clone(), &http.url);
        for (key, value) in &http.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        // Explicit body wins; otherwise the node input is posted as JSON
        let body = http
            .body
            .or_else(|| (!payload.input.is_null()).then_some(payload.input));
        if let Some(body) = body {
            if matches!(method, reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH) {
                request = match body {
                    Value::String(text) => request.header("Content-Type", "text/plain").body(text),
                    other => request.json(&other),
                };
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| HandlerError::NodeExecution(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| HandlerError::NodeExecution(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(HandlerError::NodeExecution(format!(
                "{} {} returned {}: {}",
                method,
                http.url,
                status,
                excerpt(&text)
            )));
        }

        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        tracing::debug!("📡 {} {} -> {}", method, http.url, status);

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
        }))
    }
}

/// SCRIPT jobs, run by a local interpreter
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalScriptHandler;

#[async_trait]
impl JobHandler for LocalScriptHandler {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: ScriptPayload = serde_json::from_value(job.payload.clone())?;
        let interpreter = payload.script.script_type.interpreter();
        let flag = match interpreter {
            "node" => "-e",
            _ => "-c",
        };

        let mut command = tokio::process::Command::new(interpreter);
        command
            .arg(flag)
            .arg(&payload.script.content)
            .envs(&payload.environment)
            .env(INPUT_ENV_VAR, payload.input.to_string())
            .kill_on_drop(true);
        if let Some(dir) = &payload.script.working_directory {
            command.current_dir(dir);
        }

        tracing::debug!("📜 Running {} script for job {}", interpreter, job.id);

        let output = command
            .output()
            .await
            .map_err(|e| HandlerError::NodeExecution(format!("failed to start {}: {}", interpreter, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if !output.status.success() {
            return Err(HandlerError::NodeExecution(format!(
                "{} script exited with {}: {}",
                interpreter,
                exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                excerpt(stderr.trim())
            )));
        }

        Ok(json!({
            "exitCode": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

/// What a remote script run reported
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Transport for SSH jobs
///
/// `Err` means the target could not be reached or authenticated; a script
/// that ran and failed is an `Ok` with a non-zero exit code.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run(&self, target: &ExecutionTarget, payload: &SshPayload) -> anyhow::Result<RemoteOutput>;
}

/// SSH jobs
pub struct SshHandler {
    targets: Arc<TargetResolver>,
    runner: Arc<dyn RemoteRunner>,
}

impl SshHandler {
    pub fn new(targets: Arc<TargetResolver>, runner: Arc<dyn RemoteRunner>) -> Self {
        Self { targets, runner }
    }
}

#[async_trait]
impl JobHandler for SshHandler {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: SshPayload = serde_json::from_value(job.payload.clone())?;
        let server_id = payload.target.server_id.as_str();

        let target = self
            .targets
            .resolve(&job.user_id, server_id)
            .await
            .map_err(|e| HandlerError::NodeExecution(format!("cannot resolve target: {}", e)))?;

        tracing::debug!(
            "🔐 Running job {} on {}@{}:{}",
            job.id,
            target.username,
            target.host,
            target.port
        );

        let output = match self.runner.run(&target, &payload).await {
            Ok(output) => output,
            Err(e) => {
                self.targets.invalidate(&job.user_id, server_id);
                return Err(HandlerError::NodeExecution(format!(
                    "connection to {} failed: {}",
                    server_id, e
                )));
            }
        };

        if output.exit_code != 0 {
            return Err(HandlerError::NodeExecution(format!(
                "remote script on {} exited with {}: {}",
                server_id,
                output.exit_code,
                excerpt(output.stderr.trim())
            )));
        }

        Ok(json!({
            "serverId": server_id,
            "payloadRef": payload.payload_ref,
            "exitCode": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }
}

/// One application-provided tool (Slack, email, ...)
#[async_trait]
pub trait ToolAction: Send + Sync {
    async fn execute(&self, action: &str, parameters: &Value, input: &Value) -> Result<Value, HandlerError>;
}

/// TOOL_ACTION jobs, routed by `toolType`
#[derive(Default, Clone)]
pub struct ToolActionRouter {
    tools: HashMap<String, Arc<dyn ToolAction>>,
}

impl ToolActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool_type: impl Into<String>, tool: Arc<dyn ToolAction>) -> Self {
        self.tools.insert(tool_type.into(), tool);
        self
    }
}

#[async_trait]
impl JobHandler for ToolActionRouter {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: ToolActionPayload = serde_json::from_value(job.payload.clone())?;
        let spec = payload.tool_action;

        let tool = self.tools.get(&spec.tool_type).ok_or_else(|| {
            HandlerError::NodeExecution(format!("no tool registered for '{}'", spec.tool_type))
        })?;

        tracing::debug!("🧰 Tool action {}.{} for job {}", spec.tool_type, spec.action, job.id);
        tool.execute(&spec.action, &spec.parameters, &payload.input).await
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(ERROR_EXCERPT) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::{JobPriority, JobStatus};
    use chrono::Utc;

    fn job(job_type: JobType, payload: Value) -> Job {
        let now = Utc::now();
        Job {
            id: "job-1".to_string(),
            event_id: None,
            user_id: "user-1".to_string(),
            workflow_execution_id: None,
            node_id: None,
            job_type,
            status: JobStatus::Running,
            priority: JobPriority::Normal,
            payload,
            lease_owner: Some("w1".to_string()),
            lease_expires_at: None,
            attempts: 0,
            max_attempts: 3,
            timeout_secs: None,
            result: None,
            last_error: None,
            scheduled_for: now,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    struct Echo;

    #[async_trait]
    impl ToolAction for Echo {
        async fn execute(&self, action: &str, parameters: &Value, input: &Value) -> Result<Value, HandlerError> {
            Ok(json!({ "action": action, "parameters": parameters, "input": input }))
        }
    }

    #[tokio::test]
    async fn tool_actions_are_routed_by_tool_type() {
        let router = ToolActionRouter::new().with_tool("echo", Arc::new(Echo));
        let echo = job(
            JobType::ToolAction,
            json!({ "toolAction": { "toolType": "echo", "action": "say", "parameters": { "x": 1 } }, "input": { "y": 2 } }),
        );

        let out = router.handle(&echo).await.unwrap();
        assert_eq!(out["action"], "say");
        assert_eq!(out["parameters"]["x"], 1);
        assert_eq!(out["input"]["y"], 2);

        let unknown = job(
            JobType::ToolAction,
            json!({ "toolAction": { "toolType": "slack", "action": "send" } }),
        );
        assert!(matches!(router.handle(&unknown).await, Err(HandlerError::NodeExecution(_))));
    }

    #[tokio::test]
    async fn missing_handler_is_reported() {
        let registry = HandlerRegistry::new();
        let result = registry
            .handle(&job(JobType::Ssh, json!({})))
            .await;
        assert!(matches!(result, Err(HandlerError::NoHandler(JobType::Ssh))));
    }

    /// Refuses connections until `reachable` is set
    struct FakeRemote {
        reachable: std::sync::atomic::AtomicBool,
        seen_hosts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteRunner for FakeRemote {
        async fn run(&self, target: &ExecutionTarget, payload: &SshPayload) -> anyhow::Result<RemoteOutput> {
            self.seen_hosts.lock().unwrap().push(target.host.clone());
            if !self.reachable.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            Ok(RemoteOutput {
                exit_code: 0,
                stdout: payload.script.content.clone(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn ssh_connection_errors_drop_the_cached_target() {
        use crate::worker::targets::StaticTargetSource;
        use std::sync::atomic::Ordering;

        let target = ExecutionTarget {
            server_id: "srv-1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "deploy".to_string(),
            credential: "secret".to_string(),
        };
        let source = StaticTargetSource::new().with_target("user-1", target);
        let targets = Arc::new(TargetResolver::new(Arc::new(source), std::time::Duration::from_secs(300)));
        let remote = Arc::new(FakeRemote {
            reachable: std::sync::atomic::AtomicBool::new(false),
            seen_hosts: std::sync::Mutex::new(Vec::new()),
        });
        let handler = SshHandler::new(Arc::clone(&targets), remote.clone());
        let ssh = job(
            JobType::Ssh,
            json!({
                "target": { "serverId": "srv-1" },
                "script": { "type": "BASH", "content": "uptime" },
                "payloadRef": "payloads/ev/v1-abc"
            }),
        );

        let refused = handler.handle(&ssh).await;
        assert!(matches!(refused, Err(HandlerError::NodeExecution(msg)) if msg.contains("connection to srv-1 failed")));
        assert_eq!(targets.cached_len(), 0);

        remote.reachable.store(true, Ordering::SeqCst);
        let out = handler.handle(&ssh).await.unwrap();
        assert_eq!(out["serverId"], "srv-1");
        assert_eq!(out["payloadRef"], "payloads/ev/v1-abc");
        assert_eq!(out["stdout"], "uptime");
        assert_eq!(targets.cached_len(), 1);
        assert_eq!(*remote.seen_hosts.lock().unwrap(), vec!["10.0.0.5", "10.0.0.5"]);

        let unknown = job(
            JobType::Ssh,
            json!({ "target": { "serverId": "srv-9" }, "script": { "type": "BASH", "content": "true" } }),
        );
        assert!(matches!(handler.handle(&unknown).await, Err(HandlerError::NodeExecution(_))));
    }

    #[test]
    fn excerpts_are_bounded() {
        let long = "x".repeat(ERROR_EXCERPT + 10);
        assert_eq!(excerpt(&long).len(), ERROR_EXCERPT);
        assert_eq!(excerpt("short"), "short");
    }
}
