/// Configuration management for taskloom
///
/// Every value comes from a `TASKLOOM_*` environment variable with a default,
/// so the same binary runs as API server, worker or both in containers.

use crate::queue::{QueueSettings, RetryPolicy};
use crate::runtime::ExecutorSettings;
use crate::worker::OrchestratorSettings;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub executor: ExecutorConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL shared by every process of one deployment
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub lease_secs: u64,
    /// How often expired leases are swept
    pub reap_interval_secs: u64,
    pub default_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub default_timeout_secs: u64,
}

/// Which loops this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// API, executor and scheduler
    Server,
    /// Orchestrator only
    Worker,
    All,
}

impl Role {
    pub fn runs_server(&self) -> bool {
        matches!(self, Role::Server | Role::All)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "worker" => Ok(Role::Worker),
            "all" => Ok(Role::All),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub role: Role,
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_concurrent: usize,
    /// Defaults to a third of the lease
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Executions are pinned to this id and resumed by it after a restart
    pub instance_id: String,
    pub completion_poll_ms: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(default)
}

/// `<prefix>-<hostname>`, the same on every restart of this host
///
/// Leases and executions are recovered by id after a crash, so the default
/// must not change between runs. Deployments running several workers or
/// executors on one host set `TASKLOOM_WORKER_ID` / `TASKLOOM_EXECUTOR_ID`.
pub fn stable_instance_id(prefix: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string());
    format!("{prefix}-{host}")
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let lease_secs = env_or("TASKLOOM_LEASE_SECS", 30u64);

        Self {
            server: ServerConfig {
                host: env_string("TASKLOOM_HOST", || "0.0.0.0".to_string()),
                port: env_or("TASKLOOM_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_string("TASKLOOM_DATABASE_URL", || "sqlite://data/taskloom.db".to_string()),
            },
            queue: QueueConfig {
                lease_secs,
                reap_interval_secs: env_or("TASKLOOM_REAP_INTERVAL_SECS", 15),
                default_max_attempts: env_or("TASKLOOM_MAX_ATTEMPTS", 3),
                retry_initial_delay_ms: env_or("TASKLOOM_RETRY_INITIAL_MS", 1_000),
                retry_multiplier: env_or("TASKLOOM_RETRY_MULTIPLIER", 2.0),
                retry_max_delay_ms: env_or("TASKLOOM_RETRY_MAX_MS", 30_000),
                default_timeout_secs: env_or("TASKLOOM_JOB_TIMEOUT_SECS", 3_600),
            },
            worker: WorkerConfig {
                role: env_or("TASKLOOM_ROLE", Role::All),
                worker_id: env_string("TASKLOOM_WORKER_ID", || stable_instance_id("orchestrator")),
                poll_interval_ms: env_or("TASKLOOM_POLL_MS", 1_000),
                batch_size: env_or("TASKLOOM_BATCH_SIZE", 10),
                max_concurrent: env_or("TASKLOOM_MAX_CONCURRENT", 5),
                heartbeat_interval_ms: env_or("TASKLOOM_HEARTBEAT_MS", lease_secs * 1_000 / 3),
            },
            executor: ExecutorConfig {
                instance_id: env_string("TASKLOOM_EXECUTOR_ID", || stable_instance_id("executor")),
                completion_poll_ms: env_or("TASKLOOM_COMPLETION_POLL_MS", 500),
            },
        }
    }
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            lease_duration: Duration::from_secs(self.lease_secs),
            default_max_attempts: self.default_max_attempts,
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                multiplier: self.retry_multiplier,
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl WorkerConfig {
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            worker_id: self.worker_id.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            batch_size: self.batch_size,
            max_concurrent: self.max_concurrent,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(100)),
        }
    }
}

impl ExecutorConfig {
    pub fn settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            instance_id: self.instance_id.clone(),
            completion_poll_interval: Duration::from_millis(self.completion_poll_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Worker".parse::<Role>(), Ok(Role::Worker));
        assert!("all".parse::<Role>().map(|r| r.runs_server() && r.runs_worker()).unwrap());
        assert!("scheduler".parse::<Role>().is_err());
    }

    #[test]
    fn queue_settings_follow_config() {
        let config = QueueConfig {
            lease_secs: 12,
            reap_interval_secs: 0,
            default_max_attempts: 4,
            retry_initial_delay_ms: 250,
            retry_multiplier: 3.0,
            retry_max_delay_ms: 5_000,
            default_timeout_secs: 60,
        };

        let settings = config.settings();
        assert_eq!(settings.lease_duration, Duration::from_secs(12));
        assert_eq!(settings.retry.delay_for(2), Duration::from_millis(750));
        assert_eq!(config.reap_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let worker = WorkerConfig {
            role: Role::Worker,
            worker_id: "w".to_string(),
            poll_interval_ms: 0,
            batch_size: 1,
            max_concurrent: 1,
            heartbeat_interval_ms: 0,
        };
        let settings = worker.settings();
        assert!(settings.poll_interval > Duration::ZERO);
        assert!(settings.heartbeat_interval > Duration::ZERO);

        let executor = ExecutorConfig {
            instance_id: "e".to_string(),
            completion_poll_ms: 0,
        };
        assert!(executor.settings().completion_poll_interval > Duration::ZERO);
    }

    #[test]
    fn default_ids_survive_a_restart() {
        // Two processes on the same host must agree on the id
        assert_eq!(stable_instance_id("executor"), stable_instance_id("executor"));
        assert!(stable_instance_id("orchestrator").starts_with("orchestrator-"));
        assert_eq!(Config::default().executor.instance_id, Config::default().executor.instance_id);
        assert_eq!(Config::default().worker.worker_id, Config::default().worker.worker_id);
    }
}
