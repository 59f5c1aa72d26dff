//! Environment-driven configuration.
//!
//! Every knob has a default suitable for local development; deployments
//! override through environment variables (loaded via `dotenvy` in `main`).

use std::time::Duration;

use secrecy::SecretString;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Top-level configuration for the service.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub worker: WorkerConfig,
    pub session: SessionConfig,
    pub jobs: JobsConfig,
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            llm: LlmConfig::from_env(),
            worker: WorkerConfig::from_env(),
            session: SessionConfig::from_env(),
            jobs: JobsConfig::from_env(),
        }
    }
}

/// HTTP intake and WebSocket delivery surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("SHERPA_HOST", "127.0.0.1".to_string()),
            port: env_or("SHERPA_PORT", 8420),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8420,
        }
    }
}

/// Model provider access.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL for the chat-completions provider.
    pub base_url: String,
    /// API key; absent means only scripted providers are available.
    pub api_key: Option<SecretString>,
    /// Hard deadline for a single generation.
    pub deadline: Duration,
}

impl LlmConfig {
    fn from_env() -> Self {
        Self {
            base_url: env_or("SHERPA_LLM_BASE_URL", "https://api.openai.com".to_string()),
            api_key: std::env::var("SHERPA_LLM_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            deadline: Duration::from_secs(env_or("SHERPA_LLM_DEADLINE_SECS", 300)),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            deadline: Duration::from_secs(300),
        }
    }
}

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum envelopes processed concurrently.
    pub concurrency: usize,
}

impl WorkerConfig {
    fn from_env() -> Self {
        Self {
            concurrency: env_or("SHERPA_WORKER_CONCURRENCY", 8),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

/// Session state machine tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity window after which an active session pauses.
    pub idle_ttl: Duration,
}

impl SessionConfig {
    fn from_env() -> Self {
        Self {
            idle_ttl: Duration::from_secs(env_or("SHERPA_SESSION_IDLE_SECS", 30 * 60)),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Job registry tuning.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Record lifetime from creation.
    pub ttl: Duration,
    /// How often the reaper sweeps expired records.
    pub reap_interval: Duration,
    /// Age past which a stuck `processing` job is failed by the watchdog.
    pub stuck_after: Duration,
}

impl JobsConfig {
    fn from_env() -> Self {
        Self {
            ttl: Duration::from_secs(env_or("SHERPA_JOB_TTL_SECS", 24 * 60 * 60)),
            reap_interval: Duration::from_secs(env_or("SHERPA_JOB_REAP_SECS", 60)),
            stuck_after: Duration::from_secs(env_or("SHERPA_JOB_STUCK_SECS", 10 * 60)),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            reap_interval: Duration::from_secs(60),
            stuck_after: Duration::from_secs(10 * 60),
        }
    }
}
