use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub default_memory_mb: u64,
    pub max_memory_mb: u64,
    pub max_concurrent: usize,
    pub sandbox_image: String,
    pub sandbox_pull: bool,
    pub sandbox_cpu_limit: f64,
    pub sandbox_pids_limit: i64,
    pub sandbox_network: bool,
    pub cancel_poll_ms: u64,
    pub stream_poll_ms: u64,
    pub result_ttl_secs: u64,
    pub physics_gpu_enabled: bool,
    pub physics_cpu_enabled: bool,
    pub physics_gpu_devices: Vec<PathBuf>,
    pub port: u16,
    pub worker_health_port: u16,
    pub worker_idle_poll_ms: u64,
    pub worker_recover_on_boot: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparseable keys fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str, default| parse_or(&lookup, key, default);

        Self {
            redis_url: lookup("REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379".to_string()),
            default_timeout_ms: parsed("DEFAULT_TIMEOUT_MS", 30_000),
            max_timeout_ms: parsed("MAX_TIMEOUT_MS", 300_000),
            default_memory_mb: parsed("DEFAULT_MEMORY_MB", 512),
            max_memory_mb: parsed("MAX_MEMORY_MB", 4096),
            max_concurrent: parse_or(&lookup, "MAX_CONCURRENT", 4usize).max(1),
            sandbox_image: lookup("SANDBOX_IMAGE")
                .unwrap_or_else(|| "notebox-sandbox:latest".to_string()),
            sandbox_pull: parse_flag(&lookup, "SANDBOX_PULL", false),
            sandbox_cpu_limit: parse_or(&lookup, "SANDBOX_CPU_LIMIT", 1.0f64),
            sandbox_pids_limit: parse_or(&lookup, "SANDBOX_PIDS_LIMIT", 256i64),
            sandbox_network: parse_flag(&lookup, "SANDBOX_NETWORK", false),
            cancel_poll_ms: parsed("CANCEL_POLL_MS", 250),
            stream_poll_ms: parsed("STREAM_POLL_MS", 200),
            result_ttl_secs: parsed("RESULT_TTL_SECS", 86_400),
            physics_gpu_enabled: parse_flag(&lookup, "PHYSICS_GPU_ENABLED", false),
            physics_cpu_enabled: parse_flag(&lookup, "PHYSICS_CPU_ENABLED", true),
            physics_gpu_devices: lookup("PHYSICS_GPU_DEVICES")
                .unwrap_or_else(|| "/dev/nvidia0,/dev/dri/renderD128".to_string())
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            port: parse_or(&lookup, "PORT", 3000u16),
            worker_health_port: parse_or(&lookup, "WORKER_HEALTH_PORT", 3001u16),
            worker_idle_poll_ms: parsed("WORKER_IDLE_POLL_MS", 500),
            worker_recover_on_boot: parse_flag(&lookup, "WORKER_RECOVER_ON_BOOT", true),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }

    pub fn worker_idle_poll(&self) -> Duration {
        Duration::from_millis(self.worker_idle_poll_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
