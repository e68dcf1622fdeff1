use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::app::{DispatcherConfig, OverloadPolicy};

const DEFAULT_MODELS_DIR: &str = "~/.gemma/models";

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub models_dir: PathBuf,
    pub max_sessions: usize,
    pub overload: OverloadPolicy,
    pub queue_timeout: Duration,
    pub max_queued: usize,
    /// Memory budget for loaded models, in bytes.
    pub memory_budget: Option<u64>,
    pub debug: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DispatcherConfig::default();
        let parse = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            models_dir: expand_home(&var("GEMMA_MODELS").unwrap_or_else(|| DEFAULT_MODELS_DIR.to_string())),
            max_sessions: parse("GEMMA_MAX_SESSIONS")
                .map(|n| (n as usize).max(1))
                .unwrap_or(defaults.max_sessions),
            overload: var("GEMMA_OVERLOAD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.policy),
            queue_timeout: parse("GEMMA_QUEUE_TIMEOUT")
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_timeout),
            max_queued: parse("GEMMA_MAX_QUEUE").map(|n| n as usize).unwrap_or(defaults.max_queued),
            // MiB; a value that overflows bytes is ignored.
            memory_budget: parse("GEMMA_MEMORY_BUDGET").and_then(|mib| mib.checked_mul(1024 * 1024)),
            debug: var("GEMMA_DEBUG")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .max_sessions(self.max_sessions)
            .policy(self.overload)
            .queue_timeout(self.queue_timeout)
            .max_queued(self.max_queued)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
