pub mod manager;

pub use manager::{HandleInfo, ModelLease, ModelManager, SharedRuntime};

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

pub type HandleId = u64;

pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;
pub const MAX_THREADS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    None,
    Int8,
    Int4,
}

impl Quantization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::None => "none",
            Quantization::Int8 => "int8",
            Quantization::Int4 => "int4",
        }
    }

    /// Approximate storage cost of one weight, used for memory estimates.
    pub fn bytes_per_weight(&self) -> f32 {
        match self {
            Quantization::None => 2.0,
            Quantization::Int8 => 1.0,
            Quantization::Int4 => 0.5,
        }
    }
}

/// Options recognised when loading a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadConfig {
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default)]
    pub quantization: Option<Quantization>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_context_length() -> usize {
    DEFAULT_CONTEXT_LENGTH
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_THREADS)
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            context_length: default_context_length(),
            thread_count: default_thread_count(),
            quantization: None,
            seed: None,
        }
    }
}

impl LoadConfig {
    pub fn context_length(mut self, len: usize) -> Self {
        self.context_length = len;
        self
    }

    pub fn thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    pub fn quantization(mut self, q: Quantization) -> Self {
        self.quantization = Some(q);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_length == 0 {
            return Err(CoreError::validation("contextLength must be positive"));
        }
        if self.thread_count == 0 || self.thread_count > MAX_THREADS {
            return Err(CoreError::validation(format!(
                "threadCount must be between 1 and {}",
                MAX_THREADS
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a model handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Error,
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Unloading => "unloading",
            ModelState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a runtime reports about the weights it loaded.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub architecture: String,
    pub context_length: usize,
    pub vocab_size: usize,
    pub quantization: Quantization,
}

impl Default for ModelMeta {
    fn default() -> Self {
        Self {
            architecture: "gemma3".to_string(),
            context_length: DEFAULT_CONTEXT_LENGTH,
            vocab_size: 0,
            quantization: Quantization::None,
        }
    }
}
