use serde::{Deserialize, Serialize};

use crate::core::HandleId;
use crate::error::{CoreError, Result};

pub type RequestId = u64;

pub const DEFAULT_MAX_TOKENS: usize = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_K: usize = 40;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const MAX_TEMPERATURE: f32 = 2.0;
pub const MAX_STOP_SEQUENCES: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    #[serde(alias = "stopSequences")]
    pub stop: Vec<String>,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            stop: Vec::new(),
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn stop(mut self, seq: impl Into<String>) -> Self {
        self.stop.push(seq.into());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(CoreError::validation("maxTokens must be positive"));
        }
        if !self.temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(CoreError::validation(format!(
                "temperature must be within [0, {}]",
                MAX_TEMPERATURE
            )));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(CoreError::validation("topP must be within (0, 1]"));
        }
        if self.stop.len() > MAX_STOP_SEQUENCES {
            return Err(CoreError::validation(format!(
                "at most {} stop sequences are allowed",
                MAX_STOP_SEQUENCES
            )));
        }
        if self.stop.iter().any(|s| s.is_empty()) {
            return Err(CoreError::validation("stop sequences must not be empty"));
        }
        Ok(())
    }
}

/// A prompt bound for one model handle. Immutable once admitted.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub handle: HandleId,
    pub prompt: String,
    pub params: GenerationParams,
}

impl InferenceRequest {
    pub fn new(handle: HandleId, prompt: impl Into<String>) -> Self {
        Self {
            handle,
            prompt: prompt.into(),
            params: GenerationParams::default(),
        }
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::validation("prompt must not be empty"));
        }
        self.params.validate()
    }
}
