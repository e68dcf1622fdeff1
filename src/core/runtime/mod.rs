pub mod gguf;

pub use gguf::GgufLoader;

use crate::core::model::{LoadConfig, ModelMeta};
use crate::error::Result;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

pub type TokenId = u32;

/// A fault raised by a single decode step.
///
/// Recoverable faults end the affected request only; unrecoverable ones also
/// poison the model handle until it is reloaded.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeFault {
    pub message: String,
    pub recoverable: bool,
}

impl RuntimeFault {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self { message: message.into(), recoverable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), recoverable: false }
    }
}

/// One loaded model instance: weights, tokenizer and execution context.
///
/// The context is stateful (KV cache), so a runtime serves one generation at
/// a time. Positions passed to `forward` restart at zero for every prompt.
pub trait Runtime: Send {
    fn meta(&self) -> &ModelMeta;

    fn encode(&self, text: &str) -> std::result::Result<Vec<TokenId>, RuntimeFault>;

    /// Runs the model over `tokens` starting at `position` and returns the
    /// logits for the last token.
    fn forward(&mut self, tokens: &[TokenId], position: usize) -> std::result::Result<Vec<f32>, RuntimeFault>;

    /// Raw bytes of one token. Byte-fallback tokens may carry partial UTF-8.
    fn token_bytes(&self, token: TokenId) -> std::result::Result<Vec<u8>, RuntimeFault>;

    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Drops per-generation state so the next prompt starts clean.
    fn reset(&mut self) {}
}

/// Builds runtimes for one on-disk model format.
pub trait RuntimeLoader: Send + Sync {
    fn name(&self) -> &str;

    /// Inspects the first bytes of a model file.
    fn probe(&self, header: &[u8]) -> bool;

    /// Bytes the loaded model is expected to occupy with `config`.
    fn estimate_memory(&self, path: &Path, config: &LoadConfig) -> Result<u64> {
        let _ = config;
        Ok(std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<Box<dyn Runtime>>;
}

/// Ordered set of loaders; the first whose probe accepts a file wins.
pub struct LoaderRegistry {
    loaders: RwLock<Vec<Arc<dyn RuntimeLoader>>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self { loaders: RwLock::new(Vec::new()) }
    }

    /// Registry with the built-in GGUF loader.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(GgufLoader::new());
        registry
    }

    pub fn register<L: RuntimeLoader + 'static>(&self, loader: L) {
        let mut loaders = self.loaders.write();
        loaders.retain(|l| l.name() != loader.name());
        loaders.push(Arc::new(loader));
    }

    pub fn find(&self, header: &[u8]) -> Option<Arc<dyn RuntimeLoader>> {
        self.loaders.read().iter().find(|l| l.probe(header)).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.loaders.read().iter().map(|l| l.name().to_string()).collect()
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    #[test]
    fn test_registry_picks_loader_by_header() {
        let registry = LoaderRegistry::with_defaults();
        registry.register(ScriptedLoader::new(&["a"]));

        assert_eq!(registry.find(b"FAKE\0\0\0\0").map(|l| l.name().to_string()), Some("scripted".into()));
        assert_eq!(registry.find(b"GGUF\x03\0\0\0").map(|l| l.name().to_string()), Some("gguf".into()));
        assert!(registry.find(b"\x7fELF").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = LoaderRegistry::new();
        registry.register(ScriptedLoader::new(&["a"]));
        registry.register(ScriptedLoader::new(&["b"]));
        assert_eq!(registry.names(), vec!["scripted".to_string()]);
    }
}
