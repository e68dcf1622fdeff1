use super::{Runtime, RuntimeFault, RuntimeLoader, TokenId};
use crate::core::model::{LoadConfig, ModelMeta, Quantization};
use crate::core::tokenizer::{Tokenizer, TokenizerKind, Vocabulary};
use crate::error::{CoreError, Result};
use candle_core::quantized::gguf_file::{Content, Value};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::{quantized_gemma3, quantized_llama};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const GGUF_MAGIC: &[u8] = b"GGUF";

enum Weights {
    Llama(quantized_llama::ModelWeights),
    Gemma3(quantized_gemma3::ModelWeights),
}

impl Weights {
    fn forward(&mut self, input: &Tensor, position: usize) -> candle_core::Result<Tensor> {
        match self {
            Weights::Llama(m) => m.forward(input, position),
            Weights::Gemma3(m) => m.forward(input, position),
        }
    }
}

/// Quantized GGUF models executed with candle on CPU (or CUDA when built with
/// the `cuda` feature and a device is present).
pub struct GgufRuntime {
    meta: ModelMeta,
    weights: Weights,
    tokenizer: Tokenizer,
    device: Device,
    pool: rayon::ThreadPool,
}

impl Runtime for GgufRuntime {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn encode(&self, text: &str) -> std::result::Result<Vec<TokenId>, RuntimeFault> {
        Ok(self.tokenizer.encode(text))
    }

    fn forward(&mut self, tokens: &[TokenId], position: usize) -> std::result::Result<Vec<f32>, RuntimeFault> {
        let device = &self.device;
        let weights = &mut self.weights;
        self.pool
            .install(|| -> candle_core::Result<Vec<f32>> {
                let input = Tensor::new(tokens, device)?.unsqueeze(0)?;
                let logits = weights.forward(&input, position)?;
                logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()
            })
            .map_err(classify_fault)
    }

    fn token_bytes(&self, token: TokenId) -> std::result::Result<Vec<u8>, RuntimeFault> {
        Ok(self.tokenizer.token_bytes(token))
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.tokenizer.is_end_of_sequence(token)
    }
}

fn classify_fault(err: candle_core::Error) -> RuntimeFault {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("out of memory") || lower.contains("cuda") || lower.contains("driver") {
        RuntimeFault::fatal(message)
    } else {
        RuntimeFault::recoverable(message)
    }
}

pub struct GgufLoader;

impl GgufLoader {
    pub fn new() -> Self {
        Self
    }

    fn read_content(path: &Path) -> Result<Content> {
        let file = File::open(path).map_err(|e| CoreError::model_load(path, e))?;
        let mut reader = BufReader::new(file);
        Content::read(&mut reader).map_err(|e| CoreError::model_load(path, format!("corrupt GGUF file: {}", e)))
    }
}

impl Default for GgufLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeLoader for GgufLoader {
    fn name(&self) -> &str {
        "gguf"
    }

    fn probe(&self, header: &[u8]) -> bool {
        header.starts_with(GGUF_MAGIC)
    }

    fn estimate_memory(&self, path: &Path, config: &LoadConfig) -> Result<u64> {
        let file_size = std::fs::metadata(path).map_err(|e| CoreError::model_load(path, e))?.len();
        let content = Self::read_content(path)?;
        let arch = architecture(&content);
        let get = |key: &str| metadata_u64(&content, &format!("{}.{}", arch, key));

        let layers = get("block_count").unwrap_or(0);
        let embedding = get("embedding_length").unwrap_or(0);
        let heads = get("attention.head_count").unwrap_or(1).max(1);
        let kv_heads = get("attention.head_count_kv").unwrap_or(heads);
        // f32 keys and values for every layer over the whole context window.
        let kv_cache = 2 * 4 * layers * config.context_length as u64 * (embedding * kv_heads / heads);

        Ok(file_size + kv_cache)
    }

    fn load(&self, path: &Path, config: &LoadConfig) -> Result<Box<dyn Runtime>> {
        let content = Self::read_content(path)?;
        let arch = architecture(&content);

        let quantization = file_quantization(&content);
        if let Some(expected) = config.quantization {
            if expected != quantization {
                return Err(CoreError::model_load(
                    path,
                    format!("expected {} weights, file holds {}", expected.as_str(), quantization.as_str()),
                ));
            }
        }

        let trained_ctx = metadata_u64(&content, &format!("{}.context_length", arch)).unwrap_or(0) as usize;
        if trained_ctx > 0 && config.context_length > trained_ctx {
            return Err(CoreError::validation(format!(
                "contextLength {} exceeds the model's trained context of {}",
                config.context_length, trained_ctx
            )));
        }

        let tokenizer = build_tokenizer(&content).ok_or_else(|| CoreError::model_load(path, "missing tokenizer vocabulary"))?;

        let device = select_device();
        let mut file = File::open(path).map_err(|e| CoreError::model_load(path, e))?;
        let weights = match arch.as_str() {
            "llama" => quantized_llama::ModelWeights::from_gguf(content, &mut file, &device).map(Weights::Llama),
            "gemma3" => quantized_gemma3::ModelWeights::from_gguf(content, &mut file, &device).map(Weights::Gemma3),
            other => {
                return Err(CoreError::model_load(path, format!("unsupported architecture: {}", other)));
            }
        }
        .map_err(|e| load_failure(path, e))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.thread_count)
            .thread_name(|i| format!("gemma-decode-{}", i))
            .build()
            .map_err(|e| CoreError::ResourceExhausted(e.to_string()))?;

        tracing::info!(
            "Loaded {} model ({}, {} tokens vocab) on {:?}",
            arch,
            quantization.as_str(),
            tokenizer.vocab_size(),
            device
        );

        Ok(Box::new(GgufRuntime {
            meta: ModelMeta {
                architecture: arch,
                context_length: config.context_length,
                vocab_size: tokenizer.vocab_size(),
                quantization,
            },
            weights,
            tokenizer,
            device,
            pool,
        }))
    }
}

fn select_device() -> Device {
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    Device::Cpu
}

fn load_failure(path: &Path, err: candle_core::Error) -> CoreError {
    let message = err.to_string();
    if message.to_lowercase().contains("alloc") || message.to_lowercase().contains("out of memory") {
        CoreError::ResourceExhausted(message)
    } else {
        CoreError::model_load(path, message)
    }
}

fn architecture(content: &Content) -> String {
    content
        .metadata
        .get("general.architecture")
        .and_then(|v| v.to_string().ok())
        .cloned()
        .unwrap_or_else(|| "llama".to_string())
}

fn metadata_u64(content: &Content, key: &str) -> Option<u64> {
    match content.metadata.get(key)? {
        Value::U8(v) => Some(*v as u64),
        Value::U16(v) => Some(*v as u64),
        Value::U32(v) => Some(*v as u64),
        Value::U64(v) => Some(*v),
        Value::I32(v) if *v >= 0 => Some(*v as u64),
        Value::I64(v) if *v >= 0 => Some(*v as u64),
        _ => None,
    }
}

/// GGUF `general.file_type` codes grouped by weight width.
fn file_quantization(content: &Content) -> Quantization {
    match metadata_u64(content, "general.file_type") {
        Some(7) | Some(15) => Quantization::Int8,
        Some(2) | Some(3) | Some(12) | Some(13) | Some(14) => Quantization::Int4,
        _ => Quantization::None,
    }
}

fn build_tokenizer(content: &Content) -> Option<Tokenizer> {
    let tokens: Vec<String> = content
        .metadata
        .get("tokenizer.ggml.tokens")?
        .to_vec()
        .ok()?
        .iter()
        .filter_map(|v| v.to_string().ok().cloned())
        .collect();
    if tokens.is_empty() {
        return None;
    }

    let kind = content
        .metadata
        .get("tokenizer.ggml.model")
        .and_then(|v| v.to_string().ok())
        .map(|s| TokenizerKind::from_model_name(s))
        .unwrap_or(TokenizerKind::SentencePiece);

    let mut vocab = Vocabulary::new(tokens);
    vocab.bos_token = metadata_u64(content, "tokenizer.ggml.bos_token_id").map(|id| id as TokenId);
    vocab.add_bos = match content.metadata.get("tokenizer.ggml.add_bos_token") {
        Some(Value::Bool(b)) => *b,
        _ => vocab.bos_token.is_some(),
    };
    if let Some(eos) = metadata_u64(content, "tokenizer.ggml.eos_token_id") {
        vocab.eos_tokens.push(eos as TokenId);
    }
    // Instruction-tuned Gemma ends turns with <end_of_turn> rather than <eos>.
    for marker in ["<end_of_turn>", "<|eot_id|>"] {
        if let Some(pos) = vocab.tokens.iter().position(|t| t == marker) {
            vocab.eos_tokens.push(pos as TokenId);
        }
    }

    Some(Tokenizer::new(kind, vocab))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_checks_magic() {
        let loader = GgufLoader::new();
        assert!(loader.probe(b"GGUF\x03\x00\x00\x00"));
        assert!(!loader.probe(b"GGU"));
        assert!(!loader.probe(b"PK\x03\x04"));
    }

    #[test]
    fn test_truncated_file_is_model_load_error() {
        let dir = std::env::temp_dir().join(format!("gguf-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.gguf");
        std::fs::write(&path, b"GGUF\x03\x00").unwrap();

        let err = GgufLoader::new().load(&path, &LoadConfig::default()).err().unwrap();
        assert_eq!(err.code(), "MODEL_LOAD_ERROR");
        std::fs::remove_dir_all(dir).ok();
    }
}
