#![allow(dead_code)]

use gemma_bridge::{LoadConfig, ModelMeta, Quantization, Runtime, RuntimeFault, RuntimeLoader, TokenId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

pub const MAGIC: &[u8] = b"TEST";

/// Counts upward: after a prompt it emits "w1 ", "w2 ", ... and ends with
/// end-of-sequence after `length` words. Token 0 is end-of-sequence.
pub struct CountingRuntime {
    meta: ModelMeta,
    length: u32,
    produced: u32,
    faulty: bool,
    gate: Option<Receiver<()>>,
    forward_calls: Arc<AtomicUsize>,
}

impl Runtime for CountingRuntime {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn encode(&self, text: &str) -> Result<Vec<TokenId>, RuntimeFault> {
        Ok(text.split_whitespace().map(|w| w.len() as TokenId).collect())
    }

    fn forward(&mut self, _tokens: &[TokenId], position: usize) -> Result<Vec<f32>, RuntimeFault> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            // A closed gate lets every later step through.
            let _ = gate.recv();
        }
        if self.faulty {
            return Err(RuntimeFault::fatal("device lost"));
        }
        if position == 0 {
            self.produced = 0;
        }
        self.produced += 1;
        let next = if self.produced > self.length { 0 } else { self.produced as usize };
        let mut logits = vec![0.0; self.meta.vocab_size];
        logits[next] = 20.0;
        Ok(logits)
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, RuntimeFault> {
        Ok(format!("w{} ", token).into_bytes())
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == 0
    }
}

pub struct CountingLoader {
    pub length: u32,
    pub forward_calls: Arc<AtomicUsize>,
    faulty_loads: AtomicUsize,
    gate: Mutex<Option<Receiver<()>>>,
}

impl CountingLoader {
    pub fn new(length: u32) -> Self {
        Self {
            length,
            forward_calls: Arc::new(AtomicUsize::new(0)),
            faulty_loads: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    /// The next `loads` runtimes fail with an unrecoverable fault on their
    /// first decode step.
    pub fn faulty(self, loads: usize) -> Self {
        self.faulty_loads.store(loads, Ordering::SeqCst);
        self
    }

    /// The next runtime waits for a message on the returned sender before
    /// each decode step.
    pub fn gated(self) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        *self.gate.lock() = Some(rx);
        (self, tx)
    }
}

impl RuntimeLoader for CountingLoader {
    fn name(&self) -> &str {
        "counting"
    }

    fn probe(&self, header: &[u8]) -> bool {
        header.starts_with(MAGIC)
    }

    fn load(&self, _path: &Path, config: &LoadConfig) -> gemma_bridge::Result<Box<dyn Runtime>> {
        let meta = ModelMeta {
            architecture: "counting".to_string(),
            context_length: config.context_length,
            vocab_size: self.length as usize + 1,
            quantization: Quantization::None,
        };
        let faulty = self
            .faulty_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(CountingRuntime {
            meta,
            length: self.length,
            produced: 0,
            faulty,
            gate: self.gate.lock().take(),
            forward_calls: Arc::clone(&self.forward_calls),
        }))
    }
}

/// A fresh models directory holding a `model.bin` the counting loader accepts.
pub fn models_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gemma-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("model.bin"), [MAGIC, b"\0\0\0\0weights"].concat()).unwrap();
    dir
}
