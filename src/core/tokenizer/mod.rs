use crate::core::runtime::TokenId;
use std::collections::HashMap;

const SPACE_MARKER: char = '▁';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    /// SentencePiece vocabularies (`tokenizer.ggml.model = "llama"`), used by Gemma.
    SentencePiece,
    /// GPT-2 style byte-level vocabularies (`tokenizer.ggml.model = "gpt2"`).
    ByteLevel,
}

impl TokenizerKind {
    pub fn from_model_name(name: &str) -> Self {
        match name {
            "gpt2" => TokenizerKind::ByteLevel,
            _ => TokenizerKind::SentencePiece,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    pub bos_token: Option<TokenId>,
    pub eos_tokens: Vec<TokenId>,
    pub add_bos: bool,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            bos_token: None,
            eos_tokens: Vec::new(),
            add_bos: false,
        }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }
}

/// Greedy longest-match tokenizer over a GGUF vocabulary.
///
/// Unknown characters fall back to `<0xNN>` byte tokens when the vocabulary
/// has them and are skipped otherwise.
pub struct Tokenizer {
    kind: TokenizerKind,
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    max_token_chars: usize,
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
}

impl Tokenizer {
    pub fn new(kind: TokenizerKind, vocab: Vocabulary) -> Self {
        let mut encoder = HashMap::with_capacity(vocab.size());
        let mut max_token_chars = 1;
        for (i, token) in vocab.tokens.iter().enumerate() {
            encoder.entry(token.clone()).or_insert(i as TokenId);
            max_token_chars = max_token_chars.max(token.chars().count());
        }

        let byte_encoder = build_byte_encoder();
        let byte_decoder = byte_encoder.iter().map(|(&b, &c)| (c, b)).collect();

        Self {
            kind,
            vocab,
            encoder,
            max_token_chars,
            byte_encoder,
            byte_decoder,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.size()
    }

    pub fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.vocab.eos_tokens.contains(&token)
    }

    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        if self.vocab.add_bos {
            if let Some(bos) = self.vocab.bos_token {
                tokens.push(bos);
            }
        }

        let normalized: String = match self.kind {
            TokenizerKind::SentencePiece => text.replace(' ', &SPACE_MARKER.to_string()),
            TokenizerKind::ByteLevel => text.bytes().map(|b| self.byte_encoder[&b]).collect(),
        };
        let chars: Vec<char> = normalized.chars().collect();

        let mut i = 0;
        while i < chars.len() {
            let longest = self.max_token_chars.min(chars.len() - i);
            let matched = (1..=longest).rev().find_map(|len| {
                let piece: String = chars[i..i + len].iter().collect();
                self.encoder.get(&piece).map(|&id| (id, len))
            });

            match matched {
                Some((id, len)) => {
                    tokens.push(id);
                    i += len;
                }
                None => {
                    let mut buf = [0u8; 4];
                    for b in chars[i].encode_utf8(&mut buf).bytes() {
                        if let Some(&id) = self.encoder.get(&format!("<0x{:02X}>", b)) {
                            tokens.push(id);
                        }
                    }
                    i += 1;
                }
            }
        }

        tokens
    }

    /// Bytes of a single token; callers reassemble UTF-8 across tokens.
    pub fn token_bytes(&self, token: TokenId) -> Vec<u8> {
        let Some(piece) = self.vocab.tokens.get(token as usize) else {
            return Vec::new();
        };
        if Some(token) == self.vocab.bos_token || self.is_end_of_sequence(token) {
            return Vec::new();
        }

        match self.kind {
            TokenizerKind::SentencePiece => {
                if let Some(byte) = parse_byte_token(piece) {
                    return vec![byte];
                }
                piece.replace(SPACE_MARKER, " ").into_bytes()
            }
            TokenizerKind::ByteLevel => piece
                .chars()
                .map(|c| self.byte_decoder.get(&c).copied())
                .collect::<Option<Vec<u8>>>()
                .unwrap_or_else(|| piece.as_bytes().to_vec()),
        }
    }

    pub fn decode(&self, tokens: &[TokenId]) -> String {
        let bytes: Vec<u8> = tokens.iter().flat_map(|&t| self.token_bytes(t)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn parse_byte_token(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

fn build_byte_encoder() -> HashMap<u8, char> {
    let mut mapping = HashMap::new();
    let printable = (b'!'..=b'~').chain(0xA1..=0xAC).chain(0xAE..=0xFF);
    for b in printable {
        mapping.insert(b, b as char);
    }

    let mut offset: u32 = 256;
    for b in 0..=255u8 {
        if let std::collections::hash_map::Entry::Vacant(e) = mapping.entry(b) {
            e.insert(char::from_u32(offset).unwrap_or('?'));
            offset += 1;
        }
    }
    mapping
}
