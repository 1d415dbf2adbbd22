//! Tokenizer seam.
//!
//! The core moves token ids, never text; decoding only happens when a
//! tokenizer is attached to the engine (stop-string detection, demo
//! output). [`ByteTokenizer`] is the always-available fallback;
//! [`HfTokenizer`] loads a HuggingFace `tokenizer.json`.

use crate::error::{Error, Result};

/// External tokenizer contract.
pub trait Tokenizer: Send {
    /// Encode text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text.
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> u32;

    fn bos_token_id(&self) -> u32;

    fn pad_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

/// Byte-level tokenizer: each byte is its own token id.
///
/// No vocabulary files needed, which makes it the default for the demo
/// binary and tests.
#[derive(Debug, Clone, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| t < 256)
            .map(|&t| t as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> u32 {
        0
    }

    fn bos_token_id(&self) -> u32 {
        1
    }

    fn pad_token_id(&self) -> u32 {
        0
    }

    fn vocab_size(&self) -> usize {
        256
    }
}

/// HuggingFace tokenizer loaded from a `tokenizer.json` file.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: u32,
    bos_token_id: u32,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` path.
    pub fn from_file(path: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::Tokenization(e.to_string()))?;

        // Llama-convention fallbacks when the vocabulary does not name its
        // special tokens.
        let eos_token_id = ["</s>", "<|endoftext|>", "<|im_end|>"]
            .iter()
            .find_map(|t| inner.token_to_id(t))
            .unwrap_or(2);
        let bos_token_id = inner.token_to_id("<s>").unwrap_or(1);

        Ok(Self {
            inner,
            eos_token_id,
            bos_token_id,
        })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn bos_token_id(&self) -> u32 {
        self.bos_token_id
    }

    fn pad_token_id(&self) -> u32 {
        0
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
