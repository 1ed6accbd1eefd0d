use std::path::Path;

use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::error::{Result, SummarizeError};

pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    max_input_tokens: usize,
}

impl TokenizerWrapper {
    /// Load a tokenizer.json and cap encoded inputs at `max_input_tokens`,
    /// special tokens included.
    pub fn load(path: &Path, max_input_tokens: usize) -> Result<Self> {
        info!("Loading tokenizer from {:?}", path);
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| SummarizeError::Tokenizer(e.to_string()))?;
        let wrapper = Self::with_truncation(tokenizer, max_input_tokens)?;

        info!(
            "Tokenizer loaded with {} tokens, inputs truncated to {} tokens",
            wrapper.vocab_size(),
            max_input_tokens
        );
        Ok(wrapper)
    }

    pub fn with_truncation(mut tokenizer: Tokenizer, max_input_tokens: usize) -> Result<Self> {
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_input_tokens,
                ..Default::default()
            }))
            .map_err(|e| SummarizeError::Tokenizer(e.to_string()))?;

        Ok(Self {
            tokenizer,
            max_input_tokens,
        })
    }

    /// Oversized input is cut to the model limit rather than rejected.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| SummarizeError::Tokenizer(e.to_string()))?;

        if !encoding.get_overflowing().is_empty() {
            debug!(
                limit = self.max_input_tokens,
                "Input exceeded the model limit and was truncated"
            );
        }

        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| SummarizeError::Tokenizer(e.to_string()))
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "the": 1, "fox": 2, "jumps": 3},
            "unk_token": "[UNK]"
        }
    }"#;

    fn wrapper(limit: usize) -> TokenizerWrapper {
        let tokenizer = Tokenizer::from_str(WORD_LEVEL).unwrap();
        TokenizerWrapper::with_truncation(tokenizer, limit).unwrap()
    }

    #[test]
    fn long_input_is_truncated() {
        let ids = wrapper(3).encode("the fox jumps the fox jumps").unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn short_input_is_untouched() {
        let wrapper = wrapper(16);
        assert_eq!(wrapper.encode("fox jumps").unwrap(), vec![2, 3]);
        assert_eq!(wrapper.decode(&[1, 2]).unwrap(), "the fox");
    }
}
