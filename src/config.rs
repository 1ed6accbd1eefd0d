use clap::Parser;
use tracing::debug;

use crate::model::ModelProfile;

pub const DEFAULT_MODEL: &str = "facebook/bart-large-cnn";
pub const DEFAULT_API_KEY: &str = "changeme";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Abstractive summarization service")]
pub struct Args {
    /// Hub model id or local directory holding config.json, tokenizer.json and weights
    #[arg(short, long, env = "MODEL_NAME", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Shared secret expected in the x-api-key header
    #[arg(long, env = "API_KEY", default_value = DEFAULT_API_KEY, hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub revision: String,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Skip accelerator detection
    #[arg(long, env = "FORCE_CPU")]
    pub cpu: bool,
}

impl Args {
    pub fn uses_default_api_key(&self) -> bool {
        self.api_key == DEFAULT_API_KEY
    }
}

/// Caller-controlled decoding knobs, already validated by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryOptions {
    pub max_length: usize,
    pub min_length: usize,
    pub num_beams: usize,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            max_length: 142,
            min_length: 56,
            num_beams: 4,
        }
    }
}

/// Everything the beam search needs for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_length: usize,
    pub min_length: usize,
    pub num_beams: usize,
    pub length_penalty: f64,
    pub no_repeat_ngram_size: usize,
    pub early_stopping: bool,
    pub decoder_start_token_id: u32,
    pub eos_token_id: u32,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
}

impl GenerationConfig {
    /// Merge request options with the model's defaults. `max_length` is
    /// clamped to the decoder's position limit, or to the encoder input limit
    /// for relative-position models that have none.
    pub fn resolve(options: &SummaryOptions, profile: &ModelProfile) -> Self {
        let limit = profile
            .max_decoder_length
            .unwrap_or(profile.max_input_tokens);
        let max_length = if options.max_length > limit {
            debug!(
                requested = options.max_length,
                limit, "Clamping max_length to decoder limit"
            );
            limit
        } else {
            options.max_length
        };

        Self {
            max_length,
            min_length: options.min_length,
            num_beams: options.num_beams,
            length_penalty: profile.length_penalty,
            no_repeat_ngram_size: profile.no_repeat_ngram_size,
            early_stopping: profile.early_stopping,
            decoder_start_token_id: profile.decoder_start_token_id,
            eos_token_id: profile.eos_token_id,
            forced_bos_token_id: profile.forced_bos_token_id,
            forced_eos_token_id: profile.forced_eos_token_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn args_from_flags() {
        let args = Args::try_parse_from([
            "summarization-api",
            "--model",
            "sshleifer/distilbart-cnn-12-6",
            "--api-key",
            "s3cret",
            "--port",
            "9000",
            "--cpu",
        ])
        .unwrap();

        assert_eq!(args.model, "sshleifer/distilbart-cnn-12-6");
        assert_eq!(args.port, 9000);
        assert!(args.cpu);
        assert!(!args.uses_default_api_key());
    }

    #[test]
    fn placeholder_key_is_detected() {
        let args =
            Args::try_parse_from(["summarization-api", "--api-key", DEFAULT_API_KEY]).unwrap();
        assert!(args.uses_default_api_key());
    }

    #[test]
    fn resolve_merges_profile_and_clamps() {
        let profile = ModelProfile::from_config_json(&json!({
            "decoder_start_token_id": 2,
            "eos_token_id": 2,
            "forced_bos_token_id": 0,
            "max_position_embeddings": 128,
            "length_penalty": 2.0,
            "no_repeat_ngram_size": 3,
            "early_stopping": true
        }));
        let options = SummaryOptions {
            max_length: 500,
            min_length: 10,
            num_beams: 2,
        };

        let config = GenerationConfig::resolve(&options, &profile);

        assert_eq!(config.max_length, 128);
        assert_eq!(config.min_length, 10);
        assert_eq!(config.num_beams, 2);
        assert_eq!(config.forced_bos_token_id, Some(0));
        assert_eq!(config.no_repeat_ngram_size, 3);
        assert!(config.early_stopping);
    }

    #[test]
    fn resolve_bounds_models_without_position_limit() {
        let profile = ModelProfile::from_config_json(&json!({
            "model_type": "t5",
            "pad_token_id": 0,
            "eos_token_id": 1,
            "n_positions": 512
        }));
        assert_eq!(profile.max_decoder_length, None);

        let options = SummaryOptions {
            max_length: 1_000_000_000,
            min_length: 1_000_000_000,
            num_beams: 4,
        };
        let config = GenerationConfig::resolve(&options, &profile);

        assert_eq!(config.max_length, 512);
        assert!(config.min_length > config.max_length);
    }

    #[test]
    fn resolve_keeps_lengths_under_the_limit() {
        let profile = ModelProfile::from_config_json(&json!({"n_positions": 512}));
        let config = GenerationConfig::resolve(&SummaryOptions::default(), &profile);

        assert_eq!(config.max_length, 142);
        assert_eq!(config.min_length, 56);
    }
}
