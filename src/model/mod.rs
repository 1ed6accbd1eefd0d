mod bart;
mod loader;
mod t5;

pub use bart::{BartConfig, BartModel};
pub use loader::{resolve_model_files, ModelFiles, WeightsFormat};
pub use t5::T5Model;

use candle_core::{Device, Tensor};
use serde_json::Value;

use crate::error::{Result, SummarizeError};

/// Encoder-decoder models the summarizer can drive.
pub trait Seq2SeqModel: Send {
    /// Encode a `(1, seq_len)` tensor of input ids into hidden states.
    fn encode(&mut self, input_ids: &Tensor) -> Result<Tensor>;

    /// Next-token logits for each row of `decoder_input_ids`, shaped
    /// `(batch, vocab)`. Every row carries the full decoder prefix and
    /// `encoder_output` has a matching batch dimension.
    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_output: &Tensor) -> Result<Tensor>;

    /// Drop any state left over from a previous input.
    fn reset_cache(&mut self) {}
}

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    Bart,
    T5,
}

/// Detect the architecture from a parsed config.json
pub fn detect_architecture(config: &Value) -> Result<ModelArchitecture> {
    let classify = |name: &str| {
        let name = name.to_lowercase();
        if name.contains("bart") {
            Some(ModelArchitecture::Bart)
        } else if name.contains("t5") {
            Some(ModelArchitecture::T5)
        } else {
            None
        }
    };

    let from_architectures = config
        .get("architectures")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(classify);

    from_architectures
        .or_else(|| config.get("model_type").and_then(Value::as_str).and_then(classify))
        .ok_or_else(|| {
            SummarizeError::ModelLoad(format!(
                "unsupported architecture (model_type={}), expected BART or T5",
                config.get("model_type").and_then(Value::as_str).unwrap_or("unknown")
            ))
        })
}

/// Load the network weights for `architecture` onto `device`.
pub fn load_seq2seq(
    architecture: ModelArchitecture,
    files: &ModelFiles,
    device: &Device,
) -> Result<Box<dyn Seq2SeqModel>> {
    let model: Box<dyn Seq2SeqModel> = match architecture {
        ModelArchitecture::Bart => Box::new(BartModel::load(files, device)?),
        ModelArchitecture::T5 => Box::new(T5Model::load(files, device)?),
    };
    Ok(model)
}

/// Generation defaults a checkpoint ships in its config.json.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelProfile {
    pub decoder_start_token_id: u32,
    pub eos_token_id: u32,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    /// Longest tokenized input the encoder accepts.
    pub max_input_tokens: usize,
    /// Decoder position limit, `None` for relative-position models.
    pub max_decoder_length: Option<usize>,
    pub length_penalty: f64,
    pub no_repeat_ngram_size: usize,
    pub early_stopping: bool,
    /// Text prepended to every input, e.g. `"summarize: "` for T5.
    pub prefix: Option<String>,
}

const FALLBACK_MAX_INPUT_TOKENS: usize = 1024;

impl ModelProfile {
    /// Values under `task_specific_params.summarization` win over top-level ones.
    pub fn from_config_json(config: &Value) -> Self {
        let token = |key: &str| setting(config, key).and_then(token_id);

        let max_decoder_length = config
            .get("max_position_embeddings")
            .and_then(Value::as_u64)
            .map(|n| n as usize);
        let max_input_tokens = max_decoder_length
            .or_else(|| config.get("n_positions").and_then(Value::as_u64).map(|n| n as usize))
            .unwrap_or(FALLBACK_MAX_INPUT_TOKENS);

        Self {
            decoder_start_token_id: token("decoder_start_token_id")
                .or_else(|| token("pad_token_id"))
                .unwrap_or(0),
            eos_token_id: token("eos_token_id").unwrap_or(2),
            forced_bos_token_id: token("forced_bos_token_id"),
            forced_eos_token_id: token("forced_eos_token_id"),
            max_input_tokens,
            max_decoder_length,
            length_penalty: setting(config, "length_penalty")
                .and_then(Value::as_f64)
                .unwrap_or(1.0),
            no_repeat_ngram_size: setting(config, "no_repeat_ngram_size")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            early_stopping: setting(config, "early_stopping")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            prefix: setting(config, "prefix")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        }
    }
}

fn setting<'a>(config: &'a Value, key: &str) -> Option<&'a Value> {
    config
        .pointer(&format!("/task_specific_params/summarization/{key}"))
        .filter(|v| !v.is_null())
        .or_else(|| config.get(key).filter(|v| !v.is_null()))
}

/// Token ids appear either as a number or as a list whose first entry counts.
fn token_id(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .or_else(|| value.as_array()?.first()?.as_u64())
        .map(|id| id as u32)
}
