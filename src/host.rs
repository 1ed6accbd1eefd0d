use std::borrow::Cow;

use candle_core::Device;
use tracing::info;

use crate::config::{GenerationConfig, SummaryOptions};
use crate::device::device_info;
use crate::error::Result;
use crate::generation::BeamSearch;
use crate::model::{
    detect_architecture, load_seq2seq, resolve_model_files, ModelProfile, Seq2SeqModel,
};
use crate::tokenizer::TokenizerWrapper;

/// The loaded summarization pipeline: network, tokenizer and generation
/// defaults bound to one device. Built once at startup, then owned by the
/// inference worker.
pub struct ModelHost {
    model: Box<dyn Seq2SeqModel>,
    tokenizer: TokenizerWrapper,
    profile: ModelProfile,
    device: Device,
    model_id: String,
}

impl ModelHost {
    /// Resolve, download and load `model_id`. Any failure here is fatal for
    /// the service.
    pub fn load(
        model_id: &str,
        revision: &str,
        hf_token: Option<&str>,
        device: Device,
    ) -> Result<Self> {
        info!("Loading model: {}", model_id);
        let files = resolve_model_files(model_id, revision, hf_token)?;

        let config = files.read_config()?;
        let architecture = detect_architecture(&config)?;
        info!("Detected architecture: {:?}", architecture);

        let profile = ModelProfile::from_config_json(&config);
        info!(
            "Generation profile: max_input_tokens={}, length_penalty={}, \
             no_repeat_ngram_size={}, early_stopping={}",
            profile.max_input_tokens,
            profile.length_penalty,
            profile.no_repeat_ngram_size,
            profile.early_stopping
        );

        let tokenizer = TokenizerWrapper::load(&files.tokenizer, profile.max_input_tokens)?;
        let model = load_seq2seq(architecture, &files, &device)?;

        info!("Model {} ready on {}", model_id, device_info(&device));
        Ok(Self::new(model, tokenizer, profile, device, model_id))
    }

    pub fn new(
        model: Box<dyn Seq2SeqModel>,
        tokenizer: TokenizerWrapper,
        profile: ModelProfile,
        device: Device,
        model_id: &str,
    ) -> Self {
        Self {
            model,
            tokenizer,
            profile,
            device,
            model_id: model_id.to_string(),
        }
    }

    /// Summarize `text`, truncating it to the model's input limit.
    pub fn summarize(&mut self, text: &str, options: &SummaryOptions) -> Result<String> {
        let input: Cow<str> = match &self.profile.prefix {
            Some(prefix) => Cow::Owned(format!("{prefix}{text}")),
            None => Cow::Borrowed(text),
        };
        let input_ids = self.tokenizer.encode(&input)?;
        let config = GenerationConfig::resolve(options, &self.profile);

        let output =
            BeamSearch::new(self.model.as_mut(), &self.device).generate(&input_ids, &config)?;

        info!(
            "{}: generated {} tokens from {} input tokens in {}ms ({} steps, score {:.3})",
            self.model_id,
            output.tokens.len(),
            input_ids.len(),
            output.total_time_ms,
            output.steps,
            output.score
        );

        Ok(self.tokenizer.decode(&output.tokens)?.trim().to_string())
    }
}
