use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::t5::{Config, T5ForConditionalGeneration};
use tracing::info;

use super::{ModelFiles, Seq2SeqModel};
use crate::device::model_dtype;
use crate::error::Result;

pub struct T5Model {
    model: T5ForConditionalGeneration,
}

impl T5Model {
    pub fn load(files: &ModelFiles, device: &Device) -> Result<Self> {
        info!("Loading T5 model configuration...");
        let config_str = std::fs::read_to_string(&files.config)?;
        let mut config: Config = serde_json::from_str(&config_str)?;

        // Beam rows are reordered between steps, which a per-model KV cache
        // cannot follow; every step re-runs the decoder on the full prefix.
        config.use_cache = false;

        info!(
            "T5 config: vocab_size={}, d_model={}, num_layers={}, num_heads={}",
            config.vocab_size, config.d_model, config.num_layers, config.num_heads
        );

        let vb = files.var_builder(model_dtype(device), device)?;
        let model = Self::new(&config, vb)?;

        info!("T5 model loaded successfully");
        Ok(model)
    }

    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let model = T5ForConditionalGeneration::load(vb, config)?;
        Ok(Self { model })
    }
}

impl Seq2SeqModel for T5Model {
    fn encode(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.model.encode(input_ids)?)
    }

    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_output: &Tensor) -> Result<Tensor> {
        Ok(self.model.decode(decoder_input_ids, encoder_output)?)
    }

    fn reset_cache(&mut self) {
        self.model.clear_kv_cache();
    }
}
