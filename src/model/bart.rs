use candle_core::{DType, Device, Module, Result as CandleResult, Tensor};
use candle_nn::{
    embedding, layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder,
};
use serde::Deserialize;
use tracing::info;

use super::{ModelFiles, Seq2SeqModel};
use crate::device::model_dtype;
use crate::error::Result;

// Learned position tables reserve their first two rows.
const POSITION_OFFSET: usize = 2;
const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Deserialize)]
pub struct BartConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub scale_embedding: bool,
    #[serde(default = "default_activation", rename = "activation_function")]
    pub activation: Activation,
}

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_activation() -> Activation {
    Activation::Gelu
}

impl BartConfig {
    fn embed_scale(&self) -> f64 {
        if self.scale_embedding {
            (self.d_model as f64).sqrt()
        } else {
            1.0
        }
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
}

impl Attention {
    fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> CandleResult<Self> {
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor, batch: usize, len: usize) -> CandleResult<Tensor> {
        xs.reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Self-attention when `key_value_states` is `None`, cross-attention otherwise.
    fn forward(
        &self,
        xs: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, q_len, embed_dim) = xs.dims3()?;
        let kv = key_value_states.unwrap_or(xs);
        let kv_len = kv.dim(1)?;

        let q = (self.q_proj.forward(xs)? * self.scaling)?;
        let q = self.split_heads(&q, batch, q_len)?;
        let k = self.split_heads(&self.k_proj.forward(kv)?, batch, kv_len)?;
        let v = self.split_heads(&self.v_proj.forward(kv)?, batch, kv_len)?;

        let scores = q.matmul(&k.t()?.contiguous()?)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, embed_dim))?;
        self.out_proj.forward(&out)
    }
}

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl FeedForward {
    fn new(
        d_model: usize,
        ffn_dim: usize,
        activation: Activation,
        vb: &VarBuilder,
    ) -> CandleResult<Self> {
        Ok(Self {
            fc1: linear(d_model, ffn_dim, vb.pp("fc1"))?,
            fc2: linear(ffn_dim, d_model, vb.pp("fc2"))?,
            activation,
        })
    }

    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let hidden = self.activation.forward(&self.fc1.forward(xs)?)?;
        self.fc2.forward(&hidden)
    }
}

fn norm(cfg: &BartConfig, vb: &VarBuilder, name: &str) -> CandleResult<LayerNorm> {
    layer_norm(cfg.d_model, LAYER_NORM_EPS, vb.pp(name))
}

// Post-norm layers: each sub-block is followed by its own LayerNorm.
struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    fn new(cfg: &BartConfig, vb: VarBuilder) -> CandleResult<Self> {
        Ok(Self {
            self_attn: Attention::new(
                cfg.d_model,
                cfg.encoder_attention_heads,
                vb.pp("self_attn"),
            )?,
            self_attn_layer_norm: norm(cfg, &vb, "self_attn_layer_norm")?,
            ffn: FeedForward::new(cfg.d_model, cfg.encoder_ffn_dim, cfg.activation, &vb)?,
            final_layer_norm: norm(cfg, &vb, "final_layer_norm")?,
        })
    }

    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let xs = (self.self_attn.forward(xs, None, None)? + xs)?;
        let xs = self.self_attn_layer_norm.forward(&xs)?;
        let xs = (self.ffn.forward(&xs)? + &xs)?;
        self.final_layer_norm.forward(&xs)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn new(cfg: &BartConfig, vb: VarBuilder) -> CandleResult<Self> {
        let heads = cfg.decoder_attention_heads;
        Ok(Self {
            self_attn: Attention::new(cfg.d_model, heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: norm(cfg, &vb, "self_attn_layer_norm")?,
            encoder_attn: Attention::new(cfg.d_model, heads, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: norm(cfg, &vb, "encoder_attn_layer_norm")?,
            ffn: FeedForward::new(cfg.d_model, cfg.decoder_ffn_dim, cfg.activation, &vb)?,
            final_layer_norm: norm(cfg, &vb, "final_layer_norm")?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder_output: &Tensor,
        causal_mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let xs = (self.self_attn.forward(xs, None, causal_mask)? + xs)?;
        let xs = self.self_attn_layer_norm.forward(&xs)?;
        let xs = (self.encoder_attn.forward(&xs, Some(encoder_output), None)? + &xs)?;
        let xs = self.encoder_attn_layer_norm.forward(&xs)?;
        let xs = (self.ffn.forward(&xs)? + &xs)?;
        self.final_layer_norm.forward(&xs)
    }
}

/// Token embeddings (shared), learned positions and the embedding LayerNorm.
struct Embeddings {
    positions: Embedding,
    layer_norm: LayerNorm,
    scale: f64,
}

impl Embeddings {
    fn new(cfg: &BartConfig, vb: &VarBuilder) -> CandleResult<Self> {
        Ok(Self {
            positions: embedding(
                cfg.max_position_embeddings + POSITION_OFFSET,
                cfg.d_model,
                vb.pp("embed_positions"),
            )?,
            layer_norm: norm(cfg, vb, "layernorm_embedding")?,
            scale: cfg.embed_scale(),
        })
    }

    fn forward(&self, input_ids: &Tensor, shared: &Embedding) -> CandleResult<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let tokens = (shared.forward(input_ids)? * self.scale)?;
        let position_ids = Tensor::arange(
            POSITION_OFFSET as u32,
            (seq_len + POSITION_OFFSET) as u32,
            input_ids.device(),
        )?;
        let positions = self.positions.forward(&position_ids)?;
        self.layer_norm.forward(&tokens.broadcast_add(&positions)?)
    }
}

pub struct BartModel {
    shared: Embedding,
    encoder_embeddings: Embeddings,
    encoder_layers: Vec<EncoderLayer>,
    decoder_embeddings: Embeddings,
    decoder_layers: Vec<DecoderLayer>,
    final_logits_bias: Tensor,
}

impl BartModel {
    pub fn load(files: &ModelFiles, device: &Device) -> Result<Self> {
        info!("Loading BART model configuration...");
        let config_str = std::fs::read_to_string(&files.config)?;
        let cfg: BartConfig = serde_json::from_str(&config_str)?;

        info!(
            "BART config: vocab_size={}, d_model={}, encoder_layers={}, decoder_layers={}, heads={}",
            cfg.vocab_size,
            cfg.d_model,
            cfg.encoder_layers,
            cfg.decoder_layers,
            cfg.encoder_attention_heads
        );

        let vb = files.var_builder(model_dtype(device), device)?;
        let model = Self::new(&cfg, vb)?;

        info!("BART model loaded successfully");
        Ok(model)
    }

    /// Build the network from `vb`, with or without the `model.` prefix.
    pub fn new(cfg: &BartConfig, vb: VarBuilder) -> CandleResult<Self> {
        // Checkpoints differ on whether the backbone lives under `model.`
        // and on which copy of the tied embedding they keep.
        let model_vb = if vb.contains_tensor("model.shared.weight")
            || vb.contains_tensor("model.encoder.embed_tokens.weight")
        {
            vb.pp("model")
        } else {
            vb.clone()
        };
        let shared_vb = if model_vb.contains_tensor("shared.weight") {
            model_vb.pp("shared")
        } else {
            model_vb.pp("encoder").pp("embed_tokens")
        };
        let shared = embedding(cfg.vocab_size, cfg.d_model, shared_vb)?;

        info!("Building encoder...");
        let encoder_vb = model_vb.pp("encoder");
        let encoder_embeddings = Embeddings::new(cfg, &encoder_vb)?;
        let encoder_layers = (0..cfg.encoder_layers)
            .map(|i| EncoderLayer::new(cfg, encoder_vb.pp("layers").pp(i)))
            .collect::<CandleResult<Vec<_>>>()?;

        info!("Building decoder...");
        let decoder_vb = model_vb.pp("decoder");
        let decoder_embeddings = Embeddings::new(cfg, &decoder_vb)?;
        let decoder_layers = (0..cfg.decoder_layers)
            .map(|i| DecoderLayer::new(cfg, decoder_vb.pp("layers").pp(i)))
            .collect::<CandleResult<Vec<_>>>()?;

        let final_logits_bias = if vb.contains_tensor("final_logits_bias") {
            vb.get((1, cfg.vocab_size), "final_logits_bias")?
        } else {
            Tensor::zeros((1, cfg.vocab_size), vb.dtype(), vb.device())?
        };

        Ok(Self {
            shared,
            encoder_embeddings,
            encoder_layers,
            decoder_embeddings,
            decoder_layers,
            final_logits_bias,
        })
    }
}

/// Additive `(len, len)` mask hiding future positions.
fn causal_mask(len: usize, dtype: DType, device: &Device) -> CandleResult<Tensor> {
    let mask: Vec<f32> = (0..len)
        .flat_map(|i| {
            (0..len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_slice(&mask, (len, len), device)?.to_dtype(dtype)
}

impl Seq2SeqModel for BartModel {
    fn encode(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        let mut xs = self.encoder_embeddings.forward(input_ids, &self.shared)?;
        for layer in &self.encoder_layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }

    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_output: &Tensor) -> Result<Tensor> {
        let seq_len = decoder_input_ids.dim(1)?;
        let mask = if seq_len > 1 {
            let dtype = self.shared.embeddings().dtype();
            Some(causal_mask(seq_len, dtype, decoder_input_ids.device())?)
        } else {
            None
        };

        let mut xs = self.decoder_embeddings.forward(decoder_input_ids, &self.shared)?;
        for layer in &self.decoder_layers {
            xs = layer.forward(&xs, encoder_output, mask.as_ref())?;
        }

        // Only the last position feeds the next-token distribution.
        let last = xs.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        let logits = last
            .matmul(&self.shared.embeddings().t()?)?
            .broadcast_add(&self.final_logits_bias)?;
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    const VOCAB: usize = 11;
    const D_MODEL: usize = 8;
    const FFN: usize = 16;
    const MAX_POSITIONS: usize = 12;

    fn tiny_config() -> BartConfig {
        BartConfig {
            vocab_size: VOCAB,
            d_model: D_MODEL,
            encoder_layers: 2,
            decoder_layers: 2,
            encoder_attention_heads: 2,
            decoder_attention_heads: 2,
            encoder_ffn_dim: FFN,
            decoder_ffn_dim: FFN,
            max_position_embeddings: MAX_POSITIONS,
            scale_embedding: false,
            activation: Activation::Gelu,
        }
    }

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn insert_norm(weights: &mut HashMap<String, Tensor>, name: String) {
        weights.insert(format!("{name}.weight"), zeros(&[D_MODEL]));
        weights.insert(format!("{name}.bias"), zeros(&[D_MODEL]));
    }

    fn insert_attention(weights: &mut HashMap<String, Tensor>, name: String) {
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            weights.insert(format!("{name}.{proj}.weight"), zeros(&[D_MODEL, D_MODEL]));
            weights.insert(format!("{name}.{proj}.bias"), zeros(&[D_MODEL]));
        }
    }

    /// A full named checkpoint. `root` is `""` or `"model."`; `embedding`
    /// names the one copy of the tied token table that is stored.
    fn checkpoint(root: &str, embedding: &str, bias: Option<Tensor>) -> HashMap<String, Tensor> {
        let mut weights = HashMap::new();
        weights.insert(format!("{root}{embedding}.weight"), zeros(&[VOCAB, D_MODEL]));

        for side in ["encoder", "decoder"] {
            let base = format!("{root}{side}");
            weights.insert(
                format!("{base}.embed_positions.weight"),
                zeros(&[MAX_POSITIONS + POSITION_OFFSET, D_MODEL]),
            );
            insert_norm(&mut weights, format!("{base}.layernorm_embedding"));

            for i in 0..2 {
                let layer = format!("{base}.layers.{i}");
                insert_attention(&mut weights, format!("{layer}.self_attn"));
                insert_norm(&mut weights, format!("{layer}.self_attn_layer_norm"));
                if side == "decoder" {
                    insert_attention(&mut weights, format!("{layer}.encoder_attn"));
                    insert_norm(&mut weights, format!("{layer}.encoder_attn_layer_norm"));
                }
                weights.insert(format!("{layer}.fc1.weight"), zeros(&[FFN, D_MODEL]));
                weights.insert(format!("{layer}.fc1.bias"), zeros(&[FFN]));
                weights.insert(format!("{layer}.fc2.weight"), zeros(&[D_MODEL, FFN]));
                weights.insert(format!("{layer}.fc2.bias"), zeros(&[D_MODEL]));
                insert_norm(&mut weights, format!("{layer}.final_layer_norm"));
            }
        }

        if let Some(bias) = bias {
            weights.insert("final_logits_bias".to_string(), bias);
        }
        weights
    }

    fn from_checkpoint(weights: HashMap<String, Tensor>) -> BartModel {
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
        BartModel::new(&tiny_config(), vb).unwrap()
    }

    fn ids(rows: &[&[u32]]) -> Tensor {
        Tensor::new(rows.concat(), &Device::Cpu)
            .unwrap()
            .reshape((rows.len(), rows[0].len()))
            .unwrap()
    }

    #[test]
    fn causal_mask_hides_future_positions() {
        let mask = causal_mask(3, DType::F32, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<f32>().unwrap();

        for (i, row) in rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                if j > i {
                    assert_eq!(*value, f32::NEG_INFINITY);
                } else {
                    assert_eq!(*value, 0.0);
                }
            }
        }
    }

    #[test]
    fn encode_and_batched_decode_shapes() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut model = BartModel::new(&tiny_config(), vb).unwrap();

        let encoded = model.encode(&ids(&[&[0, 5, 6, 7, 2]])).unwrap();
        assert_eq!(encoded.dims(), &[1, 5, D_MODEL]);

        let beams = encoded.repeat((3, 1, 1)).unwrap();
        let logits = model
            .decode(&ids(&[&[2, 0, 4], &[2, 0, 5], &[2, 0, 6]]), &beams)
            .unwrap();
        assert_eq!(logits.dims(), &[3, VOCAB]);

        let first_step = model.decode(&ids(&[&[2]]), &encoded).unwrap();
        assert_eq!(first_step.dims(), &[1, VOCAB]);
    }

    #[test]
    fn positions_are_offset_into_the_table() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut model = BartModel::new(&tiny_config(), vb).unwrap();

        // The table holds MAX_POSITIONS rows past the offset; one more is out of range.
        let longest: Vec<u32> = vec![3; MAX_POSITIONS];
        assert!(model.encode(&ids(&[longest.as_slice()])).is_ok());

        let too_long: Vec<u32> = vec![3; MAX_POSITIONS + 1];
        assert!(model.encode(&ids(&[too_long.as_slice()])).is_err());
    }

    #[test]
    fn loads_prefixed_checkpoint_with_shared_table() {
        let mut model = from_checkpoint(checkpoint("model.", "shared", None));

        let encoded = model.encode(&ids(&[&[0, 4, 2]])).unwrap();
        let logits = model.decode(&ids(&[&[2, 0]]), &encoded).unwrap();
        assert_eq!(logits.dims(), &[1, VOCAB]);
    }

    #[test]
    fn loads_bare_checkpoint_with_encoder_embeddings() {
        let mut model = from_checkpoint(checkpoint("", "encoder.embed_tokens", None));

        let encoded = model.encode(&ids(&[&[0, 4, 2]])).unwrap();
        assert_eq!(encoded.dims(), &[1, 3, D_MODEL]);
    }

    #[test]
    fn final_logits_bias_reaches_every_beam() {
        let bias: Vec<f32> = (0..VOCAB).map(|i| i as f32 * 0.5).collect();
        let bias_tensor = Tensor::from_vec(bias.clone(), (1, VOCAB), &Device::Cpu).unwrap();
        let mut model = from_checkpoint(checkpoint("model.", "shared", Some(bias_tensor)));

        let encoded = model.encode(&ids(&[&[0, 4, 2]])).unwrap();
        let beams = encoded.repeat((2, 1, 1)).unwrap();
        let logits = model.decode(&ids(&[&[2, 0], &[2, 7]]), &beams).unwrap();

        // Zero weights leave the bias as the whole logit.
        for row in logits.to_vec2::<f32>().unwrap() {
            assert_eq!(row, bias);
        }
    }
}
