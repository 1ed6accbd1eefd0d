use std::time::Instant;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{Result, SummarizeError};
use crate::logits::{log_probs, process_row, top_candidates};
use crate::model::Seq2SeqModel;

pub struct GenerationOutput {
    /// Generated ids, decoder start token excluded.
    pub tokens: Vec<u32>,
    pub score: f64,
    pub steps: usize,
    pub total_time_ms: u128,
}

struct Beam {
    tokens: Vec<u32>,
    score: f32,
}

/// Finished hypotheses, at most `num_beams` of them, scored as
/// `sum_logprobs / generated_len^length_penalty`.
struct Hypotheses {
    capacity: usize,
    length_penalty: f64,
    early_stopping: bool,
    finished: Vec<(f64, Vec<u32>)>,
}

impl Hypotheses {
    fn new(config: &GenerationConfig) -> Self {
        Self {
            capacity: config.num_beams,
            length_penalty: config.length_penalty,
            early_stopping: config.early_stopping,
            finished: Vec::new(),
        }
    }

    fn normalize(&self, sum_logprobs: f32, generated_len: usize) -> f64 {
        sum_logprobs as f64 / (generated_len.max(1) as f64).powf(self.length_penalty)
    }

    fn worst_score(&self) -> f64 {
        self.finished
            .iter()
            .map(|(score, _)| *score)
            .fold(f64::INFINITY, f64::min)
    }

    /// `tokens` includes the decoder start token but not the EOS.
    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let score = self.normalize(sum_logprobs, tokens.len() - 1);
        if self.finished.len() < self.capacity || score > self.worst_score() {
            self.finished.push((score, tokens));
            if self.finished.len() > self.capacity {
                let worst = self
                    .finished
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0))
                    .map(|(i, _)| i);
                if let Some(worst) = worst {
                    self.finished.remove(worst);
                }
            }
        }
    }

    /// No live beam can beat the worst finished hypothesis any more.
    fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.finished.len() < self.capacity {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst_score() >= self.normalize(best_sum_logprobs, cur_len - 1)
    }

    fn into_best(self) -> Option<(f64, Vec<u32>)> {
        self.finished
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
    }
}

pub struct BeamSearch<'a> {
    model: &'a mut dyn Seq2SeqModel,
    device: &'a Device,
}

impl<'a> BeamSearch<'a> {
    pub fn new(model: &'a mut dyn Seq2SeqModel, device: &'a Device) -> Self {
        Self { model, device }
    }

    pub fn generate(
        &mut self,
        input_ids: &[u32],
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        if input_ids.is_empty() {
            return Err(SummarizeError::Generation("Empty input".to_string()));
        }
        if config.num_beams == 0 {
            return Err(SummarizeError::Generation(
                "num_beams must be at least 1".to_string(),
            ));
        }

        let start_time = Instant::now();
        self.model.reset_cache();

        let input = Tensor::new(input_ids, self.device)?.unsqueeze(0)?;
        let encoder_output = self.model.encode(&input)?;
        // Re-expanded only when the number of live beams changes.
        let mut expanded = (1, encoder_output.clone());

        let mut beams = vec![Beam {
            tokens: vec![config.decoder_start_token_id],
            score: 0.0,
        }];
        let mut hypotheses = Hypotheses::new(config);
        let mut done = false;
        let mut steps = 0;

        while !beams.is_empty() && beams[0].tokens.len() < config.max_length {
            let cur_len = beams[0].tokens.len();
            let rows = beams.len();
            if expanded.0 != rows {
                expanded = (rows, encoder_output.repeat((rows, 1, 1))?);
            }

            let flat: Vec<u32> = beams.iter().flat_map(|b| b.tokens.iter().copied()).collect();
            let decoder_input = Tensor::from_vec(flat, (rows, cur_len), self.device)?;
            let logits = self.model.decode(&decoder_input, &expanded.1)?;

            let mut scores = log_probs(&logits)?;
            for (row, beam) in scores.iter_mut().zip(&beams) {
                process_row(row, &beam.tokens, config);
            }
            let beam_scores: Vec<f32> = beams.iter().map(|b| b.score).collect();
            let candidates =
                top_candidates(&scores, &beam_scores, config.num_beams.saturating_mul(2));
            steps += 1;

            let mut next = Vec::with_capacity(config.num_beams.min(candidates.len()));
            for (rank, candidate) in candidates.iter().enumerate() {
                let parent = &beams[candidate.beam];
                if candidate.token == config.eos_token_id {
                    // EOS only counts when it ranks among the kept beams.
                    if rank < config.num_beams {
                        hypotheses.add(parent.tokens.clone(), candidate.score);
                    }
                } else {
                    let mut tokens = parent.tokens.clone();
                    tokens.push(candidate.token);
                    next.push(Beam {
                        tokens,
                        score: candidate.score,
                    });
                }
                if next.len() == config.num_beams {
                    break;
                }
            }

            let best_score = candidates.first().map(|c| c.score).unwrap_or(f32::NEG_INFINITY);
            beams = next;
            if hypotheses.is_done(best_score, cur_len) {
                debug!("Beam search finished early at length {}", cur_len);
                done = true;
                break;
            }
        }

        if !done {
            for beam in beams {
                hypotheses.add(beam.tokens, beam.score);
            }
        }

        let (score, tokens) = hypotheses.into_best().ok_or_else(|| {
            SummarizeError::Generation("Beam search produced no hypothesis".to_string())
        })?;

        Ok(GenerationOutput {
            tokens: tokens[1..].to_vec(),
            score,
            steps,
            total_time_ms: start_time.elapsed().as_millis(),
        })
    }
}
