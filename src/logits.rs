use std::cmp::Ordering;

use candle_core::{DType, Tensor, D};

use crate::config::GenerationConfig;
use crate::error::Result;

pub const BLOCKED: f32 = f32::NEG_INFINITY;

/// Log-probabilities for every row of a `(batch, vocab)` logits tensor.
pub fn log_probs(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    let logits = logits.to_dtype(DType::F32)?;
    Ok(candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?)
}

/// Apply every decoding constraint to one beam's scores. `tokens` is the
/// beam's decoder prefix, start token included.
pub fn process_row(scores: &mut [f32], tokens: &[u32], config: &GenerationConfig) {
    let cur_len = tokens.len();

    if cur_len < config.min_length {
        block_token(scores, config.eos_token_id);
    }

    for token in banned_ngram_tokens(tokens, config.no_repeat_ngram_size) {
        block_token(scores, token);
    }

    if cur_len == 1 {
        if let Some(bos) = config.forced_bos_token_id {
            force_token(scores, bos);
        }
    }

    if cur_len + 1 == config.max_length {
        if let Some(eos) = config.forced_eos_token_id {
            force_token(scores, eos);
        }
    }
}

pub fn block_token(scores: &mut [f32], token: u32) {
    if let Some(score) = scores.get_mut(token as usize) {
        *score = BLOCKED;
    }
}

/// Leave `token` as the only reachable continuation.
pub fn force_token(scores: &mut [f32], token: u32) {
    scores.fill(BLOCKED);
    if let Some(score) = scores.get_mut(token as usize) {
        *score = 0.0;
    }
}

/// Tokens that would complete an n-gram already present in `tokens`.
pub fn banned_ngram_tokens(tokens: &[u32], ngram_size: usize) -> Vec<u32> {
    if ngram_size == 0 || tokens.len() + 1 < ngram_size {
        return Vec::new();
    }

    let prefix = &tokens[tokens.len() + 1 - ngram_size..];
    tokens
        .windows(ngram_size)
        .filter(|window| &window[..ngram_size - 1] == prefix)
        .map(|window| window[ngram_size - 1])
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub beam: usize,
    pub token: u32,
    /// Running sum of log-probabilities including this token.
    pub score: f32,
}

fn best_first(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.beam.cmp(&b.beam))
        .then(a.token.cmp(&b.token))
}

/// The `k` best (beam, token) extensions across all beams, best first.
/// Ties go to the lower beam index, then the lower token id.
pub fn top_candidates(rows: &[Vec<f32>], beam_scores: &[f32], k: usize) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = rows
        .iter()
        .zip(beam_scores)
        .enumerate()
        .flat_map(|(beam, (row, &base))| {
            row.iter().enumerate().map(move |(token, &log_prob)| Candidate {
                beam,
                token: token as u32,
                score: base + log_prob,
            })
        })
        .collect();

    let k = k.min(candidates.len());
    if k == 0 {
        return Vec::new();
    }
    if k < candidates.len() {
        candidates.select_nth_unstable_by(k - 1, best_first);
        candidates.truncate(k);
    }
    candidates.sort_by(best_first);
    candidates
}
