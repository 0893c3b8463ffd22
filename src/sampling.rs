// Next-token selection: greedy or temperature/top-k/top-p sampling.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

pub fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0 as u32
}

/// Penalises every token already in `context` once: positive logits are
/// divided by `penalty`, negative ones multiplied.
pub fn apply_repetition_penalty(logits: &mut [f32], context: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<u32> = context.iter().copied().collect();
    for id in seen {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = if *logit > 0.0 { *logit / penalty } else { *logit * penalty };
        }
    }
}

/// Masks everything below the k-th largest logit. Ties at the threshold survive.
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    let pivot = sorted.len() - k;
    sorted.select_nth_unstable_by(pivot, |a, b| a.total_cmp(b));
    let threshold = sorted[pivot];
    logits.iter_mut().filter(|v| **v < threshold).for_each(|v| *v = f32::NEG_INFINITY);
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Keeps the most likely tokens until their probability mass reaches `p`.
pub fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut mass = 0.0f32;
    let mut cutoff = 0.0f32;
    for idx in order {
        cutoff = probs[idx];
        mass += probs[idx];
        if mass >= p {
            break;
        }
    }
    // ties with the last kept token survive as well
    for (logit, prob) in logits.iter_mut().zip(probs) {
        if prob < cutoff {
            *logit = f32::NEG_INFINITY;
        }
    }
}

pub fn sample_categorical<R: Rng>(logits: &[f32], rng: &mut R) -> u32 {
    let probs = softmax(logits);
    let r: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (i, p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i as u32;
        }
    }
    // rounding left r above the total; take the last token with any mass
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0) as u32
}

/// Turns a logits vector into the next token for one candidate sequence.
pub struct LogitsProcessor {
    rng: StdRng,
    do_sample: bool,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
}

impl LogitsProcessor {
    pub fn new(
        seed: Option<u64>,
        do_sample: bool,
        temperature: f32,
        top_k: usize,
        top_p: f32,
        repetition_penalty: f32,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            do_sample,
            temperature,
            top_k,
            top_p,
            repetition_penalty,
        }
    }

    pub fn greedy() -> Self {
        Self::new(Some(0), false, 1.0, 0, 1.0, 1.0)
    }

    /// `context` is every token seen so far, prompt included.
    pub fn next_token(&mut self, logits: &[f32], context: &[u32]) -> u32 {
        let mut logits = logits.to_vec();
        apply_repetition_penalty(&mut logits, context, self.repetition_penalty);
        if !self.do_sample {
            return argmax(&logits);
        }
        if self.temperature != 1.0 {
            let scaled: Vec<f32> = logits.iter().map(|v| v / self.temperature).collect();
            let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if !max.is_finite() {
                // overflowed: at this temperature all mass sits on the best token
                return argmax(&logits);
            }
            logits = scaled;
        }
        apply_top_k(&mut logits, self.top_k);
        apply_top_p(&mut logits, self.top_p);
        sample_categorical(&logits, &mut self.rng)
    }
}
