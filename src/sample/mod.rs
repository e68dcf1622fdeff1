use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::TokenId;

/// Temperature / top-k / top-p sampler over raw logits.
///
/// Temperature 0 is greedy. With a seed the draw sequence is reproducible.
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(temperature: f32, top_k: usize, top_p: f32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature,
            top_k,
            top_p,
            rng,
        }
    }

    pub fn greedy() -> Self {
        Self::new(0.0, 0, 1.0, Some(0))
    }

    pub fn sample(&mut self, logits: &[f32]) -> TokenId {
        if logits.is_empty() {
            return 0;
        }
        if self.temperature <= f32::EPSILON {
            return argmax(logits);
        }

        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(i, &l)| (i, l / self.temperature))
            .collect();
        if candidates.is_empty() {
            return argmax(logits);
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }

        // Softmax over the survivors; candidates are sorted so [0] is the max.
        let max = candidates[0].1;
        let mut probs: Vec<(usize, f32)> = candidates.iter().map(|&(i, l)| (i, (l - max).exp())).collect();
        let sum: f32 = probs.iter().map(|(_, p)| p).sum();
        for (_, p) in &mut probs {
            *p /= sum;
        }

        if self.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (n, (_, p)) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.top_p {
                    keep = n + 1;
                    break;
                }
            }
            probs.truncate(keep);
        }

        let total: f32 = probs.iter().map(|(_, p)| p).sum();
        let r: f32 = self.rng.gen::<f32>() * total;
        let mut cumulative = 0.0;
        for &(idx, p) in &probs {
            cumulative += p;
            if cumulative >= r {
                return idx as TokenId;
            }
        }

        probs.last().map(|&(i, _)| i as TokenId).unwrap_or(0)
    }
}

fn argmax(logits: &[f32]) -> TokenId {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i as TokenId)
        .unwrap_or(0)
}
