//! CPU implementation of the sampling chain used by the candle runtime.
//!
//! Stages run in a fixed order over one `Vec<f32>` of logits:
//!
//! 1. Repetition / frequency / presence penalties over the last N accepted tokens.
//! 2. Temperature scaling (non-positive temperature means argmax).
//! 3. Top-K mask.
//! 4. Softmax + top-P nucleus with a `min_keep` floor.
//! 5. Draw from the remaining distribution with a seeded [`StdRng`].

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sampler::SamplerConfig;

pub struct CpuSampler {
    config: SamplerConfig,
    rng: StdRng,
    history: VecDeque<u32>,
}

impl CpuSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(u64::from(config.seed)),
            history: VecDeque::with_capacity(config.penalty_last_n),
            config,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Pick the next token from `logits` and remember it for the penalties.
    pub fn sample_logits(&mut self, logits: &[f32]) -> u32 {
        let mut values = logits.to_vec();
        let window: Vec<u32> = self.history.iter().copied().collect();
        apply_repetition_penalty(&mut values, &window, self.config.penalty_repeat);
        apply_frequency_presence_penalty(
            &mut values,
            &window,
            self.config.penalty_freq,
            self.config.penalty_present,
        );

        let id = if self.config.temperature <= 0.0 {
            argmax(&values)
        } else {
            apply_temperature(&mut values, self.config.temperature);
            top_k_filter(&mut values, self.config.top_k);
            let probs = top_p_filter(softmax(&values), self.config.top_p, self.config.min_keep);
            draw(&probs, self.rng.gen::<f32>())
        };
        self.accept(id);
        id
    }

    /// Forget the penalty history and restart the random stream.
    pub fn restart(&mut self) {
        self.history.clear();
        self.rng = StdRng::seed_from_u64(u64::from(self.config.seed));
    }

    fn accept(&mut self, id: u32) {
        if self.config.penalty_last_n == 0 {
            return;
        }
        if self.history.len() == self.config.penalty_last_n {
            self.history.pop_front();
        }
        self.history.push_back(id);
    }
}

// ─── Stages ──────────────────────────────────────────────────────────────────

/// Push seen tokens toward zero: divide positive logits, multiply negative ones.
fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if penalty <= 0.0 || (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    let mut seen: Vec<u32> = history.to_vec();
    seen.sort_unstable();
    seen.dedup();
    for id in seen {
        if let Some(v) = logits.get_mut(id as usize) {
            if *v >= 0.0 {
                *v /= penalty;
            } else {
                *v *= penalty;
            }
        }
    }
}

fn apply_frequency_presence_penalty(logits: &mut [f32], history: &[u32], frequency: f32, presence: f32) {
    if frequency == 0.0 && presence == 0.0 {
        return;
    }
    let mut counts: HashMap<u32, usize> = HashMap::with_capacity(history.len());
    for &id in history {
        *counts.entry(id).or_insert(0) += 1;
    }
    for (id, count) in counts {
        if let Some(v) = logits.get_mut(id as usize) {
            *v -= frequency * count as f32 + presence;
        }
    }
}

fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if (temperature - 1.0).abs() < f32::EPSILON {
        return;
    }
    for v in logits.iter_mut() {
        *v /= temperature;
    }
}

/// Keep the `k` largest logits; everything else becomes `-∞`.
fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.select_nth_unstable_by(k - 1, |a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for v in logits.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().filter(|v| v.is_finite()).fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        probs.iter_mut().for_each(|p| *p /= sum);
    }
    probs
}

/// Smallest high-probability set whose mass reaches `top_p`, never fewer
/// than `min_keep` entries. Survivors are renormalised.
fn top_p_filter(mut probs: Vec<f32>, top_p: f32, min_keep: usize) -> Vec<f32> {
    if top_p >= 1.0 {
        return probs;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0f32;
    let mut keep = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= top_p && rank + 1 >= min_keep {
            keep = rank + 1;
            break;
        }
    }
    for &i in &order[keep..] {
        probs[i] = 0.0;
    }
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        probs.iter_mut().for_each(|p| *p /= sum);
    }
    probs
}

/// Inverse-CDF draw with `r` in `[0, 1)`.
fn draw(probs: &[f32], r: f32) -> u32 {
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i as u32;
        }
    }
    // Rounding left r past the final bucket.
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0) as u32
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::PENALTY_LAST_N;

    fn config(temperature: f32, top_p: f32) -> SamplerConfig {
        SamplerConfig::new(temperature, top_p)
    }

    #[test]
    fn zero_temperature_is_argmax() {
        let mut s = CpuSampler::new(config(0.0, 0.9));
        assert_eq!(s.sample_logits(&[0.1, 0.2, 5.0, 0.1]), 2);
    }

    #[test]
    fn dominant_logit_wins_under_top_p() {
        let mut logits = vec![0.0f32; 20];
        logits[7] = 50.0;
        let mut s = CpuSampler::new(config(0.7, 0.9));
        assert_eq!(s.sample_logits(&logits), 7);
    }

    #[test]
    fn same_seed_same_sequence() {
        let logits = vec![1.0f32; 50];
        let mut a = CpuSampler::new(config(1.0, 1.0));
        let mut b = CpuSampler::new(config(1.0, 1.0));
        let xs: Vec<u32> = (0..10).map(|_| a.sample_logits(&logits)).collect();
        let ys: Vec<u32> = (0..10).map(|_| b.sample_logits(&logits)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn reset_replays_the_sequence() {
        let logits = vec![1.0f32; 50];
        let mut s = CpuSampler::new(config(1.0, 1.0));
        let first: Vec<u32> = (0..5).map(|_| s.sample_logits(&logits)).collect();
        s.restart();
        let second: Vec<u32> = (0..5).map(|_| s.sample_logits(&logits)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn repetition_penalty_discourages_repeats() {
        // Greedy with two close candidates: after emitting 0 once, the
        // penalty flips the choice to 1.
        let mut s = CpuSampler::new(config(0.0, 1.0));
        let logits = [2.0f32, 1.9];
        assert_eq!(s.sample_logits(&logits), 0);
        assert_eq!(s.sample_logits(&logits), 1);
    }

    #[test]
    fn penalty_window_is_bounded() {
        let mut s = CpuSampler::new(config(0.0, 1.0));
        for _ in 0..200 {
            s.sample_logits(&[1.0, 0.5]);
        }
        assert_eq!(s.history.len(), PENALTY_LAST_N);
    }

    #[test]
    fn repetition_penalty_signs() {
        let mut logits = vec![5.0f32, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 0], 2.0);
        assert!((logits[0] - 2.5).abs() < 1e-5, "applied once per distinct token");
        assert!((logits[1] + 4.0).abs() < 1e-5);
        assert!((logits[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn frequency_and_presence() {
        let mut logits = vec![1.0f32, 1.0];
        apply_frequency_presence_penalty(&mut logits, &[0, 0, 1], 0.5, 0.25);
        assert!((logits[0] - (1.0 - 1.0 - 0.25)).abs() < 1e-5);
        assert!((logits[1] - (1.0 - 0.5 - 0.25)).abs() < 1e-5);
    }

    #[test]
    fn top_k_keeps_k_largest() {
        let mut logits = vec![1.0f32, 5.0, 3.0, 2.0, 4.0];
        top_k_filter(&mut logits, 2);
        assert!(logits[1].is_finite());
        assert!(logits[4].is_finite());
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[2], f32::NEG_INFINITY);
        assert_eq!(logits[3], f32::NEG_INFINITY);
    }

    #[test]
    fn top_p_respects_min_keep() {
        let probs = vec![0.97f32, 0.02, 0.01];
        let kept = top_p_filter(probs.clone(), 0.5, 1);
        assert_eq!(kept.iter().filter(|&&p| p > 0.0).count(), 1);
        let kept = top_p_filter(probs, 0.5, 2);
        assert_eq!(kept.iter().filter(|&&p| p > 0.0).count(), 2);
    }

    #[test]
    fn draw_walks_the_cdf() {
        let probs = [0.25f32, 0.25, 0.5];
        assert_eq!(draw(&probs, 0.0), 0);
        assert_eq!(draw(&probs, 0.3), 1);
        assert_eq!(draw(&probs, 0.99), 2);
    }
}
