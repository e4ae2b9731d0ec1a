//! Token sampling
//!
//! A [`SamplerChain`] is built fresh from the current [`SamplingConfig`] for
//! every generation. Stages run in a fixed order, each one narrowing the
//! candidate set left by the previous stage:
//!
//! 1. repetition penalty (always present)
//! 2. top-k (when `top_k > 0`)
//! 3. min-p (when `min_p > 0`)
//! 4. top-p (when `0 < top_p < 1`)
//! 5. temperature + random draw, or greedy arg-max when `temperature == 0`

use std::collections::{HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::inference::backend::TokenId;

/// Process-wide sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Softmax temperature (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus threshold; 1.0 disables the stage
    pub top_p: f32,
    /// Top-k cutoff; 0 disables the stage
    pub top_k: u32,
    /// Repetition penalty strength; 1.0 is neutral
    pub repeat_penalty: f32,
    /// How many recent generated tokens the penalty looks at
    pub repeat_last_n: u32,
    /// Minimum probability relative to the top candidate; 0.0 disables the stage
    pub min_p: f32,
    /// Always 1
    pub min_keep: u32,
    /// Seed for the random draw (`None` = fresh entropy per generation)
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.10,
            repeat_last_n: 256,
            min_p: 0.05,
            min_keep: 1,
            seed: None,
        }
    }
}

/// Raw, unvalidated sampling parameters as received from a host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingUpdate {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub min_p: f32,
}

impl Default for SamplingUpdate {
    fn default() -> Self {
        Self::from(&SamplingConfig::default())
    }
}

impl From<&SamplingConfig> for SamplingUpdate {
    fn from(config: &SamplingConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: i32::try_from(config.top_k).unwrap_or(i32::MAX),
            repeat_penalty: config.repeat_penalty,
            repeat_last_n: i32::try_from(config.repeat_last_n).unwrap_or(i32::MAX),
            min_p: config.min_p,
        }
    }
}

// f32::max ignores NaN, so NaN inputs collapse to the lower bound
fn non_negative(value: f32) -> f32 {
    value.max(0.0)
}

fn unit_interval(value: f32) -> f32 {
    value.max(0.0).min(1.0)
}

impl SamplingConfig {
    /// Replaces every field from `update`, clamped to its valid range.
    /// The seed is left untouched and `min_keep` is pinned to 1.
    pub fn apply(&mut self, update: &SamplingUpdate) {
        self.temperature = non_negative(update.temperature);
        self.top_p = unit_interval(update.top_p);
        self.top_k = update.top_k.max(0) as u32;
        self.repeat_penalty = non_negative(update.repeat_penalty);
        self.repeat_last_n = update.repeat_last_n.max(0) as u32;
        self.min_p = unit_interval(update.min_p);
        self.min_keep = 1;
    }

    /// Clamps values that did not come through [`SamplingConfig::apply`],
    /// e.g. ones read from disk.
    pub fn validate(&mut self) {
        let update = SamplingUpdate::from(&*self);
        self.apply(&update);
    }
}

/// One filter of the chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    Penalties { last_n: usize, penalty: f32 },
    TopK { k: usize },
    MinP { p: f32, min_keep: usize },
    TopP { p: f32, min_keep: usize },
    Temperature { t: f32 },
    Greedy,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: TokenId,
    logit: f32,
}

/// Ordered selection strategies tried for every decode step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTier {
    /// The configured chain
    Chain,
    /// Deterministic arg-max over the raw, unfiltered scores
    RawArgMax,
}

/// First tier that yields a token wins; exhausting the table ends generation.
pub const SELECTION_POLICY: [SelectionTier; 2] = [SelectionTier::Chain, SelectionTier::RawArgMax];

/// A chosen token and the tier that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub token: TokenId,
    pub tier: SelectionTier,
}

/// Stateful per-generation sampler
pub struct SamplerChain {
    stages: Vec<SamplerStage>,
    /// Recently accepted tokens, bounded by the penalty lookback
    history: VecDeque<TokenId>,
    history_limit: usize,
    rng: StdRng,
}

impl SamplerChain {
    pub fn build(config: &SamplingConfig) -> Self {
        let min_keep = config.min_keep.max(1) as usize;
        let last_n = config.repeat_last_n as usize;

        let mut stages = vec![SamplerStage::Penalties {
            last_n,
            penalty: config.repeat_penalty,
        }];
        if config.top_k > 0 {
            stages.push(SamplerStage::TopK {
                k: config.top_k as usize,
            });
        }
        if config.min_p > 0.0 {
            stages.push(SamplerStage::MinP {
                p: config.min_p,
                min_keep,
            });
        }
        if config.top_p > 0.0 && config.top_p < 1.0 {
            stages.push(SamplerStage::TopP {
                p: config.top_p,
                min_keep,
            });
        }
        if config.temperature > 0.0 {
            stages.push(SamplerStage::Temperature {
                t: config.temperature,
            });
        } else {
            stages.push(SamplerStage::Greedy);
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        tracing::debug!("Built sampler chain: {:?}", stages);

        Self {
            stages,
            history: VecDeque::with_capacity(last_n.min(1024)),
            history_limit: last_n,
            rng,
        }
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// Records a token so later penalty evaluations see it
    pub fn accept(&mut self, token: TokenId) {
        if self.history_limit == 0 {
            return;
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Runs the whole chain once and accepts the result.
    ///
    /// Returns `None` when filtering leaves nothing selectable.
    pub fn select(&mut self, scores: &[f32]) -> Option<TokenId> {
        let Self {
            stages,
            history,
            rng,
            ..
        } = self;

        let mut candidates: Vec<Candidate> = scores
            .iter()
            .enumerate()
            .filter(|(_, logit)| !logit.is_nan())
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit,
            })
            .collect();

        let mut chosen = None;
        for stage in stages.iter() {
            if candidates.is_empty() {
                return None;
            }
            match *stage {
                SamplerStage::Penalties { last_n, penalty } => {
                    let skip = history.len().saturating_sub(last_n);
                    apply_penalties(&mut candidates, history.iter().skip(skip), penalty);
                }
                SamplerStage::TopK { k } => top_k(&mut candidates, k),
                SamplerStage::MinP { p, min_keep } => min_p(&mut candidates, p, min_keep),
                SamplerStage::TopP { p, min_keep } => top_p(&mut candidates, p, min_keep),
                SamplerStage::Temperature { t } => chosen = sample(&mut candidates, t, rng),
                SamplerStage::Greedy => chosen = greedy(&candidates),
            }
        }

        let token = chosen?;
        self.accept(token);
        Some(token)
    }

    /// Walks [`SELECTION_POLICY`] until a tier produces a token
    pub fn select_with_fallback(&mut self, scores: &[f32]) -> Option<Selection> {
        SELECTION_POLICY.iter().find_map(|&tier| {
            let token = match tier {
                SelectionTier::Chain => self.select(scores),
                SelectionTier::RawArgMax => {
                    let token = argmax(scores)?;
                    self.accept(token);
                    Some(token)
                }
            }?;
            Some(Selection { token, tier })
        })
    }
}

/// Index of the highest non-NaN score
pub fn argmax(scores: &[f32]) -> Option<TokenId> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i as TokenId)
}

/// Divides positive logits and multiplies negative ones, once per distinct
/// token in the window, so a repeated token always loses ground.
fn apply_penalties<'a>(
    candidates: &mut [Candidate],
    window: impl Iterator<Item = &'a TokenId>,
    penalty: f32,
) {
    if penalty == 1.0 || penalty <= 0.0 {
        return;
    }
    let seen: HashSet<TokenId> = window.copied().collect();
    if seen.is_empty() {
        return;
    }
    for candidate in candidates.iter_mut().filter(|c| seen.contains(&c.id)) {
        if candidate.logit > 0.0 {
            candidate.logit /= penalty;
        } else {
            candidate.logit *= penalty;
        }
    }
}

fn sort_descending(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
}

/// Probabilities of the candidates in their current order
fn softmax(candidates: &[Candidate]) -> Option<Vec<f32>> {
    let max = candidates
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }
    let exps: Vec<f32> = candidates.iter().map(|c| (c.logit - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return None;
    }
    Some(exps.into_iter().map(|e| e / sum).collect())
}

fn top_k(candidates: &mut Vec<Candidate>, k: usize) {
    sort_descending(candidates);
    candidates.truncate(k.max(1));
}

/// Drops candidates whose probability is below `p` times the top
/// probability, keeping at least `min_keep`.
fn min_p(candidates: &mut Vec<Candidate>, p: f32, min_keep: usize) {
    sort_descending(candidates);
    let Some(top) = candidates.first().map(|c| c.logit) else {
        return;
    };
    if !top.is_finite() {
        return;
    }
    // p_i >= p * p_max  <=>  logit_i >= logit_max + ln(p)
    let threshold = top + p.ln();
    let kept = candidates.iter().take_while(|c| c.logit >= threshold).count();
    candidates.truncate(kept.max(min_keep));
}

/// Keeps the smallest prefix whose cumulative probability reaches `p`,
/// never fewer than `min_keep`.
fn top_p(candidates: &mut Vec<Candidate>, p: f32, min_keep: usize) {
    sort_descending(candidates);
    let Some(probs) = softmax(candidates) else {
        return;
    };
    let mut cumulative = 0.0;
    let mut keep = candidates.len();
    for (i, prob) in probs.iter().enumerate() {
        cumulative += prob;
        if cumulative >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep);
}

fn greedy(candidates: &[Candidate]) -> Option<TokenId> {
    candidates
        .iter()
        .filter(|c| c.logit > f32::NEG_INFINITY)
        .max_by(|a, b| a.logit.total_cmp(&b.logit))
        .map(|c| c.id)
}

fn sample(candidates: &mut [Candidate], temperature: f32, rng: &mut StdRng) -> Option<TokenId> {
    for candidate in candidates.iter_mut() {
        candidate.logit /= temperature;
    }
    let probs = softmax(candidates)?;
    let draw: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (candidate, prob) in candidates.iter().zip(&probs) {
        cumulative += prob;
        if draw < cumulative {
            return Some(candidate.id);
        }
    }
    // Rounding left the draw past the last bucket
    candidates
        .iter()
        .zip(&probs)
        .rev()
        .find(|(_, &prob)| prob > 0.0)
        .map(|(c, _)| c.id)
}
