use std::cmp::Ordering;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the next token is picked during generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodingStrategy {
    #[default]
    Greedy,
    Sampling {
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default)]
        top_k: usize,
        #[serde(default = "default_top_p")]
        top_p: f32,
        #[serde(default = "default_repetition_penalty")]
        repetition_penalty: f32,
        #[serde(default)]
        seed: u64,
    },
    Beam(BeamSettings),
}

/// Beam search keeps the `num_beams` best partial sequences by summed
/// log-probability and returns the best finished one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeamSettings {
    pub num_beams: usize,
    /// Bans any n-gram of this size from occurring twice; 0 disables.
    #[serde(default)]
    pub no_repeat_ngram_size: usize,
    /// Stop as soon as `num_beams` hypotheses are finished.
    #[serde(default)]
    pub early_stopping: bool,
    /// Finished scores are divided by `generated_len ^ length_penalty`.
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f32,
}

impl DecodingStrategy {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DecodingStrategy::Greedy => Ok(()),
            DecodingStrategy::Sampling {
                temperature,
                top_p,
                repetition_penalty,
                ..
            } => {
                if !(*temperature > 0.0) {
                    return Err("sampling temperature must be positive".into());
                }
                if !(0.0..=1.0).contains(top_p) {
                    return Err("sampling top_p must be in [0, 1]".into());
                }
                if *repetition_penalty < 1.0 {
                    return Err("sampling repetition_penalty must be >= 1.0".into());
                }
                Ok(())
            }
            DecodingStrategy::Beam(settings) => {
                if settings.num_beams == 0 {
                    return Err("beam search needs num_beams >= 1".into());
                }
                if !settings.length_penalty.is_finite() {
                    return Err("beam length_penalty must be finite".into());
                }
                Ok(())
            }
        }
    }

    /// Picks the next token from `logits`. `history` is every id generated or
    /// prompted so far. Beam search is driven by [`beam_search`]; a single
    /// step of it is the argmax.
    pub fn select<R: Rng + ?Sized>(
        &self,
        logits: &[f32],
        history: &[u32],
        rng: &mut R,
    ) -> Option<u32> {
        match self {
            DecodingStrategy::Greedy | DecodingStrategy::Beam(_) => argmax(logits),
            DecodingStrategy::Sampling {
                temperature,
                top_k,
                top_p,
                repetition_penalty,
                ..
            } => sample_next_token(
                logits,
                *temperature,
                *top_k,
                *top_p,
                *repetition_penalty,
                history,
                rng,
            ),
        }
    }

    pub fn seed(&self) -> u64 {
        match self {
            DecodingStrategy::Greedy | DecodingStrategy::Beam(_) => 0,
            DecodingStrategy::Sampling { seed, .. } => *seed,
        }
    }
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

fn default_length_penalty() -> f32 {
    1.0
}

/// Everything `generate_from_prefix` needs besides the image and the prompt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Upper bound on the returned sequence length, prompt included.
    pub max_length: usize,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
    /// Never emitted (the unknown token, typically).
    pub bad_token_ids: Vec<u32>,
    pub strategy: DecodingStrategy,
}

/// Masks forbidden ids in place.
pub fn suppress_tokens(logits: &mut [f32], bad_token_ids: &[u32]) {
    for &id in bad_token_ids {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

pub fn argmax(logits: &[f32]) -> Option<u32> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, value)| !value.is_nan())
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx as u32)
}

pub fn sample_next_token<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
    history: &[u32],
    rng: &mut R,
) -> Option<u32> {
    if logits.is_empty() {
        return None;
    }

    let mut adjusted = logits.to_vec();

    if repetition_penalty > 1.0 {
        for &token in history.iter() {
            let idx = token as usize;
            if idx >= adjusted.len() {
                continue;
            }
            let logit = &mut adjusted[idx];
            if *logit > 0.0 {
                *logit /= repetition_penalty;
            } else {
                *logit *= repetition_penalty;
            }
        }
    }

    let inv_temp = 1.0 / temperature.max(1e-4);
    for val in adjusted.iter_mut() {
        *val *= inv_temp;
    }

    let max_val = adjusted.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max_val.is_finite() {
        return argmax(logits);
    }
    let mut probs: Vec<f32> = adjusted
        .iter()
        .map(|logit| (logit - max_val).exp())
        .collect();

    if top_k > 0 && top_k < probs.len() {
        let mut indices: Vec<usize> = (0..probs.len()).collect();
        indices
            .sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));
        for &idx in indices.iter().skip(top_k) {
            probs[idx] = 0.0;
        }
    }

    if top_p > 0.0 && top_p < 1.0 {
        let mut pairs: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        pairs.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let mut cumulative = 0.0f32;
        let mut keep = vec![false; probs.len()];
        let total: f32 = probs.iter().sum();
        for (idx, prob) in pairs {
            cumulative += prob;
            keep[idx] = true;
            if cumulative >= top_p * total {
                break;
            }
        }
        for (idx, keep_flag) in keep.iter().enumerate() {
            if !*keep_flag {
                probs[idx] = 0.0;
            }
        }
    }

    let sum: f32 = probs.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return argmax(&adjusted);
    }

    let dist = WeightedIndex::new(&probs).ok()?;
    Some(dist.sample(rng) as u32)
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f64,
}

/// Runs beam search from `prefix`. `next_logits` returns the next-token
/// logits for a full sequence; bad tokens are suppressed here.
///
/// A hypothesis finishes on eos or pad. Beams still alive at
/// `request.max_length` are finished as they are.
pub fn beam_search<F, E>(
    prefix: &[u32],
    request: &GenerationRequest,
    settings: &BeamSettings,
    mut next_logits: F,
) -> Result<Vec<u32>, E>
where
    F: FnMut(&[u32]) -> Result<Vec<f32>, E>,
{
    let num_beams = settings.num_beams.max(1);
    let normalized = |hypothesis: &Hypothesis| {
        let generated = hypothesis.tokens.len().saturating_sub(prefix.len()).max(1);
        hypothesis.score / (generated as f64).powf(settings.length_penalty as f64)
    };

    let mut beams = vec![Hypothesis {
        tokens: prefix.to_vec(),
        score: 0.0,
    }];
    let mut finished: Vec<(f64, Hypothesis)> = Vec::new();

    while !beams.is_empty() && beams[0].tokens.len() < request.max_length {
        let mut candidates: Vec<(usize, u32, f64)> = Vec::new();
        for (index, beam) in beams.iter().enumerate() {
            let mut logits = next_logits(&beam.tokens)?;
            suppress_tokens(&mut logits, &request.bad_token_ids);
            suppress_tokens(
                &mut logits,
                &banned_ngram_tokens(&beam.tokens, settings.no_repeat_ngram_size),
            );
            let log_probs = log_softmax(&logits);
            for (token, log_prob) in top_entries(&log_probs, 2 * num_beams) {
                candidates.push((index, token, beam.score + log_prob));
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, (index, token, score)) in candidates.into_iter().enumerate() {
            let mut tokens = beams[index].tokens.clone();
            tokens.push(token);
            let hypothesis = Hypothesis { tokens, score };
            if token == request.eos_token_id || token == request.pad_token_id {
                if rank < num_beams {
                    keep_best(&mut finished, normalized(&hypothesis), hypothesis, num_beams);
                }
            } else {
                next_beams.push(hypothesis);
            }
            if next_beams.len() == num_beams {
                break;
            }
        }
        beams = next_beams;

        if finished.len() >= num_beams {
            if settings.early_stopping {
                break;
            }
            let worst_finished = finished.last().map_or(f64::NEG_INFINITY, |(score, _)| *score);
            let best_alive = beams
                .first()
                .map_or(f64::NEG_INFINITY, |beam| normalized(beam));
            if worst_finished >= best_alive {
                break;
            }
        }
    }

    if finished.len() < num_beams || !settings.early_stopping {
        for beam in beams {
            keep_best(&mut finished, normalized(&beam), beam, num_beams);
        }
    }
    Ok(finished
        .into_iter()
        .next()
        .map(|(_, hypothesis)| hypothesis.tokens)
        .unwrap_or_else(|| prefix.to_vec()))
}

/// Inserts keeping `finished` sorted best first and at most `capacity` long.
fn keep_best(
    finished: &mut Vec<(f64, Hypothesis)>,
    score: f64,
    hypothesis: Hypothesis,
    capacity: usize,
) {
    let position = finished
        .iter()
        .position(|(existing, _)| score > *existing)
        .unwrap_or(finished.len());
    finished.insert(position, (score, hypothesis));
    finished.truncate(capacity);
}

/// Tokens that would complete an n-gram already present in `tokens`.
pub fn banned_ngram_tokens(tokens: &[u32], ngram_size: usize) -> Vec<u32> {
    if ngram_size == 0 || tokens.len() + 1 < ngram_size {
        return Vec::new();
    }
    let context = &tokens[tokens.len() + 1 - ngram_size..];
    let mut banned: Vec<u32> = tokens
        .windows(ngram_size)
        .filter(|window| &window[..ngram_size - 1] == context)
        .map(|window| window[ngram_size - 1])
        .collect();
    banned.sort_unstable();
    banned.dedup();
    banned
}

fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    if !max.is_finite() {
        return vec![f64::NEG_INFINITY; logits.len()];
    }
    let sum: f64 = logits
        .iter()
        .filter(|value| value.is_finite())
        .map(|&value| (value as f64 - max).exp())
        .sum();
    let log_sum = max + sum.ln();
    logits
        .iter()
        .map(|&value| {
            if value.is_finite() {
                value as f64 - log_sum
            } else {
                f64::NEG_INFINITY
            }
        })
        .collect()
}

/// Up to `count` finite entries, largest first.
fn top_entries(log_probs: &[f64], count: usize) -> Vec<(u32, f64)> {
    let mut entries: Vec<(u32, f64)> = log_probs
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_finite())
        .map(|(index, &value)| (index as u32, value))
        .collect();
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    entries.truncate(count);
    entries
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn greedy_takes_the_largest_logit() {
        let mut rng = StdRng::seed_from_u64(0);
        let next = DecodingStrategy::Greedy.select(&[0.1, 2.0, -1.0], &[], &mut rng);
        assert_eq!(next, Some(1));
    }

    #[test]
    fn suppressed_tokens_are_never_sampled() {
        let mut logits = vec![5.0, 0.0, 0.0];
        suppress_tokens(&mut logits, &[0]);
        let strategy = DecodingStrategy::Sampling {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: 3,
        };
        let mut rng = StdRng::seed_from_u64(strategy.seed());
        for _ in 0..64 {
            assert_ne!(strategy.select(&logits, &[], &mut rng), Some(0));
        }
    }

    #[test]
    fn top_k_one_is_greedy() {
        let mut rng = StdRng::seed_from_u64(11);
        let next = sample_next_token(&[0.3, 0.2, 4.0, 1.0], 1.0, 1, 1.0, 1.0, &[], &mut rng);
        assert_eq!(next, Some(2));
    }

    #[test]
    fn strategy_reads_from_tagged_json() {
        let strategy: DecodingStrategy =
            serde_json::from_str(r#"{"kind": "sampling", "top_k": 5, "seed": 7}"#).unwrap();
        assert_eq!(
            strategy,
            DecodingStrategy::Sampling {
                temperature: 1.0,
                top_k: 5,
                top_p: 1.0,
                repetition_penalty: 1.0,
                seed: 7,
            }
        );
        assert!(strategy.validate().is_ok());
    }

    fn beam(num_beams: usize) -> BeamSettings {
        BeamSettings {
            num_beams,
            no_repeat_ngram_size: 0,
            early_stopping: false,
            length_penalty: 1.0,
        }
    }

    fn request(max_length: usize) -> GenerationRequest {
        GenerationRequest {
            max_length,
            eos_token_id: 3,
            pad_token_id: 9,
            bad_token_ids: vec![],
            strategy: DecodingStrategy::Greedy,
        }
    }

    /// Token 1 looks best after the prompt, but only token 2 is followed by a
    /// confident eos.
    fn trap(tokens: &[u32]) -> Result<Vec<f32>, String> {
        let probs: [f32; 6] = match tokens {
            [0] => [0.0, 0.6, 0.4, 0.0, 0.0, 0.0],
            [0, 1] => [0.0, 0.0, 0.0, 0.34, 0.33, 0.33],
            [0, 2] => [0.0, 0.0, 0.0, 0.99, 0.01, 0.0],
            _ => [0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        };
        Ok(probs.iter().map(|p| p.ln()).collect())
    }

    #[test]
    fn beam_recovers_the_sequence_greedy_misses() {
        let found = beam_search(&[0], &request(8), &beam(2), trap).unwrap();
        assert_eq!(found, vec![0, 2, 3]);

        let single = beam_search(&[0], &request(8), &beam(1), trap).unwrap();
        assert_eq!(single, vec![0, 1, 3]);
    }

    #[test]
    fn beams_alive_at_max_length_are_returned() {
        let found = beam_search(&[0], &request(2), &beam(2), trap).unwrap();
        assert_eq!(found, vec![0, 1]);

        let untouched = beam_search(&[0, 1], &request(2), &beam(2), trap).unwrap();
        assert_eq!(untouched, vec![0, 1]);
    }

    #[test]
    fn repeated_ngrams_are_banned() {
        assert_eq!(banned_ngram_tokens(&[1, 2, 3, 1, 2], 3), vec![3]);
        assert_eq!(banned_ngram_tokens(&[4, 1, 4], 1), vec![1, 4]);
        assert!(banned_ngram_tokens(&[1, 2], 0).is_empty());
        assert!(banned_ngram_tokens(&[1], 3).is_empty());

        let settings = BeamSettings {
            no_repeat_ngram_size: 1,
            ..beam(2)
        };
        let favour_four = |_: &[u32]| -> Result<Vec<f32>, String> {
            Ok(vec![-10.0, 0.0, 0.0, -1.0, 5.0, 4.0])
        };
        let found = beam_search(&[0], &request(6), &settings, favour_four).unwrap();
        let generated = &found[1..];
        let mut unique = generated.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), generated.len(), "{found:?}");
    }

    #[test]
    fn errors_from_the_model_propagate() {
        let failing = |_: &[u32]| -> Result<Vec<f32>, String> { Err("device lost".into()) };
        let err = beam_search(&[0], &request(4), &beam(3), failing).unwrap_err();
        assert_eq!(err, "device lost");
    }

    #[test]
    fn beam_reads_from_tagged_json() {
        let strategy: DecodingStrategy =
            serde_json::from_str(r#"{"kind": "beam", "num_beams": 5, "no_repeat_ngram_size": 8}"#)
                .unwrap();
        assert_eq!(
            strategy,
            DecodingStrategy::Beam(BeamSettings {
                num_beams: 5,
                no_repeat_ngram_size: 8,
                early_stopping: false,
                length_penalty: 1.0,
            })
        );
        assert!(strategy.validate().is_ok());
        assert!(DecodingStrategy::Beam(beam(0)).validate().is_err());
    }
}
