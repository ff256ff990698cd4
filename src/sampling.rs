//! Next-token selection from logits.

use rand::distributions::WeightedIndex;
use rand::Rng;

use crate::error::{Result, TuneError};

/// Decoding parameters for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Sample from the distribution; `false` takes the argmax.
    pub do_sample: bool,
    /// Nucleus threshold in `(0, 1]`.
    pub top_p: f64,
    /// Softmax temperature.
    pub temperature: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            do_sample: true,
            top_p: 0.95,
            temperature: 1.0,
        }
    }
}

/// Pick the next token id from a row of logits.
///
/// # Errors
///
/// Returns [`TuneError::Generation`] if the logits are empty or not finite.
pub fn sample_next<R: Rng + ?Sized>(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut R,
) -> Result<u32> {
    if logits.is_empty() {
        return Err(TuneError::Generation("empty logits".into()));
    }
    if logits.iter().any(|l| l.is_nan()) {
        return Err(TuneError::Generation("logits contain NaN".into()));
    }

    if !params.do_sample {
        return Ok(to_id(argmax(logits)));
    }

    let probs = softmax(logits, params.temperature);
    let nucleus = nucleus(&probs, params.top_p);

    let dist = WeightedIndex::new(nucleus.iter().map(|&(_, p)| p))
        .map_err(|e| TuneError::Generation(format!("degenerate distribution: {e}")))?;
    Ok(to_id(nucleus[rng.sample(dist)].0))
}

fn to_id(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &l)| if l > best.1 { (i, l) } else { best })
        .0
}

fn softmax(logits: &[f32], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = logits.iter().map(|&l| f64::from(l) / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Smallest most-likely prefix whose probability mass reaches `top_p`.
fn nucleus(probs: &[f64], top_p: f64) -> Vec<(usize, f64)> {
    let mut ranked: Vec<(usize, f64)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut cumulative = 0.0;
    let mut cutoff = ranked.len();
    for (i, &(_, p)) in ranked.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            cutoff = i + 1;
            break;
        }
    }
    ranked.truncate(cutoff);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_greedy_takes_argmax() {
        let params = SamplingParams {
            do_sample: false,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_next(&[0.1, 2.0, 0.7], &params, &mut rng).unwrap(), 1);
    }

    #[test]
    fn test_nucleus_keeps_smallest_prefix() {
        let kept = nucleus(&[0.1, 0.6, 0.3], 0.8);
        let ids: Vec<usize> = kept.iter().map(|&(i, _)| i).collect();
        assert_eq!(ids, vec![1, 2]);

        assert_eq!(nucleus(&[0.1, 0.6, 0.3], 1.0).len(), 3);
        assert_eq!(nucleus(&[0.1, 0.6, 0.3], 0.5).len(), 1);
    }

    #[test]
    fn test_sampling_stays_inside_nucleus() {
        // Token 0 carries almost all the mass; a tight nucleus must always pick it.
        let params = SamplingParams {
            top_p: 0.5,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert_eq!(sample_next(&[10.0, 0.0, 0.0, 0.0], &params, &mut rng).unwrap(), 0);
        }
    }

    #[test]
    fn test_sampling_is_reproducible_with_seed() {
        let logits = [0.5, 0.4, 0.3, 0.2, 0.1];
        let params = SamplingParams::default();

        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| sample_next(&logits, &params, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(3), draw(3));
    }

    #[test]
    fn test_invalid_logits() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = SamplingParams::default();
        assert!(sample_next(&[], &params, &mut rng).is_err());
        assert!(sample_next(&[f32::NAN, 1.0], &params, &mut rng).is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0], 0.7);
        let total: f64 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
