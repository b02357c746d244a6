//! Evolutionary parameter search
//!
//! One generation mutates a parent into a population, scores every member on
//! a seeded series, ranks them, breeds the top two and keeps whichever of the
//! child and the best member scores higher. Everything is driven by explicit
//! seeds, so a generation is a pure function of its inputs.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::{BacktestEngine, SimulationConfig};
use crate::indicators::IndicatorError;
use crate::metrics::{compute_metrics, PERIODS_PER_YEAR};
use crate::synthetic::BarSource;
use crate::types::{PerformanceMetrics, StrategyParameters};

/// The mutable slice of the genome, keyed by parameter name
pub type ParamSet = BTreeMap<String, f64>;

pub const ATR_STOP_MULT: &str = "atr_stop_mult";
pub const ATR_TAKE_MULT: &str = "atr_take_mult";
pub const RISK_PER_TRADE: &str = "risk_per_trade";

/// Keys perturbed by mutation
pub const TUNABLE_KEYS: [&str; 3] = [ATR_STOP_MULT, ATR_TAKE_MULT, RISK_PER_TRADE];

pub const RISK_BOUNDS: (f64, f64) = (0.001, 0.05);
pub const ATR_MULT_BOUNDS: (f64, f64) = (0.5, 6.0);

/// Value assumed for a tunable key the parameter set does not carry
const MISSING_VALUE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvolutionError {
    #[error(transparent)]
    Indicator(#[from] IndicatorError),

    #[error("population is empty")]
    EmptyPopulation,
}

/// Search knobs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvolutionSettings {
    /// Parent plus mutants
    pub population: usize,
    pub base_seed: u64,
    pub population_scale: f64,
    pub child_scale: f64,
    pub periods_per_year: f64,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            population: 6,
            base_seed: 42,
            population_scale: 0.25,
            child_scale: 0.15,
            periods_per_year: PERIODS_PER_YEAR,
        }
    }
}

impl EvolutionSettings {
    /// Evaluation seed of population member `index`
    pub fn member_seed(&self, generation: u32, index: usize) -> u64 {
        self.base_seed
            .wrapping_add(u64::from(generation).wrapping_mul(100))
            .wrapping_add(index as u64)
    }

    /// Evaluation seed of the bred child
    pub fn child_seed(&self, generation: u32) -> u64 {
        self.base_seed.wrapping_mul(2).wrapping_add(u64::from(generation))
    }

    /// Seed of the generator that drives mutation and breeding
    pub fn rng_seed(&self, generation: u32) -> u64 {
        self.base_seed ^ u64::from(generation).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

/// A scored parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub params: ParamSet,
    pub metrics: PerformanceMetrics,
}

/// Outcome of one generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub generation: u32,
    /// The child if it beat the best member, otherwise the best member
    pub winner: CandidateResult,
    pub best_member: CandidateResult,
    pub child: CandidateResult,
    /// Population members plus the child
    pub evaluations: usize,
}

/// Extract the tunable keys of a full parameter record
pub fn param_set(params: &StrategyParameters) -> ParamSet {
    ParamSet::from([
        (ATR_STOP_MULT.to_string(), params.atr_stop_mult),
        (ATR_TAKE_MULT.to_string(), params.atr_take_mult),
        (RISK_PER_TRADE.to_string(), params.risk_per_trade),
    ])
}

/// Overlay a parameter set on a full record; unknown keys are ignored
pub fn apply_param_set(base: &StrategyParameters, set: &ParamSet) -> StrategyParameters {
    let mut params = base.clone();
    if let Some(&v) = set.get(ATR_STOP_MULT) {
        params.atr_stop_mult = v;
    }
    if let Some(&v) = set.get(ATR_TAKE_MULT) {
        params.atr_take_mult = v;
    }
    if let Some(&v) = set.get(RISK_PER_TRADE) {
        params.risk_per_trade = v;
    }
    params
}

fn clamp_or_floor(value: f64, (lo, hi): (f64, f64)) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

/// Multiply each tunable key by `1 + N(0, scale)` and clamp to its bounds
pub fn mutate<R: Rng + ?Sized>(params: &ParamSet, scale: f64, rng: &mut R) -> ParamSet {
    let mut out = params.clone();
    for key in TUNABLE_KEYS {
        let value = params.get(key).copied().unwrap_or(MISSING_VALUE);
        let draw: f64 = rng.sample(StandardNormal);
        let perturbed = value * (1.0 + draw * scale);
        let bounds = if key == RISK_PER_TRADE { RISK_BOUNDS } else { ATR_MULT_BOUNDS };
        out.insert(key.to_string(), clamp_or_floor(perturbed, bounds));
    }
    out
}

/// Uniform crossover over the union of both parents' keys.
/// Every value is copied unchanged from one parent.
pub fn breed<R: Rng + ?Sized>(a: &ParamSet, b: &ParamSet, rng: &mut R) -> ParamSet {
    let mut child = ParamSet::new();
    for key in a.keys().chain(b.keys()) {
        if child.contains_key(key) {
            continue;
        }
        let (first, second) = if rng.gen_bool(0.5) { (a, b) } else { (b, a) };
        if let Some(&value) = first.get(key).or_else(|| second.get(key)) {
            child.insert(key.clone(), value);
        }
    }
    child
}

/// Stable ascending sort by (sharpe, -|max drawdown|): the best candidate ends up last
pub fn rank_candidates(candidates: &mut [CandidateResult]) {
    candidates.sort_by(|x, y| {
        x.metrics
            .sharpe
            .total_cmp(&y.metrics.sharpe)
            .then_with(|| (-x.metrics.max_drawdown.abs()).total_cmp(&-y.metrics.max_drawdown.abs()))
    });
}

/// Deterministic SHA-256 fingerprint of a parameter set
pub fn params_fingerprint(params: &ParamSet) -> String {
    let json = serde_json::to_string(params).unwrap_or_default();
    format!("{:x}", Sha256::digest(json.as_bytes()))
}

/// Score `params` layered over `base` on the series the source yields for `seed`
pub fn evaluate_candidate(
    base: &StrategyParameters,
    params: &ParamSet,
    source: &dyn BarSource,
    seed: u64,
    periods_per_year: f64,
) -> Result<CandidateResult, IndicatorError> {
    let full = apply_param_set(base, params);
    let bars = source.bars(seed);
    let result = BacktestEngine::run(&SimulationConfig::from_params(&full), &bars)?;
    let metrics = compute_metrics(&result.equity_values(), periods_per_year);

    debug!(
        seed,
        sharpe = metrics.sharpe,
        max_drawdown = metrics.max_drawdown,
        trades = result.trades.len(),
        "Evaluated candidate"
    );

    Ok(CandidateResult {
        params: params.clone(),
        metrics,
    })
}

/// Run one generation from `parent`
pub fn evolve_generation(
    parent: &StrategyParameters,
    generation: u32,
    settings: &EvolutionSettings,
    source: &dyn BarSource,
) -> Result<GenerationResult, EvolutionError> {
    let mut rng = StdRng::seed_from_u64(settings.rng_seed(generation));
    let parent_set = param_set(parent);

    let mutants = settings.population.saturating_sub(1).max(1);
    let mut population = Vec::with_capacity(mutants + 1);
    population.push(parent_set.clone());
    for _ in 0..mutants {
        population.push(mutate(&parent_set, settings.population_scale, &mut rng));
    }

    let mut scored = population
        .iter()
        .enumerate()
        .map(|(i, params)| {
            evaluate_candidate(
                parent,
                params,
                source,
                settings.member_seed(generation, i),
                settings.periods_per_year,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    rank_candidates(&mut scored);

    let evaluations = scored.len() + 1;
    let best = scored.pop().ok_or(EvolutionError::EmptyPopulation)?;
    let runner_up = scored.pop().unwrap_or_else(|| best.clone());

    let bred = breed(&best.params, &runner_up.params, &mut rng);
    let child_params = mutate(&bred, settings.child_scale, &mut rng);
    let child = evaluate_candidate(
        parent,
        &child_params,
        source,
        settings.child_seed(generation),
        settings.periods_per_year,
    )?;

    let winner = if child.metrics.sharpe > best.metrics.sharpe {
        child.clone()
    } else {
        best.clone()
    };

    info!(
        generation,
        best_sharpe = best.metrics.sharpe,
        child_sharpe = child.metrics.sharpe,
        winner_sharpe = winner.metrics.sharpe,
        "Generation complete"
    );

    Ok(GenerationResult {
        generation,
        winner,
        best_member: best,
        child,
        evaluations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::RandomWalkSource;

    fn candidate(sharpe: f64, max_drawdown: f64, tag: f64) -> CandidateResult {
        CandidateResult {
            params: ParamSet::from([("tag".to_string(), tag)]),
            metrics: PerformanceMetrics {
                sharpe,
                max_drawdown,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_mutation_stays_in_bounds() {
        let extremes = [0.0, -5.0, 1e9, f64::NAN, f64::INFINITY];
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            for &v in &extremes {
                let params = ParamSet::from([
                    (ATR_STOP_MULT.to_string(), v),
                    (ATR_TAKE_MULT.to_string(), v),
                    (RISK_PER_TRADE.to_string(), v),
                ]);
                let out = mutate(&params, 5.0, &mut rng);
                let risk = out[RISK_PER_TRADE];
                assert!((RISK_BOUNDS.0..=RISK_BOUNDS.1).contains(&risk), "risk {risk}");
                for key in [ATR_STOP_MULT, ATR_TAKE_MULT] {
                    assert!((ATR_MULT_BOUNDS.0..=ATR_MULT_BOUNDS.1).contains(&out[key]));
                }
            }
        }
    }

    #[test]
    fn test_mutation_fills_missing_keys() {
        let mut rng = StdRng::seed_from_u64(1);
        let out = mutate(&ParamSet::new(), 0.0, &mut rng);
        assert_eq!(out[ATR_STOP_MULT], 1.0);
        assert_eq!(out[RISK_PER_TRADE], RISK_BOUNDS.1);
    }

    #[test]
    fn test_breed_takes_union_without_interpolation() {
        let a = ParamSet::from([("x".to_string(), 1.0), ("y".to_string(), 2.0)]);
        let b = ParamSet::from([("y".to_string(), 20.0), ("z".to_string(), 30.0)]);

        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let child = breed(&a, &b, &mut rng);
            assert_eq!(child.keys().collect::<Vec<_>>(), vec!["x", "y", "z"]);
            assert_eq!(child["x"], 1.0);
            assert_eq!(child["z"], 30.0);
            assert!(child["y"] == 2.0 || child["y"] == 20.0);
        }
    }

    #[test]
    fn test_rank_breaks_ties_on_drawdown() {
        let mut candidates = vec![
            candidate(1.0, -0.10, 1.0),
            candidate(2.0, -0.30, 2.0),
            candidate(2.0, -0.05, 3.0),
            candidate(0.5, 0.0, 4.0),
        ];
        rank_candidates(&mut candidates);
        let order: Vec<f64> = candidates.iter().map(|c| c.params["tag"]).collect();
        assert_eq!(order, vec![4.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_rank_is_stable_for_full_ties() {
        let mut candidates = vec![candidate(1.0, -0.1, 1.0), candidate(1.0, -0.1, 2.0)];
        rank_candidates(&mut candidates);
        assert_eq!(candidates[1].params["tag"], 2.0);
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let mut a = ParamSet::new();
        a.insert("b".into(), 2.0);
        a.insert("a".into(), 1.0);
        let b = ParamSet::from([("a".to_string(), 1.0), ("b".to_string(), 2.0)]);
        assert_eq!(params_fingerprint(&a), params_fingerprint(&b));
        assert_eq!(params_fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_apply_param_set_overlays_tunables() {
        let base = StrategyParameters::default();
        let set = ParamSet::from([(RISK_PER_TRADE.to_string(), 0.02), ("unknown".to_string(), 9.0)]);
        let applied = apply_param_set(&base, &set);
        assert_eq!(applied.risk_per_trade, 0.02);
        assert_eq!(applied.atr_stop_mult, base.atr_stop_mult);
        assert_eq!(param_set(&applied)[RISK_PER_TRADE], 0.02);
    }

    #[test]
    fn test_seed_derivation() {
        let settings = EvolutionSettings::default();
        assert_eq!(settings.member_seed(0, 0), 42);
        assert_eq!(settings.member_seed(1, 3), 145);
        assert_eq!(settings.child_seed(1), 85);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let source = RandomWalkSource { len: 200, base_price: 100.0 };
        let settings = EvolutionSettings {
            population: 4,
            ..Default::default()
        };
        let parent = StrategyParameters::default();

        let first = evolve_generation(&parent, 0, &settings, &source).unwrap();
        let second = evolve_generation(&parent, 0, &settings, &source).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.evaluations, 5);
        assert!(first.winner.metrics.sharpe >= first.best_member.metrics.sharpe);
        assert_eq!(first.winner.metrics.sample_len, 199);
    }

    #[test]
    fn test_population_of_one_still_breeds() {
        let source = RandomWalkSource { len: 120, base_price: 100.0 };
        let settings = EvolutionSettings {
            population: 1,
            ..Default::default()
        };
        let result = evolve_generation(&StrategyParameters::default(), 2, &settings, &source).unwrap();
        // Parent plus one mutant, plus the child
        assert_eq!(result.evaluations, 3);
    }
}
