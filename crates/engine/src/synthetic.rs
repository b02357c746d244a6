//! Bar sources for candidate evaluation
//!
//! The search only needs "give me a series for this seed". The default source
//! is a seeded Gaussian random walk; a fixed series can be plugged in instead.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::types::Bar;

/// Produces a deterministic bar series for a seed
pub trait BarSource: Send + Sync {
    fn bars(&self, seed: u64) -> Vec<Bar>;
}

/// Gaussian random walk around a base price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomWalkSource {
    pub len: usize,
    pub base_price: f64,
}

impl Default for RandomWalkSource {
    fn default() -> Self {
        Self {
            len: 800,
            base_price: 100.0,
        }
    }
}

impl BarSource for RandomWalkSource {
    fn bars(&self, seed: u64) -> Vec<Bar> {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut level = 0.0;
        let closes: Vec<f64> = (0..self.len)
            .map(|_| {
                let step: f64 = rng.sample(StandardNormal);
                level += step;
                self.base_price + level
            })
            .collect();

        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let high = close + rng.gen_range(0.0..1.0);
                let low = close - rng.gen_range(0.0..1.0);
                let open = if i == 0 { close } else { closes[i - 1] };
                let volume = rng.gen_range(100..200) as f64;
                Bar::new(open, high, low, close, volume)
            })
            .collect()
    }
}

/// The same series for every seed (held-out data, fixtures)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticSource(pub Vec<Bar>);

impl BarSource for StaticSource {
    fn bars(&self, _seed: u64) -> Vec<Bar> {
        self.0.clone()
    }
}
