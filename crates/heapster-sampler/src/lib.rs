//! Geometric allocation sampler.
//!
//! Every allocation debits its size from a byte budget; when the
//! budget runs out the allocation is sampled and a new budget is drawn
//! from a geometric distribution whose mean is the configured sampling
//! period. The result is one sampling decision per `period` allocated
//! bytes in expectation, independent of allocation rate, and a single
//! large allocation is proportionally more likely to be picked than a
//! small one.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Default sampling period: one sample per 512 KiB allocated, in
/// expectation.
pub const DEFAULT_SAMPLE_PERIOD: u64 = 1 << 19;

pub struct Sampler {
    rng: SmallRng,
    period: u64,
    bytes_until_sample: u64,
}

impl Sampler {
    pub fn new(seed: u64, period: u64) -> Self {
        let mut sampler = Sampler {
            rng: SmallRng::seed_from_u64(seed),
            period: 1,
            bytes_until_sample: 1,
        };
        sampler.init(seed, period);
        sampler
    }

    /// Reset both the PRNG state and the byte budget. Periods below
    /// one byte are clamped to one, which samples every allocation.
    pub fn init(&mut self, seed: u64, period: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
        self.period = period.max(1);
        self.bytes_until_sample = self.pick_next_sampling_point();
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Debit `size` bytes from the budget, returning true when this
    /// allocation should be sampled. Not reentrant; callers hold the
    /// sampler monitor.
    pub fn sample_allocation(&mut self, size: u64) -> bool {
        if size < self.bytes_until_sample {
            self.bytes_until_sample -= size;
            return false;
        }
        self.bytes_until_sample = self.pick_next_sampling_point();
        true
    }

    /// Exponential inter-arrival distances yield a geometric number of
    /// bytes between samples with mean `period`.
    fn pick_next_sampling_point(&mut self) -> u64 {
        let u: f64 = self.rng.gen();
        let distance = -(1.0 - u).ln() * self.period as f64;
        distance as u64 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_of_one_samples_everything() {
        let mut sampler = Sampler::new(0, 1);
        for size in 1..100u64 {
            assert!(sampler.sample_allocation(size));
        }
    }

    #[test]
    fn same_seed_same_decisions() {
        let mut a = Sampler::new(42, 4096);
        let mut b = Sampler::new(42, 4096);
        for size in 1..2000u64 {
            assert_eq!(a.sample_allocation(size), b.sample_allocation(size));
        }
    }

    #[test]
    fn init_resets_the_sequence() {
        let mut sampler = Sampler::new(7, 4096);
        let first: Vec<bool> = (0..500).map(|_| sampler.sample_allocation(64)).collect();
        sampler.init(7, 4096);
        let second: Vec<bool> = (0..500).map(|_| sampler.sample_allocation(64)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn huge_allocation_is_sampled() {
        let mut sampler = Sampler::new(3, DEFAULT_SAMPLE_PERIOD);
        // 100 periods' worth in one allocation overwhelms any budget
        // the seed could plausibly have drawn.
        assert!(sampler.sample_allocation(DEFAULT_SAMPLE_PERIOD * 100));
    }

    #[test]
    fn sample_count_tracks_the_mean() {
        let mut sampler = Sampler::new(12345, DEFAULT_SAMPLE_PERIOD);
        let total = DEFAULT_SAMPLE_PERIOD * 10;
        let mut sampled = 0u64;
        let mut allocated = 0u64;
        while allocated < total {
            if sampler.sample_allocation(8) {
                sampled += 1;
            }
            allocated += 8;
        }
        // Mean is 10; the fixed seed keeps this deterministic, the
        // range leaves room if the PRNG implementation shifts.
        assert!((3..=25).contains(&sampled), "sampled {sampled} times");
    }

    #[test]
    fn period_zero_is_clamped() {
        let mut sampler = Sampler::new(0, 0);
        assert_eq!(sampler.period(), 1);
        assert!(sampler.sample_allocation(1));
    }
}
