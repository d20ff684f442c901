//! Provider selection policy.
//!
//! Selection is a stateless uniform random pick. The random source is
//! injectable so tests can use a seeded generator.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Picks one candidate index
pub trait ProviderSelector: Send + Sync {
    /// Return an index in `0..candidates`; `candidates` is never zero
    fn pick(&self, candidates: usize) -> usize;
}

/// Uniform pick from the thread-local generator
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl ProviderSelector for RandomSelector {
    fn pick(&self, candidates: usize) -> usize {
        rand::thread_rng().gen_range(0..candidates)
    }
}

/// Uniform pick from a seeded generator
#[derive(Debug)]
pub struct SeededSelector {
    rng: Mutex<StdRng>,
}

impl SeededSelector {
    /// Create a selector with a fixed seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl ProviderSelector for SeededSelector {
    fn pick(&self, candidates: usize) -> usize {
        self.rng.lock().gen_range(0..candidates)
    }
}
