// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It exists to build reproducible input batches for tests, property loops and benches.

use crate::pattern::{Activation, Pattern};

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform in [0, 1) with 53 bits of precision.
    #[inline]
    pub fn next_f64_01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    #[inline]
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64_01()
    }

    /// One pattern with entries uniform in [0, 1).
    pub fn pattern(&mut self, dimension: usize) -> Pattern {
        let values: Vec<Activation> = (0..dimension).map(|_| self.next_f64_01()).collect();
        Pattern::new(values)
    }

    /// `batch_size` patterns of the same dimension.
    pub fn batch(&mut self, batch_size: usize, dimension: usize) -> Vec<Pattern> {
        (0..batch_size).map(|_| self.pattern(dimension)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let a = Prng::new(7).batch(4, 9);
        let b = Prng::new(7).batch(4, 9);
        assert_eq!(a, b);
        assert_ne!(a, Prng::new(8).batch(4, 9));
    }

    #[test]
    fn unit_interval() {
        let mut rng = Prng::new(0);
        for _ in 0..1000 {
            let x = rng.next_f64_01();
            assert!((0.0..1.0).contains(&x));
        }
    }
}
