//! # Random Sources
//!
//! Entropy for address-space randomization. The page table only ever asks
//! for a value in an inclusive range, so sources are easy to replace with
//! deterministic ones.

use spin::Mutex;

/// Random number source
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[min, max]`
    fn generate_random_range(&self, min: u64, max: u64) -> u64;
}

/// Seeded xorshift64* generator
#[derive(Debug)]
pub struct XorShiftRandom {
    state: Mutex<u64>,
}

impl XorShiftRandom {
    /// Create a generator from a seed (zero is remapped)
    pub const fn new(seed: u64) -> Self {
        let seed = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self {
            state: Mutex::new(seed),
        }
    }

    fn next_u64(&self) -> u64 {
        let mut state = self.state.lock();
        let mut x = *state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        *state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

impl RandomSource for XorShiftRandom {
    fn generate_random_range(&self, min: u64, max: u64) -> u64 {
        assert!(min <= max, "empty random range [{min}, {max}]");
        let span = max - min;
        if span == u64::MAX {
            return self.next_u64();
        }
        min + self.next_u64() % (span + 1)
    }
}

/// Source that always answers the same value, clamped into the range
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub u64);

impl RandomSource for FixedRandom {
    fn generate_random_range(&self, min: u64, max: u64) -> u64 {
        self.0.clamp(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_in_range() {
        let rng = XorShiftRandom::new(42);
        for _ in 0..1000 {
            let value = rng.generate_random_range(10, 20);
            assert!((10..=20).contains(&value));
        }
        assert_eq!(rng.generate_random_range(7, 7), 7);
    }

    #[test]
    fn test_xorshift_is_deterministic() {
        let a = XorShiftRandom::new(1234);
        let b = XorShiftRandom::new(1234);
        for _ in 0..16 {
            assert_eq!(a.generate_random_range(0, 1 << 20), b.generate_random_range(0, 1 << 20));
        }
    }

    #[test]
    fn test_fixed_clamps() {
        let rng = FixedRandom(100);
        assert_eq!(rng.generate_random_range(0, 50), 50);
        assert_eq!(rng.generate_random_range(0, 500), 100);
        assert_eq!(rng.generate_random_range(200, 500), 200);
    }
}
