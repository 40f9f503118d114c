//! Deterministic RNG used for timer jitter. Not cryptographic.

/// SplitMix64 generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        mix64(self.state)
    }

    /// Uniform in `[0, 1)` from the top 24 bits.
    pub fn next_f32_unit(&mut self) -> f32 {
        let bits = (self.next_u64() >> 40) as u32;
        bits as f32 / (1u32 << 24) as f32
    }

    /// Uniform in `[-deviation, deviation]` around `base`, never below zero.
    pub fn jitter(&mut self, base: f32, deviation: f32) -> f32 {
        if deviation <= 0.0 {
            return base.max(0.0);
        }
        let offset = (self.next_f32_unit() * 2.0 - 1.0) * deviation;
        (base + offset).max(0.0)
    }
}

pub fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
