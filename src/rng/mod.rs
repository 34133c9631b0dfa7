//! Injectable uniform random sources
//!
//! Randomized residuals draw one uniform per matrix entry. Generation goes
//! through [`UniformSource`] so callers can substitute their own generator,
//! and through [`StreamFactory`] so every block gets an independent stream
//! that depends only on the seed and the block index. Results are therefore
//! reproducible regardless of how blocks are scheduled across threads.

/// A source of uniform draws on the open interval (0, 1)
pub trait UniformSource {
    fn next_uniform(&mut self) -> f64;
}

impl<F> UniformSource for F
where
    F: FnMut() -> f64,
{
    fn next_uniform(&mut self) -> f64 {
        self()
    }
}

/// Hands out one uniform stream per block
pub trait StreamFactory: Sync {
    fn stream(&self, block_index: usize) -> Box<dyn UniformSource + Send>;
}

impl<F> StreamFactory for F
where
    F: Fn(usize) -> Box<dyn UniformSource + Send> + Sync,
{
    fn stream(&self, block_index: usize) -> Box<dyn UniformSource + Send> {
        self(block_index)
    }
}

/// Default seed used by the command line
pub const DEFAULT_SEED: u64 = 42;

/// Mersenne Twister streams derived from one seed
///
/// The stream for block `b` is seeded with a SplitMix64 mix of `(seed, b)`,
/// so a fixed seed reproduces the same residuals for the same block layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededStreams {
    pub seed: u64,
}

impl SeededStreams {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn block_seed(&self, block_index: usize) -> u32 {
        let mixed = splitmix64(self.seed ^ splitmix64(block_index as u64));
        (mixed >> 32) as u32
    }
}

impl Default for SeededStreams {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl StreamFactory for SeededStreams {
    fn stream(&self, block_index: usize) -> Box<dyn UniformSource + Send> {
        Box::new(RMersenneTwister::new(self.block_seed(block_index)))
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Mersenne Twister with R's `set.seed()` initialization
///
/// The state is filled from a 69069 LCG the way R's RNG.c does it, so a
/// given 32-bit seed yields the same uniforms as `set.seed(seed); runif()`.
#[derive(Clone)]
pub struct RMersenneTwister {
    state: [u32; 624],
    index: usize,
}

impl RMersenneTwister {
    const N: usize = 624;
    const M: usize = 397;
    const MATRIX_A: u32 = 0x9908B0DF;
    const UPPER_MASK: u32 = 0x80000000;
    const LOWER_MASK: u32 = 0x7FFFFFFF;
    const I2_32M1: f64 = 2.3283064365386963e-10;

    pub fn new(seed: u32) -> Self {
        let mut mt = RMersenneTwister {
            state: [0; Self::N],
            index: Self::N,
        };
        mt.seed_state(seed);
        mt
    }

    // 50 warm-up LCG steps plus one discarded value, then 624 state words
    fn seed_state(&mut self, seed: u32) {
        let mut lcg: u32 = seed;
        for _ in 0..51 {
            lcg = lcg.wrapping_mul(69069).wrapping_add(1);
        }
        for word in self.state.iter_mut() {
            lcg = lcg.wrapping_mul(69069).wrapping_add(1);
            *word = lcg;
        }
        self.index = Self::N;
    }

    fn twist(&mut self) {
        for i in 0..Self::N {
            let y = (self.state[i] & Self::UPPER_MASK)
                | (self.state[(i + 1) % Self::N] & Self::LOWER_MASK);
            self.state[i] = self.state[(i + Self::M) % Self::N] ^ (y >> 1);
            if y & 1 != 0 {
                self.state[i] ^= Self::MATRIX_A;
            }
        }
        self.index = 0;
    }

    fn next_u32(&mut self) -> u32 {
        if self.index >= Self::N {
            self.twist();
        }

        let mut y = self.state[self.index];
        self.index += 1;

        y ^= y >> 11;
        y ^= (y << 7) & 0x9D2C5680;
        y ^= (y << 15) & 0xEFC60000;
        y ^= y >> 18;
        y
    }

    /// Uniform draw in (0, 1); exact 0 and 1 are nudged inward like R's fixup
    pub fn runif(&mut self) -> f64 {
        let u = self.next_u32() as f64 * Self::I2_32M1;
        if u <= 0.0 {
            0.5 * Self::I2_32M1
        } else if u >= 1.0 {
            1.0 - 0.5 * Self::I2_32M1
        } else {
            u
        }
    }
}

impl UniformSource for RMersenneTwister {
    fn next_uniform(&mut self) -> f64 {
        self.runif()
    }
}
