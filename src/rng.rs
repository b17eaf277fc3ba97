use crate::config::RngKind;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

/// Source of the random permutations that order node visits and candidate modules.
pub trait TrialRng {
    /// Fills `out` with a uniformly shuffled permutation of `0..out.len()`.
    fn randomized_index_vector(&mut self, out: &mut [u32]);
}

const MT_N: usize = 624;
const MT_M: usize = 397;

/// 32-bit Mersenne twister. Bounded draws follow libc++'s
/// `uniform_int_distribution`, so shuffles line up with the reference tool.
#[derive(Debug, Clone)]
pub struct Mt19937 {
    state: [u32; MT_N],
    index: usize,
}

impl Mt19937 {
    pub fn new(seed: u32) -> Self {
        let mut state = [0u32; MT_N];
        state[0] = seed;
        for i in 1..MT_N {
            let prev = state[i - 1];
            state[i] = 1_812_433_253u32
                .wrapping_mul(prev ^ (prev >> 30))
                .wrapping_add(i as u32);
        }
        Self {
            state,
            index: MT_N,
        }
    }

    fn regenerate(&mut self) {
        const UPPER: u32 = 0x8000_0000;
        const LOWER: u32 = 0x7fff_ffff;
        let mix = |hi: u32, lo: u32, far: u32| {
            let y = (hi & UPPER) | (lo & LOWER);
            far ^ (y >> 1) ^ if y & 1 == 1 { 0x9908_b0df } else { 0 }
        };
        for i in 0..MT_N {
            self.state[i] = mix(
                self.state[i],
                self.state[(i + 1) % MT_N],
                self.state[(i + MT_M) % MT_N],
            );
        }
        self.index = 0;
    }

    /// Uniform draw in `0..=max`: mask to the bit width of `max`, reject above.
    pub fn uniform_inclusive(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        let mask = u32::MAX >> max.leading_zeros();
        loop {
            let draw = self.next_u32() & mask;
            if draw <= max {
                return draw;
            }
        }
    }
}

impl RngCore for Mt19937 {
    fn next_u32(&mut self) -> u32 {
        if self.index >= MT_N {
            self.regenerate();
        }
        let mut y = self.state[self.index];
        self.index += 1;
        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^ (y >> 18)
    }

    fn next_u64(&mut self) -> u64 {
        let lo = u64::from(self.next_u32());
        let hi = u64::from(self.next_u32());
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl TrialRng for Mt19937 {
    fn randomized_index_vector(&mut self, out: &mut [u32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = i as u32;
        }
        let size = out.len();
        for i in 0..size {
            let j = i + self.uniform_inclusive((size - i - 1) as u32) as usize;
            out.swap(i, j);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmallTrialRng {
    rng: SmallRng,
}

impl SmallTrialRng {
    pub fn new(seed: u32) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(u64::from(seed)),
        }
    }
}

impl TrialRng for SmallTrialRng {
    fn randomized_index_vector(&mut self, out: &mut [u32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = i as u32;
        }
        let size = out.len();
        for i in 0..size {
            let j = self.rng.gen_range(i..size);
            out.swap(i, j);
        }
    }
}

/// The stream a trial draws from, chosen by [`RngKind`].
#[derive(Debug, Clone)]
pub enum TrialStream {
    Small(SmallTrialRng),
    Mt19937(Box<Mt19937>),
}

impl TrialStream {
    pub fn new(kind: RngKind, seed: u32) -> Self {
        match kind {
            RngKind::Small => TrialStream::Small(SmallTrialRng::new(seed)),
            RngKind::Mt19937 => TrialStream::Mt19937(Box::new(Mt19937::new(seed))),
        }
    }
}

impl TrialRng for TrialStream {
    #[inline]
    fn randomized_index_vector(&mut self, out: &mut [u32]) {
        match self {
            TrialStream::Small(rng) => rng.randomized_index_vector(out),
            TrialStream::Mt19937(rng) => rng.randomized_index_vector(out),
        }
    }
}

/// Seed of trial `trial_index`; trial 0 runs on the base seed itself.
#[inline]
pub fn seed_for_trial(base_seed: u32, trial_index: u32) -> u32 {
    if trial_index == 0 {
        return base_seed;
    }

    // SplitMix64 finalizer over (seed, trial).
    let mut z = u64::from(base_seed) ^ u64::from(trial_index).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    (z ^ (z >> 31)) as u32
}
