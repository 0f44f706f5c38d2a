use std::sync::Mutex;

/// Width of the coverage bitmap in bits.
///
/// Every (call-site, hit-count-bucket) pair observed during an execution is
/// hashed into this fixed range, so the feedback signal stays constant-size
/// no matter how large the target is. The status line reports the fill rate;
/// past a few percent the map starts aliasing and loses discriminative power.
pub const MAP_BITS: usize = 1 << 16;

const MAP_WORDS: usize = MAP_BITS / 64;

/// The coverage touched by a single execution, reduced to a fixed-width
/// bitmap. Ephemeral: produced per execution, compared against and then
/// folded into [`GlobalCoverage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageSample {
    words: Vec<u64>,
}

impl CoverageSample {
    pub fn empty() -> Self {
        Self {
            words: vec![0u64; MAP_WORDS],
        }
    }

    /// Builds a sample from the raw counters an instrumented target reports.
    /// Each counter is a (call-site, hit-count) pair; the hit count is first
    /// coarsened into a bucket so loop iteration noise does not register as
    /// novelty, then the pair is hashed into one bitmap bit.
    pub fn from_counters(counters: &[(u64, u32)]) -> Self {
        let mut sample = Self::empty();
        for &(site, count) in counters {
            if count == 0 {
                continue;
            }
            sample.set(Self::bit_for(site, Self::bucket(count)));
        }
        sample
    }

    /// Rebuilds a sample from a sparse list of set bit indices, the form used
    /// for persistence and on the wire.
    pub fn from_bits(bits: &[u32]) -> Self {
        let mut sample = Self::empty();
        for &bit in bits {
            sample.set(bit as usize % MAP_BITS);
        }
        sample
    }

    /// Coarsens a raw hit count into one of eight buckets (1, 2, 3, 4-7,
    /// 8-15, 16-31, 32-127, 128+).
    fn bucket(count: u32) -> u64 {
        match count {
            0 => 0,
            1 => 1,
            2 => 2,
            3 => 3,
            4..=7 => 4,
            8..=15 => 5,
            16..=31 => 6,
            32..=127 => 7,
            _ => 8,
        }
    }

    fn bit_for(site: u64, bucket: u64) -> usize {
        let mixed = site
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .rotate_left(17)
            .wrapping_add(bucket);
        (mixed as usize) % MAP_BITS
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < MAP_BITS);
        self.words[bit / 64] |= 1u64 << (bit % 64);
    }

    pub fn get(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Sparse encoding: the sorted indices of all set bits.
    pub fn bits(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (word_index, &word) in self.words.iter().enumerate() {
            let mut remaining = word;
            while remaining != 0 {
                let low = remaining.trailing_zeros();
                out.push((word_index * 64) as u32 + low);
                remaining &= remaining - 1;
            }
        }
        out
    }

    /// Whether every bit set in `other` is also set here.
    pub fn contains(&self, other: &CoverageSample) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(mine, theirs)| theirs & !mine == 0)
    }

    pub fn union_with(&mut self, other: &CoverageSample) {
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= src;
        }
    }
}

/// The verdict of comparing one sample against the global accumulator.
/// `new_bits` holds exactly the bits this sample contributed, computed under
/// the same lock that merged them, so two concurrent discoveries are never
/// credited for the same bit.
#[derive(Debug)]
pub struct Classification {
    pub is_novel: bool,
    pub new_bits: CoverageSample,
}

impl Classification {
    pub fn credited_bits(&self) -> u32 {
        self.new_bits.count_ones()
    }
}

/// Process-wide coverage accumulator. Bits are only ever set, never cleared,
/// for the lifetime of a campaign; after a restart the accumulator is
/// reconstructed as the union of the persisted corpus signatures.
///
/// `classify` is the single serialized step of the engine. Everything else
/// (mutation, execution) runs lock-free per lane.
pub struct GlobalCoverage {
    seen: Mutex<CoverageSample>,
}

impl GlobalCoverage {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(CoverageSample::empty()),
        }
    }

    /// Compares `sample` against the accumulator and, if any bit is new,
    /// merges the delta in. Compare-and-merge happens under one lock so a
    /// second writer with overlapping bits is credited only for the bits the
    /// first writer did not already claim.
    pub fn classify(&self, sample: &CoverageSample) -> Classification {
        let mut seen = self.seen.lock().unwrap();
        let mut new_bits = CoverageSample::empty();
        let mut is_novel = false;
        for ((new_word, seen_word), sample_word) in new_bits
            .words
            .iter_mut()
            .zip(seen.words.iter_mut())
            .zip(sample.words.iter())
        {
            let delta = sample_word & !*seen_word;
            if delta != 0 {
                is_novel = true;
                *new_word = delta;
                *seen_word |= delta;
            }
        }
        Classification { is_novel, new_bits }
    }

    /// Folds already-credited bits back in without classification; used to
    /// rebuild the accumulator from persisted corpus signatures.
    pub fn absorb_bits(&self, bits: &[u32]) {
        let mut seen = self.seen.lock().unwrap();
        for &bit in bits {
            let bit = bit as usize % MAP_BITS;
            seen.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    pub fn bits_set(&self) -> u32 {
        self.seen.lock().unwrap().count_ones()
    }

    /// Fraction of the bitmap currently set. Values above ~5% mean the map
    /// is saturating and novelty decisions are increasingly aliased.
    pub fn density(&self) -> f64 {
        f64::from(self.bits_set()) / MAP_BITS as f64
    }

    pub fn snapshot(&self) -> CoverageSample {
        self.seen.lock().unwrap().clone()
    }
}

impl Default for GlobalCoverage {
    fn default() -> Self {
        Self::new()
    }
}
