use rand::Rng;
use std::collections::HashSet;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Longest dictionary token kept; comparison operands past this are truncated
/// noise rather than useful structure.
pub const MAX_TOKEN_LEN: usize = 64;
/// Dictionary capacity; harvesting stops once full.
pub const MAX_TOKENS: usize = 1024;
/// Upper bound on stacked operators per mutation pass.
pub const MAX_STACKED_OPS: usize = 4;
/// Largest byte run inserted by the plain insertion operator.
const MAX_INSERT_LEN: usize = 16;
/// AFL-style arithmetic perturbation range.
const ARITH_MAX: u64 = 35;

/// Hard cap on candidate size relative to its parent. One mutation pass may
/// grow an input, but never past this bound, so repeated splicing and
/// insertion cannot bloat the corpus without limit.
pub fn size_limit(parent_len: usize) -> usize {
    2 * parent_len + 64
}

/// Token dictionary feeding the dictionary-informed operators.
///
/// Tokens come from two places: a user-supplied file, and operands harvested
/// from comparison operations the instrumented target observed during
/// execution. Both are bounded in count and token length.
#[derive(Debug, Default)]
pub struct Dictionary {
    tokens: Vec<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Adds a token, returning whether it was actually inserted. Empty,
    /// oversized and duplicate tokens are dropped, as is everything once the
    /// dictionary is full.
    pub fn add(&mut self, token: &[u8]) -> bool {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN || self.tokens.len() >= MAX_TOKENS {
            return false;
        }
        if !self.seen.insert(token.to_vec()) {
            return false;
        }
        self.tokens.push(token.to_vec());
        true
    }

    /// Loads user-supplied tokens, one per line. Lines may be raw bytes or a
    /// double-quoted form supporting `\\`, `\"`, `\n`, `\t` and `\xNN`
    /// escapes; blank lines and `#` comments are skipped.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, io::Error> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut loaded = 0;
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let token = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"')
            {
                unescape_token(&trimmed[1..trimmed.len() - 1])
            } else {
                trimmed.as_bytes().to_vec()
            };
            if self.add(&token) {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&[u8]> {
        if self.tokens.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.tokens.len());
        Some(&self.tokens[index])
    }
}

fn unescape_token(quoted: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('x') => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                }
            }
            Some(other) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => {}
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    FlipBit,
    SetByte,
    InsertBytes,
    DeleteBytes,
    DuplicateBlock,
    Arith,
    Splice,
    TokenInsert,
    TokenReplace,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::FlipBit => "flip-bit",
            Op::SetByte => "set-byte",
            Op::InsertBytes => "insert",
            Op::DeleteBytes => "delete",
            Op::DuplicateBlock => "dup",
            Op::Arith => "arith",
            Op::Splice => "splice",
            Op::TokenInsert => "token-insert",
            Op::TokenReplace => "token-replace",
        }
    }
}

/// Operator selection weights. Cheap byte-level operators dominate;
/// structural ones fire less often.
const OP_WEIGHTS: &[(Op, u32)] = &[
    (Op::FlipBit, 6),
    (Op::SetByte, 6),
    (Op::InsertBytes, 3),
    (Op::DeleteBytes, 3),
    (Op::DuplicateBlock, 2),
    (Op::Arith, 5),
    (Op::Splice, 3),
    (Op::TokenInsert, 3),
    (Op::TokenReplace, 2),
];

/// Generates candidate inputs from one corpus entry (plus an optional splice
/// donor) by stacking a small random sequence of byte-level and structural
/// operators. Given the same RNG stream, parent and donor, the output is
/// fully reproducible.
#[derive(Debug, Default)]
pub struct MutationEngine {
    dictionary: Dictionary,
}

impl MutationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dictionary(dictionary: Dictionary) -> Self {
        Self { dictionary }
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn dictionary_mut(&mut self) -> &mut Dictionary {
        &mut self.dictionary
    }

    /// Feeds comparison operands observed during an execution into the
    /// dictionary.
    pub fn harvest(&mut self, tokens: &[Vec<u8>]) {
        for token in tokens {
            self.dictionary.add(token);
        }
    }

    /// Produces exactly one candidate from `parent`, along with a `+`-joined
    /// record of the operators applied (stored as the candidate's parentage
    /// if it gets admitted).
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        parent: &[u8],
        donor: Option<&[u8]>,
        rng: &mut R,
    ) -> (Vec<u8>, String) {
        let limit = size_limit(parent.len());
        let mut data = parent.to_vec();
        if data.is_empty() {
            data.push(0);
        }

        let op_count = rng.random_range(1..=MAX_STACKED_OPS);
        let mut applied = Vec::with_capacity(op_count);
        for _ in 0..op_count {
            let op = self.pick_op(rng, donor.is_some());
            self.apply(op, &mut data, donor, rng);
            applied.push(op.name());
            if data.is_empty() {
                data.push(0);
            }
        }
        data.truncate(limit);
        (data, applied.join("+"))
    }

    fn pick_op<R: Rng + ?Sized>(&self, rng: &mut R, have_donor: bool) -> Op {
        let total: u32 = OP_WEIGHTS.iter().map(|&(_, w)| w).sum();
        loop {
            let mut roll = rng.random_range(0..total);
            let op = OP_WEIGHTS
                .iter()
                .find(|&&(_, w)| {
                    if roll < w {
                        true
                    } else {
                        roll -= w;
                        false
                    }
                })
                .map(|&(op, _)| op)
                .unwrap_or(Op::FlipBit);
            let usable = match op {
                Op::Splice => have_donor,
                Op::TokenInsert | Op::TokenReplace => !self.dictionary.is_empty(),
                _ => true,
            };
            if usable {
                return op;
            }
        }
    }

    fn apply<R: Rng + ?Sized>(&self, op: Op, data: &mut Vec<u8>, donor: Option<&[u8]>, rng: &mut R) {
        match op {
            Op::FlipBit => {
                let index = rng.random_range(0..data.len());
                data[index] ^= 1 << rng.random_range(0..8u32);
            }
            Op::SetByte => {
                let index = rng.random_range(0..data.len());
                data[index] = rng.random::<u8>();
            }
            Op::InsertBytes => {
                let at = rng.random_range(0..=data.len());
                let count = rng.random_range(1..=MAX_INSERT_LEN);
                let fresh: Vec<u8> = (0..count).map(|_| rng.random::<u8>()).collect();
                data.splice(at..at, fresh);
            }
            Op::DeleteBytes => {
                let from = rng.random_range(0..data.len());
                let max_len = (data.len() - from).min((data.len() / 2).max(1));
                let len = rng.random_range(1..=max_len);
                data.drain(from..from + len);
            }
            Op::DuplicateBlock => {
                let from = rng.random_range(0..data.len());
                let to = rng.random_range(from..=data.len().min(from + 32));
                let block = data[from..to].to_vec();
                let at = rng.random_range(0..=data.len());
                data.splice(at..at, block);
            }
            Op::Arith => arith(data, rng),
            Op::Splice => {
                if let Some(donor) = donor.filter(|d| !d.is_empty()) {
                    let d_from = rng.random_range(0..data.len());
                    let d_to = rng.random_range(d_from..=data.len());
                    let s_from = rng.random_range(0..donor.len());
                    let s_to = rng.random_range(s_from..=donor.len());
                    data.splice(d_from..d_to, donor[s_from..s_to].iter().copied());
                }
            }
            Op::TokenInsert => {
                if let Some(token) = self.dictionary.pick(rng) {
                    let at = rng.random_range(0..=data.len());
                    data.splice(at..at, token.to_vec());
                }
            }
            Op::TokenReplace => {
                if let Some(token) = self.dictionary.pick(rng) {
                    let at = rng.random_range(0..data.len());
                    let end = (at + token.len()).min(data.len());
                    data[at..end].copy_from_slice(&token[..end - at]);
                }
            }
        }
    }
}

/// Arithmetic perturbation of an integer-looking byte run: read a 1/2/4-byte
/// value in either byte order, add or subtract a small delta, sometimes write
/// back in the opposite order to mirror byte-order bug classes.
fn arith<R: Rng + ?Sized>(data: &mut [u8], rng: &mut R) {
    let widths: Vec<usize> = [1usize, 2, 4]
        .into_iter()
        .filter(|&w| w <= data.len())
        .collect();
    let width = widths[rng.random_range(0..widths.len())];
    let offset = rng.random_range(0..=data.len() - width);
    let big_endian = rng.random_bool(0.5);

    let mut value: u64 = 0;
    for i in 0..width {
        let byte = u64::from(data[offset + i]);
        value = if big_endian {
            (value << 8) | byte
        } else {
            value | (byte << (8 * i))
        };
    }

    let delta = rng.random_range(1..=ARITH_MAX);
    value = if rng.random_bool(0.5) {
        value.wrapping_add(delta)
    } else {
        value.wrapping_sub(delta)
    };

    let write_big_endian = if rng.random_bool(0.25) {
        !big_endian
    } else {
        big_endian
    };
    for i in 0..width {
        let shift = if write_big_endian {
            8 * (width - 1 - i)
        } else {
            8 * i
        };
        data[offset + i] = (value >> shift) as u8;
    }
}
