use crate::coverage::{Classification, GlobalCoverage};
use crate::input::content_id;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Multiplicative decay applied to an entry's weight each time it is
/// scheduled, so recently productive entries outcompete exhausted ones.
const WEIGHT_DECAY: f64 = 0.995;
const MIN_WEIGHT: f64 = 1e-4;

/// Errors arising from corpus operations, covering both I/O against the
/// on-disk store and index (de)serialization.
#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("corpus I/O error: {0}")]
    Io(String),

    #[error("corpus index error: {0}")]
    Index(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Index(err.to_string())
    }
}

/// A retained input plus the metadata the scheduler and the coverage rebuild
/// need. Entries are append-only; only `weight` and `exec_count` change after
/// admission.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    /// Content hash; also the on-disk file name.
    pub id: String,
    pub input: Vec<u8>,
    /// Sparse coverage signature (set bit indices) of the execution that
    /// earned admission.
    pub signature: Vec<u32>,
    pub verdict: i32,
    /// Scheduling priority; favors small, high-yield, recently admitted
    /// entries.
    pub weight: f64,
    /// How often this entry has been picked as a mutation seed.
    pub exec_count: u64,
    /// Which mutation chain produced it; diagnostics only.
    pub parentage: String,
}

/// What the index file stores per entry; the input bytes live in their own
/// content-addressed file beside it.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct PersistedEntry {
    id: String,
    signature: Vec<u32>,
    verdict: i32,
    weight: f64,
    exec_count: u64,
    parentage: String,
}

/// The set of retained inputs, their signatures and scheduling weights.
///
/// With a backing directory every admission writes the input file and
/// rewrites the JSON index, so a campaign survives restarts; without one the
/// corpus is memory-only (workers mirroring a coordinator, tests).
pub struct Corpus {
    entries: Vec<CorpusEntry>,
    by_id: HashMap<String, usize>,
    dir: Option<PathBuf>,
}

impl Corpus {
    const INDEX_FILENAME: &'static str = "corpus_index.json";

    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
            dir: None,
        }
    }

    /// Opens (or creates) an on-disk corpus at `dir`, loading every entry
    /// recorded in the index. Entries whose input file has gone missing are
    /// skipped with a warning rather than failing the whole load.
    pub fn open(dir: &Path) -> Result<Self, CorpusError> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        } else if !dir.is_dir() {
            return Err(CorpusError::Io(format!(
                "corpus path {dir:?} exists but is not a directory"
            )));
        }

        let mut corpus = Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
            dir: Some(dir.to_path_buf()),
        };

        let index_path = dir.join(Self::INDEX_FILENAME);
        if index_path.is_file() {
            let reader = BufReader::new(File::open(&index_path)?);
            let persisted: Vec<PersistedEntry> = serde_json::from_reader(reader)?;
            for entry in persisted {
                let input_path = dir.join(&entry.id);
                let input = match fs::read(&input_path) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        eprintln!("corpus: skipping {:?}: {err}", input_path);
                        continue;
                    }
                };
                let index = corpus.entries.len();
                corpus.by_id.insert(entry.id.clone(), index);
                corpus.entries.push(CorpusEntry {
                    id: entry.id,
                    input,
                    signature: entry.signature,
                    verdict: entry.verdict,
                    weight: entry.weight,
                    exec_count: entry.exec_count,
                    parentage: entry.parentage,
                });
            }
        }
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CorpusEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CorpusEntry> {
        self.entries.iter()
    }

    pub fn contains_input(&self, input: &[u8]) -> bool {
        self.by_id.contains_key(&content_id(input))
    }

    /// Creates an entry for a candidate already judged novel by the coverage
    /// model. Returns `None` without side effects when the classification is
    /// not novel or the exact bytes are already present (the same input can
    /// race in from two lanes).
    ///
    /// The initial weight is proportional to the credited new bits and
    /// inversely related to input size.
    pub fn admit(
        &mut self,
        input: Vec<u8>,
        classification: &Classification,
        verdict: i32,
        parentage: &str,
    ) -> Result<Option<usize>, CorpusError> {
        if !classification.is_novel {
            return Ok(None);
        }
        let id = content_id(&input);
        if self.by_id.contains_key(&id) {
            return Ok(None);
        }

        let weight = initial_weight(classification.credited_bits(), input.len());
        let entry = CorpusEntry {
            id: id.clone(),
            input,
            signature: classification.new_bits.bits(),
            verdict,
            weight,
            exec_count: 0,
            parentage: parentage.to_string(),
        };

        if let Some(dir) = &self.dir {
            fs::write(dir.join(&id), &entry.input)?;
        }
        let index = self.entries.len();
        self.by_id.insert(id, index);
        self.entries.push(entry);
        self.save_index()?;
        Ok(Some(index))
    }

    /// Weighted seed selection: draws with probability proportional to
    /// weight, then charges the chosen entry (bumps its execution count and
    /// decays its weight) so the schedule keeps rotating.
    pub fn select_seed<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<&CorpusEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let total: f64 = self.entries.iter().map(|e| e.weight).sum();
        let mut roll = rng.random::<f64>() * total;
        let mut chosen = self.entries.len() - 1;
        for (index, entry) in self.entries.iter().enumerate() {
            if roll < entry.weight {
                chosen = index;
                break;
            }
            roll -= entry.weight;
        }
        let entry = &mut self.entries[chosen];
        entry.exec_count += 1;
        entry.weight = (entry.weight * WEIGHT_DECAY).max(MIN_WEIGHT);
        Some(&self.entries[chosen])
    }

    /// Uniform pick used as the second parent for splicing.
    pub fn random_donor<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&CorpusEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.entries.len());
        self.entries.get(index)
    }

    /// Rebuilds the global accumulator as the union of all persisted entry
    /// signatures, restoring the campaign's coverage state after a restart.
    pub fn rebuild_coverage(&self, coverage: &GlobalCoverage) {
        for entry in &self.entries {
            coverage.absorb_bits(&entry.signature);
        }
    }

    /// Flushes the index (weights and execution counts included). Admission
    /// already persists eagerly; this exists so schedule state survives
    /// restarts without paying a disk write per selection.
    pub fn checkpoint(&self) -> Result<(), CorpusError> {
        self.save_index()
    }

    fn save_index(&self) -> Result<(), CorpusError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let persisted: Vec<PersistedEntry> = self
            .entries
            .iter()
            .map(|e| PersistedEntry {
                id: e.id.clone(),
                signature: e.signature.clone(),
                verdict: e.verdict,
                weight: e.weight,
                exec_count: e.exec_count,
                parentage: e.parentage.clone(),
            })
            .collect();
        let writer = BufWriter::new(File::create(dir.join(Self::INDEX_FILENAME))?);
        serde_json::to_writer_pretty(writer, &persisted)?;
        Ok(())
    }
}

fn initial_weight(new_bits: u32, input_len: usize) -> f64 {
    (1.0 + f64::from(new_bits)) / (input_len as f64 + 16.0).sqrt()
}

/// Shrinks an input via chunk-removal passes while `still_interesting` keeps
/// holding (same fault signature, or same new coverage bits, per the
/// caller's predicate). Each predicate call costs one target execution, so
/// the whole pass is bounded by `max_executions`. Never run on the hot path.
pub fn minimize<F>(seed: &[u8], mut still_interesting: F, max_executions: usize) -> Vec<u8>
where
    F: FnMut(&[u8]) -> bool,
{
    let mut best = seed.to_vec();
    let mut budget = max_executions;
    let mut chunk = best.len() / 2;
    while chunk > 0 && budget > 0 {
        let mut offset = 0;
        while offset < best.len() && budget > 0 {
            let end = (offset + chunk).min(best.len());
            let mut candidate = best.clone();
            candidate.drain(offset..end);
            budget -= 1;
            if still_interesting(&candidate) {
                best = candidate;
            } else {
                offset += chunk;
            }
        }
        chunk /= 2;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoverageSample, GlobalCoverage};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    fn classify_fresh(coverage: &GlobalCoverage, sites: &[u64]) -> Classification {
        let counters: Vec<(u64, u32)> = sites.iter().map(|&s| (s, 1)).collect();
        coverage.classify(&CoverageSample::from_counters(&counters))
    }

    #[test]
    fn only_novel_classifications_are_admitted() {
        let coverage = GlobalCoverage::new();
        let mut corpus = Corpus::in_memory();

        let novel = classify_fresh(&coverage, &[1, 2]);
        assert!(corpus.admit(vec![1], &novel, 1, "seed").unwrap().is_some());

        let stale = classify_fresh(&coverage, &[1, 2]);
        assert!(corpus.admit(vec![2], &stale, 1, "seed").unwrap().is_none());
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn identical_bytes_are_admitted_once() {
        let coverage = GlobalCoverage::new();
        let mut corpus = Corpus::in_memory();

        let first = classify_fresh(&coverage, &[1]);
        assert!(corpus.admit(vec![9, 9], &first, 1, "a").unwrap().is_some());
        let second = classify_fresh(&coverage, &[2]);
        assert!(corpus.admit(vec![9, 9], &second, 1, "b").unwrap().is_none());
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn seed_selection_favors_high_yield_small_entries() {
        let coverage = GlobalCoverage::new();
        let mut corpus = Corpus::in_memory();
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);

        // Small entry with many credited bits vs large entry with one bit.
        let rich = classify_fresh(&coverage, &(100..140).collect::<Vec<u64>>());
        corpus.admit(vec![1, 2, 3], &rich, 1, "rich").unwrap();
        let poor = classify_fresh(&coverage, &[999]);
        corpus.admit(vec![0u8; 4096], &poor, 1, "poor").unwrap();

        let mut rich_picks = 0;
        for _ in 0..500 {
            if corpus.select_seed(&mut rng).unwrap().parentage == "rich" {
                rich_picks += 1;
            }
        }
        assert!(
            rich_picks > 400,
            "rich entry picked only {rich_picks}/500 times"
        );
    }

    #[test]
    fn selection_decays_weight_and_counts_executions() {
        let coverage = GlobalCoverage::new();
        let mut corpus = Corpus::in_memory();
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);

        let novel = classify_fresh(&coverage, &[7]);
        corpus.admit(vec![7], &novel, 1, "only").unwrap();
        let before = corpus.get(0).unwrap().weight;
        for _ in 0..10 {
            corpus.select_seed(&mut rng).unwrap();
        }
        let after = corpus.get(0).unwrap();
        assert!(after.weight < before);
        assert_eq!(after.exec_count, 10);
    }

    #[test]
    fn on_disk_corpus_round_trips_and_rebuilds_coverage() {
        let dir = tempdir().unwrap();
        let coverage = GlobalCoverage::new();

        {
            let mut corpus = Corpus::open(dir.path()).unwrap();
            let a = classify_fresh(&coverage, &[10, 11]);
            corpus.admit(b"alpha".to_vec(), &a, 1, "m1").unwrap();
            let b = classify_fresh(&coverage, &[12]);
            corpus.admit(b"beta".to_vec(), &b, 0, "m2").unwrap();
        }

        let reloaded = Corpus::open(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains_input(b"alpha"));
        assert!(reloaded.contains_input(b"beta"));
        assert_eq!(reloaded.get(1).unwrap().verdict, 0);

        let rebuilt = GlobalCoverage::new();
        reloaded.rebuild_coverage(&rebuilt);
        assert_eq!(rebuilt.snapshot(), coverage.snapshot());
    }

    #[test]
    fn rejected_verdict_inputs_are_still_admissible() {
        let coverage = GlobalCoverage::new();
        let mut corpus = Corpus::in_memory();
        let novel = classify_fresh(&coverage, &[55]);
        // Verdict 0 (target rejected the input) must not block admission.
        assert!(corpus.admit(vec![5], &novel, 0, "m").unwrap().is_some());
    }

    #[test]
    fn minimize_shrinks_while_preserving_the_property() {
        let mut seed = vec![0u8; 200];
        seed[80..84].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let has_magic =
            |bytes: &[u8]| bytes.windows(4).any(|w| w == [0xDE, 0xAD, 0xBE, 0xEF]);
        let minimized = minimize(&seed, has_magic, 10_000);

        assert!(has_magic(&minimized), "minimization changed the finding");
        assert_eq!(minimized.len(), 4, "chunk removal should reach the core");
    }

    #[test]
    fn minimize_respects_its_execution_budget() {
        let seed = vec![1u8; 1024];
        let mut calls = 0usize;
        let _ = minimize(
            &seed,
            |_| {
                calls += 1;
                false
            },
            37,
        );
        assert_eq!(calls, 37);
    }

    #[test]
    fn minimize_of_uninteresting_input_returns_it_unchanged() {
        let seed = vec![1, 2, 3, 4];
        let out = minimize(&seed, |_| false, 100);
        assert_eq!(out, seed);
    }
}
