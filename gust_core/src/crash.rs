use bincode::{Decode, Encode};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrashStoreError {
    #[error("crash store I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CrashStoreError {
    fn from(err: std::io::Error) -> Self {
        CrashStoreError::Io(err.to_string())
    }
}

/// A reproducer for one failure class: the input, the normalized signature
/// it deduplicates under, and the failure output captured when it was found.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Crasher {
    pub input: Vec<u8>,
    pub signature: String,
    pub log: String,
}

/// Deduplicated failure archive. One failure class (one signature) maps to
/// one reproducer; thousands of raw crashes collapse into however many
/// distinct classes the target actually has.
///
/// On disk each class is three sibling files named by signature: the raw
/// input, a `.quoted` source-literal rendition for pasting into a
/// regression test, and the `.output` log from the original discovery.
pub struct CrashStore {
    dir: Option<PathBuf>,
    known: HashMap<String, usize>,
}

impl CrashStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            known: HashMap::new(),
        }
    }

    /// Opens (or creates) the archive at `dir` and indexes the classes
    /// already present. Raw reproducer files carry no extension; their
    /// sibling `.quoted` and `.output` files are derived, not indexed.
    pub fn open(dir: &Path) -> Result<Self, CrashStoreError> {
        fs::create_dir_all(dir)?;
        let mut known = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension().is_none() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    let len = entry.metadata()?.len() as usize;
                    known.insert(name.to_string(), len);
                }
            }
        }
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            known,
        })
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.known.contains_key(signature)
    }

    pub fn signatures(&self) -> impl Iterator<Item = &str> {
        self.known.keys().map(String::as_str)
    }

    /// Records a crasher. Returns `true` when its signature names a class
    /// not seen before. A repeat of a known class is dropped unless its
    /// input is strictly smaller, in which case the stored reproducer is
    /// replaced but the original discovery log is kept.
    pub fn report(&mut self, crasher: &Crasher) -> Result<bool, CrashStoreError> {
        match self.known.get(&crasher.signature) {
            None => {
                self.write_class(crasher, true)?;
                self.known
                    .insert(crasher.signature.clone(), crasher.input.len());
                Ok(true)
            }
            Some(&stored_len) if crasher.input.len() < stored_len => {
                self.write_class(crasher, false)?;
                self.known
                    .insert(crasher.signature.clone(), crasher.input.len());
                Ok(false)
            }
            Some(_) => Ok(false),
        }
    }

    fn write_class(&self, crasher: &Crasher, with_output: bool) -> Result<(), CrashStoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let raw = dir.join(&crasher.signature);
        fs::write(&raw, &crasher.input)?;
        fs::write(raw.with_extension("quoted"), quote_bytes(&crasher.input))?;
        if with_output {
            fs::write(raw.with_extension("output"), &crasher.log)?;
        }
        Ok(())
    }
}

/// Renders bytes as a Rust byte-string literal, printable ASCII kept
/// verbatim and everything else hex-escaped.
pub fn quote_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 4);
    out.push_str("b\"");
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn crasher(sig: &str, input: &[u8], log: &str) -> Crasher {
        Crasher {
            input: input.to_vec(),
            signature: sig.to_string(),
            log: log.to_string(),
        }
    }

    #[test]
    fn one_class_per_signature() {
        let mut store = CrashStore::in_memory();
        assert!(store.report(&crasher("aa", b"one", "log")).unwrap());
        assert!(!store.report(&crasher("aa", b"another", "log")).unwrap());
        assert!(store.report(&crasher("bb", b"one", "log")).unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn smaller_reproducer_replaces_stored_input_but_keeps_log() {
        let dir = tempdir().unwrap();
        let mut store = CrashStore::open(dir.path()).unwrap();

        store
            .report(&crasher("sig", b"a long reproducer", "original log"))
            .unwrap();
        let replaced = store.report(&crasher("sig", b"tiny", "later log")).unwrap();
        assert!(!replaced, "replacement is not a new class");

        assert_eq!(fs::read(dir.path().join("sig")).unwrap(), b"tiny");
        assert_eq!(
            fs::read_to_string(dir.path().join("sig.output")).unwrap(),
            "original log"
        );
    }

    #[test]
    fn larger_reproducer_is_dropped() {
        let dir = tempdir().unwrap();
        let mut store = CrashStore::open(dir.path()).unwrap();
        store.report(&crasher("sig", b"ab", "log")).unwrap();
        store.report(&crasher("sig", b"longer", "log2")).unwrap();
        assert_eq!(fs::read(dir.path().join("sig")).unwrap(), b"ab");
    }

    #[test]
    fn each_class_gets_three_files() {
        let dir = tempdir().unwrap();
        let mut store = CrashStore::open(dir.path()).unwrap();
        store.report(&crasher("deadbeef", b"in\x00put", "panic!")).unwrap();

        assert!(dir.path().join("deadbeef").is_file());
        assert!(dir.path().join("deadbeef.quoted").is_file());
        assert!(dir.path().join("deadbeef.output").is_file());
        assert_eq!(
            fs::read_to_string(dir.path().join("deadbeef.quoted")).unwrap(),
            "b\"in\\x00put\""
        );
    }

    #[test]
    fn reopening_indexes_existing_classes() {
        let dir = tempdir().unwrap();
        {
            let mut store = CrashStore::open(dir.path()).unwrap();
            store.report(&crasher("one", b"x", "l")).unwrap();
            store.report(&crasher("two", b"yy", "l")).unwrap();
        }
        let store = CrashStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains("one"));
        assert!(store.contains("two"));
    }

    #[test]
    fn quoting_escapes_non_printables() {
        assert_eq!(quote_bytes(b"abc"), "b\"abc\"");
        assert_eq!(quote_bytes(b"\xff\n\"\\"), "b\"\\xff\\n\\\"\\\\\"");
    }
}
