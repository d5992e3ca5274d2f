//! Per-snapshot metadata table: one record per path, persisted as one
//! framed file per snapshot with its own filter chain.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::content_ref::ContentRef;
use crate::error::Result;
use crate::filters::FilterSet;
use crate::pipes::crypto::{derive_key, ChaPolyDecryptSource, ChaPolyEncryptSink, KEY_LEN};
use crate::pipes::zstd_pipe::{ZstdCompressSink, ZstdDecompressSource, LEVEL_SNAPSHOT};
use crate::pipes::{FileSink, FileSource, Sink, Source};
use crate::stream::{get_message, put_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Dir,
    Symlink,
}

/// Only the addressing half of a Content-Ref is stored per-file; the
/// full ref (filters, checksum, ref_count, `to`, `space_taken`) is
/// reconstructed by the catalogue's `(content_file_name, from)` lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefAddress {
    pub content_file_name: String,
    pub from: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub file_type: FileType,
    /// Nanoseconds since the POSIX epoch; absent for symlinks. Field
    /// name on the wire is `modified_seconds` for compatibility with the
    /// original format even though the unit stored is nanoseconds.
    #[serde(rename = "modified_seconds")]
    pub mod_time_ns: Option<i128>,
    pub unix_permissions: Option<u32>,
    pub symlink_target: Option<PathBuf>,
    pub acl: Option<String>,
    pub default_acl: Option<String>,
    #[serde(rename = "ref")]
    pub content_ref: Option<RefAddress>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateMessage {
    records: Vec<FileRecord>,
}

/// An ordered mapping from path to record. Iteration/`files()` follows
/// insertion order only incidentally; path lookup is what matters.
pub struct SnapshotState {
    records: BTreeMap<PathBuf, FileRecord>,
    filters: FilterSet,
}

impl SnapshotState {
    pub fn new(filters: FilterSet) -> Self {
        SnapshotState {
            records: BTreeMap::new(),
            filters,
        }
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    /// Inserts a record; a duplicate path overwrites the previous one
    /// (invariant S1: paths are unique within a state).
    pub fn add(&mut self, record: FileRecord) {
        self.records.insert(record.path.clone(), record);
    }

    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.records.get(path)
    }

    /// Incremental dedup probe: returns the addressing half of the
    /// Content-Ref only if a record exists at `path` and its `mod_time`
    /// equals the supplied value exactly.
    pub fn get_ref_if_exist(&self, path: &Path, mod_time_ns: i128) -> Option<RefAddress> {
        let record = self.records.get(path)?;
        if record.mod_time_ns != Some(mod_time_ns) {
            return None;
        }
        record.content_ref.clone()
    }

    /// Writes the state file: `zstd(level 14)` then, if encrypted,
    /// ChaCha20-Poly1305 with a fresh nonce, wrapping a framed
    /// `STATE_MESSAGE` with an XXH64 trailer.
    pub fn commit(&self, path: &Path, key: Option<[u8; 32]>) -> Result<()> {
        let file_sink = FileSink::create(path)?;
        let mut chain: Box<dyn Sink> = Box::new(file_sink);
        if let Some(key) = key {
            let nonce = self
                .filters
                .chapoly_nonce
                .expect("encrypted state must carry a persisted nonce");
            chain = Box::new(ChaPolyEncryptSink::new(chain, key, nonce));
        }
        chain = Box::new(ZstdCompressSink::new(chain, LEVEL_SNAPSHOT)?);

        let message = StateMessage {
            records: self.records.values().cloned().collect(),
        };
        put_message(chain.as_mut(), &message)?;
        chain.finish()
    }

    pub fn load(path: &Path, filters: FilterSet, password: Option<&str>) -> Result<Self> {
        let file_source = FileSource::open(path)?;
        let mut source: Box<dyn Source> = Box::new(file_source);
        if let Some(nonce) = filters.chapoly_nonce {
            let key = derive_key_or_fail(password)?;
            source = Box::new(ChaPolyDecryptSource::new(source, key, nonce)?);
        }
        source = Box::new(ZstdDecompressSource::new(source)?);

        let message: StateMessage = get_message(source.as_mut())?;
        let mut state = SnapshotState::new(filters);
        for record in message.records {
            state.add(record);
        }
        Ok(state)
    }
}

fn derive_key_or_fail(password: Option<&str>) -> Result<[u8; KEY_LEN]> {
    match password {
        Some(p) => Ok(derive_key(p)),
        None => Err(crate::error::ArchivariusError::EncryptionKeyMissing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, mtime: i128) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            file_type: FileType::File,
            mod_time_ns: Some(mtime),
            unix_permissions: Some(0o644),
            symlink_target: None,
            acl: None,
            default_acl: None,
            content_ref: Some(RefAddress {
                content_file_name: "c1".into(),
                from: 0,
            }),
        }
    }

    #[test]
    fn dedup_probe_requires_exact_mtime_match() {
        let mut state = SnapshotState::new(FilterSet::default());
        state.add(record("a.txt", 100));
        assert!(state.get_ref_if_exist(Path::new("a.txt"), 100).is_some());
        assert!(state.get_ref_if_exist(Path::new("a.txt"), 101).is_none());
        assert!(state.get_ref_if_exist(Path::new("missing"), 100).is_none());
    }

    #[test]
    fn commit_and_load_roundtrip_unencrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1");
        let mut state = SnapshotState::new(FilterSet {
            zstd_level: Some(LEVEL_SNAPSHOT),
            chapoly_nonce: None,
            chacha_nonce: None,
        });
        state.add(record("a.txt", 100));
        state.add(record("b.txt", 200));
        state.commit(&path, None).unwrap();

        let loaded = SnapshotState::load(&path, state.filters().clone(), None).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get(Path::new("a.txt")).unwrap().mod_time_ns,
            Some(100)
        );
    }

    #[test]
    fn duplicate_path_overwrites() {
        let mut state = SnapshotState::new(FilterSet::default());
        state.add(record("a.txt", 100));
        state.add(record("a.txt", 200));
        assert_eq!(state.len(), 1);
        assert_eq!(state.get(Path::new("a.txt")).unwrap().mod_time_ns, Some(200));
    }
}
