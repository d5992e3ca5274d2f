//! Process-exclusive archive manager: loads/saves the root `catalog`
//! file, tracks per-snapshot descriptors and the deduplicated
//! content-ref set, and enforces single-writer access via a file lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::content_ref::ContentRef;
use crate::error::{ArchivariusError, Result};
use crate::filters::FilterSet;
use crate::hostfs::{FileLock, HostFs};
use crate::pipes::crypto::{derive_key, ChaPolyDecryptSource, ChaPolyEncryptSink, KEY_LEN, NONCE_LEN};
use crate::pipes::zstd_pipe::{ZstdCompressSink, ZstdDecompressSource, LEVEL_CATALOGUE};
use crate::pipes::{FileSink, FileSource, Sink, Source};
use crate::snapshot::SnapshotState;
use crate::stream::{get_message, put_message, read_varint, write_varint};

pub const CURRENT_VERSION: u64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub name: String,
    /// Seconds since the POSIX epoch.
    pub time_created: i64,
    pub filters: FilterSet,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeaderMessage {
    zstd: bool,
    chapoly_nonce: Option<[u8; NONCE_LEN]>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefEntry {
    from: u64,
    to: u64,
    ref_count: u64,
    space_taken: u64,
    checksum: crate::content_ref::Checksum,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentFileGroup {
    name: String,
    filters: FilterSet,
    refs: Vec<RefEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BodyMessage {
    state_files: Vec<SnapshotDescriptor>,
    content_files: Vec<ContentFileGroup>,
}

/// Key is `(content_file_name, from)`, giving the natural Content-Ref
/// ordering for free via `BTreeMap`'s iteration order.
type ContentRefMap = BTreeMap<(String, u64), ContentRef>;

pub struct Catalogue<'h> {
    archive_dir: PathBuf,
    host: &'h dyn HostFs,
    _lock: Box<dyn FileLock>,
    filters: FilterSet,
    key: Option<[u8; KEY_LEN]>,
    nonce: Option<[u8; NONCE_LEN]>,
    snapshots: Vec<SnapshotDescriptor>,
    content_refs: ContentRefMap,
}

impl<'h> Catalogue<'h> {
    fn catalog_path(&self) -> PathBuf {
        self.archive_dir.join("catalog")
    }

    /// Opens (creating if absent) the archive at `archive_dir` for
    /// exclusive read/write access.
    pub fn open(
        host: &'h dyn HostFs,
        archive_dir: impl Into<PathBuf>,
        password: Option<&str>,
        want_encryption: bool,
    ) -> Result<Self> {
        let archive_dir = archive_dir.into();
        host.create_dir_all(&archive_dir)?;
        let catalog_path = archive_dir.join("catalog");
        if !host.exists(&catalog_path) {
            std::fs::File::create(&catalog_path).map_err(|e| ArchivariusError::io(&catalog_path, e))?;
        }
        let lock = host.lock_exclusive(&catalog_path)?;

        let size = host.file_size(&catalog_path).unwrap_or(0);
        let mut catalogue = Catalogue {
            archive_dir,
            host,
            _lock: lock,
            filters: FilterSet {
                zstd_level: Some(LEVEL_CATALOGUE),
                chapoly_nonce: None,
                chacha_nonce: None,
            },
            key: None,
            nonce: None,
            snapshots: Vec::new(),
            content_refs: BTreeMap::new(),
        };

        if size == 0 {
            if want_encryption {
                let key = password
                    .map(derive_key)
                    .ok_or(ArchivariusError::EncryptionKeyMissing)?;
                catalogue.key = Some(key);
                catalogue.nonce = Some(fresh_nonce());
                catalogue.filters.chapoly_nonce = catalogue.nonce;
            }
            catalogue.cleanup();
            return Ok(catalogue);
        }

        catalogue.load(password)?;
        catalogue.cleanup();
        Ok(catalogue)
    }

    fn load(&mut self, password: Option<&str>) -> Result<()> {
        let mut file_source = FileSource::open(self.catalog_path())?;
        let version = read_varint(&mut file_source)?;
        if version > CURRENT_VERSION {
            return Err(ArchivariusError::UnsupportedVersion {
                found: version,
                max: CURRENT_VERSION,
            });
        }
        let header: HeaderMessage = get_message(&mut file_source)?;

        let key = if let Some(nonce) = header.chapoly_nonce {
            let key = password
                .map(derive_key)
                .ok_or(ArchivariusError::EncryptionKeyMissing)?;
            self.key = Some(key);
            self.nonce = Some(increment_nonce(nonce));
            self.filters.chapoly_nonce = self.nonce;
            Some((key, nonce))
        } else {
            self.nonce = None;
            None
        };

        let mut source: Box<dyn Source> = Box::new(file_source);
        if let Some((key, nonce)) = key {
            source = Box::new(ChaPolyDecryptSource::new(source, key, nonce)?);
        }
        source = Box::new(ZstdDecompressSource::new(source)?);
        let body: BodyMessage = get_message(source.as_mut())?;

        self.snapshots = body.state_files;
        self.content_refs = BTreeMap::new();
        for group in body.content_files {
            for entry in group.refs {
                let key = (group.name.clone(), entry.from);
                self.content_refs.insert(
                    key,
                    ContentRef {
                        content_file_name: group.name.clone(),
                        from: entry.from,
                        to: entry.to,
                        filters: group.filters.clone(),
                        space_taken: entry.space_taken,
                        checksum: entry.checksum,
                        ref_count: entry.ref_count,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn filters(&self) -> FilterSet {
        self.filters.clone()
    }

    pub fn key(&self) -> Option<[u8; KEY_LEN]> {
        self.key
    }

    pub fn num_states(&self) -> usize {
        self.snapshots.len()
    }

    pub fn snapshots(&self) -> &[SnapshotDescriptor] {
        &self.snapshots
    }

    pub fn content_ref(&self, content_file_name: &str, from: u64) -> Option<&ContentRef> {
        self.content_refs
            .get(&(content_file_name.to_string(), from))
    }

    pub fn content_refs(&self) -> impl Iterator<Item = &ContentRef> {
        self.content_refs.values()
    }

    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.archive_dir.join(name)
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Registers a newly-written snapshot. `new_refs` are the
    /// Content-Refs the content writer(s) produced during this run;
    /// every other reference in `state` must already exist in the
    /// catalogue (a dedup reuse from a prior snapshot).
    pub fn add_fs_state(
        &mut self,
        name: String,
        time_created: SystemTime,
        filters: FilterSet,
        state: &SnapshotState,
        new_refs: Vec<ContentRef>,
    ) -> Result<()> {
        for mut r in new_refs {
            let key = (r.content_file_name.clone(), r.from);
            r.ref_count = 0;
            self.content_refs.entry(key).or_insert(r);
        }
        for record in state.files() {
            if let Some(addr) = &record.content_ref {
                let key = (addr.content_file_name.clone(), addr.from);
                match self.content_refs.get_mut(&key) {
                    Some(cref) => cref.ref_count += 1,
                    None => {
                        return Err(ArchivariusError::InconsistentState {
                            code: "add_fs_state_missing_ref",
                        })
                    }
                }
            }
        }
        let time_created = time_created
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.snapshots.insert(
            0,
            SnapshotDescriptor {
                name,
                time_created,
                filters,
            },
        );
        Ok(())
    }

    /// Removes only the tail (oldest) descriptor, per the documented
    /// "remove from the tail only" contract.
    pub fn remove_fs_state(&mut self, name: &str, removed_state: &SnapshotState) -> Result<()> {
        match self.snapshots.last() {
            Some(last) if last.name == name => {}
            _ => {
                return Err(ArchivariusError::InconsistentState {
                    code: "remove_fs_state_not_tail",
                })
            }
        }
        for record in removed_state.files() {
            if let Some(addr) = &record.content_ref {
                let key = (addr.content_file_name.clone(), addr.from);
                match self.content_refs.get_mut(&key) {
                    Some(cref) => {
                        cref.ref_count = cref.ref_count.saturating_sub(1);
                        if cref.ref_count == 0 {
                            self.content_refs.remove(&key);
                        }
                    }
                    None => {
                        return Err(ArchivariusError::InconsistentState {
                            code: "remove_fs_state_missing_ref",
                        })
                    }
                }
            }
        }
        self.snapshots.pop();
        Ok(())
    }

    fn referenced_names(&self) -> std::collections::HashSet<String> {
        let mut names: std::collections::HashSet<String> =
            self.snapshots.iter().map(|s| s.name.clone()).collect();
        names.extend(self.content_refs.keys().map(|(name, _)| name.clone()));
        names.insert("catalog".to_string());
        names
    }

    /// Removes any non-hidden file in the archive directory that is
    /// neither the catalog, nor a referenced snapshot, nor a referenced
    /// content file. Best-effort: individual removal failures are
    /// ignored (invariant K1).
    pub fn cleanup(&self) {
        let referenced = self.referenced_names();
        let entries = match self.host.read_dir(&self.archive_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries {
            let file_name = match entry.path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if file_name.starts_with('.') || referenced.contains(&file_name) {
                continue;
            }
            let _ = self.host.remove_file(&entry.path);
        }
    }

    /// Writes `catalog.tmp`, fsyncs, renames over `catalog`, fsyncs
    /// again, then runs cleanup (invariant K4: atomic w.r.t. crash
    /// observers).
    pub fn commit(&mut self) -> Result<()> {
        for cref in self.content_refs.values() {
            debug_assert!(cref.ref_count >= 1);
            debug_assert!(cref.space_taken >= 1);
        }

        let tmp_path = self.archive_dir.join("catalog.tmp");
        let file_sink = FileSink::create(&tmp_path)?;
        let mut raw: Box<dyn Sink> = Box::new(file_sink);

        let header = HeaderMessage {
            zstd: true,
            chapoly_nonce: self.nonce,
        };
        write_varint(raw.as_mut(), CURRENT_VERSION)?;
        put_message(raw.as_mut(), &header)?;

        let mut chain: Box<dyn Sink> = raw;
        if let (Some(key), Some(nonce)) = (self.key, self.nonce) {
            chain = Box::new(ChaPolyEncryptSink::new(chain, key, nonce));
        }
        chain = Box::new(ZstdCompressSink::new(chain, LEVEL_CATALOGUE)?);

        let mut content_files: BTreeMap<String, ContentFileGroup> = BTreeMap::new();
        for ((name, _from), cref) in &self.content_refs {
            let group = content_files.entry(name.clone()).or_insert_with(|| ContentFileGroup {
                name: name.clone(),
                filters: cref.filters.clone(),
                refs: Vec::new(),
            });
            group.refs.push(RefEntry {
                from: cref.from,
                to: cref.to,
                ref_count: cref.ref_count,
                space_taken: cref.space_taken,
                checksum: cref.checksum,
            });
        }
        let body = BodyMessage {
            state_files: self.snapshots.clone(),
            content_files: content_files.into_values().collect(),
        };
        put_message(chain.as_mut(), &body)?;
        chain.finish()?;

        self.host.sync_all();
        self.host.rename(&tmp_path, &self.catalog_path())?;
        self.host.sync_all();
        self.cleanup();
        Ok(())
    }
}

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).expect("system RNG must be available");
    nonce
}

fn increment_nonce(mut nonce: [u8; NONCE_LEN]) -> [u8; NONCE_LEN] {
    for byte in nonce.iter_mut() {
        let (v, carry) = byte.overflowing_add(1);
        *byte = v;
        if !carry {
            break;
        }
    }
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostfs::PosixHostFs;
    use crate::snapshot::{FileRecord, FileType, RefAddress, SnapshotState};
    use std::path::PathBuf as PB;

    static HOST: PosixHostFs = PosixHostFs;

    #[test]
    fn open_creates_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let cat = Catalogue::open(&HOST, &archive, None, false).unwrap();
        assert_eq!(cat.num_states(), 0);
        assert!(archive.join("catalog").exists());
    }

    #[test]
    fn commit_then_reload_preserves_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        {
            let mut cat = Catalogue::open(&HOST, &archive, None, false).unwrap();
            let mut state = SnapshotState::new(cat.filters());
            state.add(FileRecord {
                path: PB::from("a.txt"),
                file_type: FileType::File,
                mod_time_ns: Some(123),
                unix_permissions: Some(0o644),
                symlink_target: None,
                acl: None,
                default_acl: None,
                content_ref: Some(RefAddress {
                    content_file_name: "c1".into(),
                    from: 0,
                }),
            });
            let new_ref = ContentRef {
                content_file_name: "c1".into(),
                from: 0,
                to: 4,
                filters: FilterSet::default(),
                space_taken: 4,
                checksum: crate::content_ref::Checksum::Xxh64(0),
                ref_count: 1,
            };
            cat.add_fs_state("s1".into(), SystemTime::now(), cat.filters(), &state, vec![new_ref])
                .unwrap();
            cat.commit().unwrap();
        }
        let cat = Catalogue::open(&HOST, &archive, None, false).unwrap();
        assert_eq!(cat.num_states(), 1);
        assert_eq!(cat.content_ref("c1", 0).unwrap().ref_count, 1);
    }

    #[test]
    fn second_open_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let _first = Catalogue::open(&HOST, &archive, None, false).unwrap();
        let second = Catalogue::open(&HOST, &archive, None, false);
        assert!(second.is_err());
    }
}
