//! The read orchestrator: rebuild a snapshot's files under a target
//! directory from a catalogue plus its content files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use crate::catalogue::Catalogue;
use crate::content_ref::{Checksum, ContentRef};
use crate::error::{ArchivariusError, Result};
use crate::hostfs::HostFs;
use crate::pipes::checksum::Checksummer;
use crate::pipes::crypto::XChaChaSource;
use crate::pipes::zstd_pipe::ZstdDecompressSource;
use crate::pipes::{FileSink, FileSource, Sink, Source};
use crate::snapshot::{FileRecord, FileType, SnapshotState};

pub struct RestoreAction<'h> {
    host: &'h dyn HostFs,
}

impl<'h> RestoreAction<'h> {
    pub fn new(host: &'h dyn HostFs) -> Self {
        RestoreAction { host }
    }

    pub fn run(
        &self,
        archive_path: &Path,
        password: Option<&str>,
        target_dir: &Path,
        snapshot_index: usize,
        prefix: Option<&Path>,
        warning: &mut dyn FnMut(String, String),
    ) -> Result<()> {
        let catalogue = Catalogue::open(self.host, archive_path, password, password.is_some())?;
        if catalogue.num_states() == 0 {
            return Err(ArchivariusError::UserInputError(
                "archive has no snapshots".into(),
            ));
        }
        let descriptor = catalogue
            .snapshots()
            .get(snapshot_index)
            .ok_or_else(|| ArchivariusError::UserInputError(format!("no snapshot #{snapshot_index}")))?
            .clone();

        let state = SnapshotState::load(
            &catalogue.snapshot_path(&descriptor.name),
            descriptor.filters.clone(),
            password,
        )?;

        let (records, strip_base) = select_records(&state, prefix);

        let content_key = catalogue.key();

        self.pass1_directories(target_dir, &strip_base, &records)?;
        self.pass2_content_files(target_dir, &strip_base, &catalogue, content_key, &records, warning)?;
        self.pass3_symlinks_and_empty_files(target_dir, &strip_base, &records, warning)?;
        self.pass4_attributes(target_dir, &strip_base, &records, warning);

        Ok(())
    }

    fn pass1_directories(
        &self,
        target_dir: &Path,
        strip_base: &Path,
        records: &[&FileRecord],
    ) -> Result<()> {
        for record in records {
            if record.file_type == FileType::Dir {
                let dest = dest_path(target_dir, strip_base, &record.path);
                self.host.create_dir_all(&dest)?;
            }
        }
        Ok(())
    }

    fn pass2_content_files(
        &self,
        target_dir: &Path,
        strip_base: &Path,
        catalogue: &Catalogue,
        content_key: Option<[u8; 32]>,
        records: &[&FileRecord],
        warning: &mut dyn FnMut(String, String),
    ) -> Result<()> {
        // Group by Content-Ref, natural (content_file_name, from) ordering,
        // so one content file is opened once and read sequentially.
        let mut grouped: BTreeMap<ContentRef, Vec<&FileRecord>> = BTreeMap::new();
        for record in records {
            let Some(addr) = &record.content_ref else {
                continue;
            };
            let Some(cref) = catalogue.content_ref(&addr.content_file_name, addr.from) else {
                warning(
                    record.path.display().to_string(),
                    "content ref missing from catalogue".into(),
                );
                continue;
            };
            grouped.entry(cref.clone()).or_default().push(record);
        }

        let mut by_file: BTreeMap<String, Vec<(ContentRef, Vec<&FileRecord>)>> = BTreeMap::new();
        for (cref, recs) in grouped {
            by_file
                .entry(cref.content_file_name.clone())
                .or_default()
                .push((cref, recs));
        }

        for (content_file_name, mut refs) in by_file {
            refs.sort_by(|a, b| a.0.cmp(&b.0));
            let path = catalogue.archive_dir().join(&content_file_name);
            let mut source = self.open_content_source(&path, &refs[0].0, content_key)?;
            let mut position = 0u64;

            for (cref, recs) in refs {
                if cref.from < position {
                    warning(
                        content_file_name.clone(),
                        "content refs overlap or are out of order".into(),
                    );
                    continue;
                }
                source.discard(cref.from - position)?;
                position = cref.from;

                let mut checksummer = checksummer_for(&cref.checksum, content_key);
                let len = cref.to - cref.from;
                let data = self.pump_exact(source.as_mut(), len)?;
                checksummer.update(&data);
                position += len;

                let computed = checksummer.finalize();
                if !checksum_eq(&computed, &cref.checksum) {
                    warning(
                        content_file_name.clone(),
                        format!(
                            "checksum mismatch for blob [{}, {})",
                            cref.from, cref.to
                        ),
                    );
                }

                for record in recs {
                    let dest = dest_path(target_dir, strip_base, &record.path);
                    if let Some(parent) = dest.parent() {
                        self.host.create_dir_all(parent)?;
                    }
                    let mut sink = FileSink::create(&dest)?;
                    if let Err(e) = sink.pump(&data).and_then(|_| sink.finish()) {
                        warning(record.path.display().to_string(), e.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    fn open_content_source(
        &self,
        path: &Path,
        cref: &ContentRef,
        content_key: Option<[u8; 32]>,
    ) -> Result<Box<dyn Source>> {
        let file_source = FileSource::open(path)?;
        let mut source: Box<dyn Source> = Box::new(file_source);
        // On write, compression wraps the (optionally) already-encrypted
        // stream (plaintext -> compress -> encrypt -> disk), so on read
        // decryption happens first, decompression last — see
        // `ContentFileWriter::open_new_file`.
        if let Some(nonce) = cref.filters.chacha_nonce {
            let key = content_key.ok_or(ArchivariusError::EncryptionKeyMissing)?;
            source = Box::new(XChaChaSource::new(source, key, nonce));
        }
        if cref.filters.zstd_level.is_some() {
            source = Box::new(ZstdDecompressSource::new(source)?);
        }
        Ok(source)
    }

    fn pump_exact(&self, source: &mut dyn Source, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        let mut buf = [0u8; 128 * 1024];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let (n, eof) = source.pump(&mut buf[..want])?;
            out.extend_from_slice(&buf[..n]);
            remaining -= n as u64;
            if remaining > 0 && eof {
                return Err(ArchivariusError::Truncated {
                    path: PathBuf::new(),
                    expected: len,
                    found: (len - remaining),
                });
            }
        }
        Ok(out)
    }

    fn pass3_symlinks_and_empty_files(
        &self,
        target_dir: &Path,
        strip_base: &Path,
        records: &[&FileRecord],
        warning: &mut dyn FnMut(String, String),
    ) -> Result<()> {
        for record in records {
            let dest = dest_path(target_dir, strip_base, &record.path);
            match record.file_type {
                FileType::Symlink => {
                    let target = record
                        .symlink_target
                        .clone()
                        .unwrap_or_else(|| PathBuf::from(""));
                    if let Some(parent) = dest.parent() {
                        self.host.create_dir_all(parent)?;
                    }
                    if let Err(e) = self.host.create_symlink(&target, &dest) {
                        warning(record.path.display().to_string(), e.to_string());
                    }
                }
                FileType::File if record.content_ref.is_none() => {
                    if let Some(parent) = dest.parent() {
                        self.host.create_dir_all(parent)?;
                    }
                    if let Err(e) = FileSink::create(&dest).and_then(|mut s| s.finish()) {
                        warning(record.path.display().to_string(), e.to_string());
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reverse path order so a directory's attributes (in particular its
    /// mtime) are applied after its children exist.
    fn pass4_attributes(
        &self,
        target_dir: &Path,
        strip_base: &Path,
        records: &[&FileRecord],
        warning: &mut dyn FnMut(String, String),
    ) {
        let mut ordered: Vec<&&FileRecord> = records.iter().collect();
        ordered.sort_by(|a, b| b.path.cmp(&a.path));

        for record in ordered {
            let dest = dest_path(target_dir, strip_base, &record.path);
            let mut apply = |result: Result<()>| {
                if let Err(e) = result {
                    warning(record.path.display().to_string(), e.to_string());
                }
            };
            if let Some(acl) = &record.acl {
                apply(self.host.set_acl(&dest, acl));
            }
            if let Some(default_acl) = &record.default_acl {
                apply(self.host.set_default_acl(&dest, default_acl));
            }
            if let Some(mode) = record.unix_permissions {
                apply(self.host.set_unix_permissions(&dest, mode));
            }
            if let Some(ns) = record.mod_time_ns {
                let time = UNIX_EPOCH + Duration::from_nanos(ns.max(0) as u64);
                apply(self.host.set_mod_time(&dest, time));
            }
        }
    }
}

fn checksum_eq(a: &Checksum, b: &Checksum) -> bool {
    a == b
}

/// Reconstructs the same checksummer variant the writer used: keyed
/// BLAKE2b-512 for encrypted content (the archive key doubles as the
/// content-integrity MAC key), plain for everything else.
fn checksummer_for(checksum: &Checksum, content_key: Option<[u8; 32]>) -> Checksummer {
    match (checksum, content_key) {
        (Checksum::Xxh64(_), _) => Checksummer::xxh64(),
        (Checksum::Blake2b512(_), Some(key)) => Checksummer::blake2b512_keyed(&key),
        (Checksum::Blake2b512(_), None) => Checksummer::blake2b512(),
    }
}

/// Drops records outside `prefix` (element-wise path match) and returns
/// the directory to strip from every surviving path.
fn select_records<'s>(
    state: &'s SnapshotState,
    prefix: Option<&Path>,
) -> (Vec<&'s FileRecord>, PathBuf) {
    match prefix {
        None => (state.files().collect(), PathBuf::new()),
        Some(prefix) => {
            let prefix_components: Vec<_> = prefix.components().collect();
            let records: Vec<&FileRecord> = state
                .files()
                .filter(|r| {
                    let components: Vec<_> = r.path.components().collect();
                    components.len() >= prefix_components.len()
                        && components
                            .iter()
                            .zip(prefix_components.iter())
                            .all(|(a, b)| a == b)
                })
                .collect();
            let strip_base = prefix.parent().map(Path::to_path_buf).unwrap_or_default();
            (records, strip_base)
        }
    }
}

fn dest_path(target_dir: &Path, strip_base: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix(strip_base).unwrap_or(path);
    target_dir.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive_action::{ArchiveAction, Task};
    use crate::hostfs::PosixHostFs;
    use std::fs;

    #[test]
    fn restore_round_trips_plain_files_and_dirs() {
        let host = PosixHostFs;
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let archive = tmp.path().join("archive");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"hello world").unwrap();
        fs::write(src.join("sub/b.txt"), b"nested").unwrap();

        let task = Task {
            name: "t".into(),
            archive_path: archive.clone(),
            root: Some(src.clone()),
            compress: false,
            process_acls: false,
            min_content_file_size: 0,
            ..Default::default()
        };
        ArchiveAction::new(&host).run(&task, &mut |h, m| panic!("{h}: {m}")).unwrap();

        let mut warn_calls = Vec::new();
        RestoreAction::new(&host)
            .run(&archive, None, &dst, 0, None, &mut |h, m| warn_calls.push((h, m)))
            .unwrap();

        assert!(warn_calls.is_empty(), "unexpected warnings: {warn_calls:?}");
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"hello world");
        assert_eq!(fs::read(dst.join("sub/b.txt")).unwrap(), b"nested");
    }
}
