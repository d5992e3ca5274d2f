//! Integrity verification: checks the catalogue's ref-count bookkeeping
//! against what the snapshots actually reference, then re-reads every
//! Content-Ref's bytes and checks its stored checksum.

use std::collections::HashMap;
use std::path::Path;

use crate::catalogue::Catalogue;
use crate::content_ref::{Checksum, ContentRef};
use crate::error::Result;
use crate::hostfs::HostFs;
use crate::pipes::checksum::Checksummer;
use crate::pipes::crypto::XChaChaSource;
use crate::pipes::zstd_pipe::ZstdDecompressSource;
use crate::pipes::{FileSource, Source};
use crate::snapshot::SnapshotState;

pub struct TestAction<'h> {
    host: &'h dyn HostFs,
}

impl<'h> TestAction<'h> {
    pub fn new(host: &'h dyn HostFs) -> Self {
        TestAction { host }
    }

    pub fn run(
        &self,
        archive_path: &Path,
        password: Option<&str>,
        warning: &mut dyn FnMut(String, String),
    ) -> Result<()> {
        let catalogue = Catalogue::open(self.host, archive_path, password, password.is_some())?;

        self.check_ref_counts(&catalogue, password, warning)?;
        self.check_checksums(&catalogue, warning)?;
        Ok(())
    }

    /// Builds `(content_file_name, from) -> expected_ref_count` from
    /// every snapshot and reconciles it against the catalogue's own
    /// counts.
    fn check_ref_counts(
        &self,
        catalogue: &Catalogue,
        password: Option<&str>,
        warning: &mut dyn FnMut(String, String),
    ) -> Result<()> {
        let mut expected: HashMap<(String, u64), u64> = HashMap::new();
        for descriptor in catalogue.snapshots() {
            let state = SnapshotState::load(
                &catalogue.snapshot_path(&descriptor.name),
                descriptor.filters.clone(),
                password,
            )?;
            for record in state.files() {
                if let Some(addr) = &record.content_ref {
                    *expected
                        .entry((addr.content_file_name.clone(), addr.from))
                        .or_insert(0) += 1;
                }
            }
        }

        for cref in catalogue.content_refs() {
            let key = (cref.content_file_name.clone(), cref.from);
            match expected.remove(&key) {
                None => warning(
                    format!("{}@{}", cref.content_file_name, cref.from),
                    "stale ref in catalogue".into(),
                ),
                Some(count) if count != cref.ref_count => warning(
                    format!("{}@{}", cref.content_file_name, cref.from),
                    format!(
                        "ref_count inconsistent: catalogue says {}, snapshots reference it {} times",
                        cref.ref_count, count
                    ),
                ),
                Some(_) => {}
            }
        }

        for (name, from) in expected.keys() {
            warning(
                format!("{name}@{from}"),
                "used ref missing from catalogue".into(),
            );
        }
        Ok(())
    }

    fn check_checksums(
        &self,
        catalogue: &Catalogue,
        warning: &mut dyn FnMut(String, String),
    ) -> Result<()> {
        for cref in catalogue.content_refs() {
            if let Err(e) = self.check_one_checksum(catalogue, cref) {
                warning(
                    format!("{}@{}", cref.content_file_name, cref.from),
                    e.to_string(),
                );
                continue;
            }
        }
        Ok(())
    }

    fn check_one_checksum(&self, catalogue: &Catalogue, cref: &ContentRef) -> Result<()> {
        let path = catalogue.archive_dir().join(&cref.content_file_name);
        let file_source = FileSource::open(&path)?;
        let mut source: Box<dyn Source> = Box::new(file_source);
        if let Some(nonce) = cref.filters.chacha_nonce {
            let key = catalogue.key().ok_or(crate::error::ArchivariusError::EncryptionKeyMissing)?;
            source = Box::new(XChaChaSource::new(source, key, nonce));
        }
        if cref.filters.zstd_level.is_some() {
            source = Box::new(ZstdDecompressSource::new(source)?);
        }

        source.discard(cref.from)?;

        let mut checksummer = match (&cref.checksum, catalogue.key()) {
            (Checksum::Xxh64(_), _) => Checksummer::xxh64(),
            (Checksum::Blake2b512(_), Some(key)) => Checksummer::blake2b512_keyed(&key),
            (Checksum::Blake2b512(_), None) => Checksummer::blake2b512(),
        };

        let mut remaining = cref.to - cref.from;
        let mut buf = [0u8; 128 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let (n, eof) = source.pump(&mut buf[..want])?;
            checksummer.update(&buf[..n]);
            remaining -= n as u64;
            if remaining > 0 && eof {
                return Err(crate::error::ArchivariusError::Truncated {
                    path,
                    expected: cref.to,
                    found: cref.to - remaining,
                });
            }
        }

        if checksummer.finalize() != cref.checksum {
            return Err(crate::error::ArchivariusError::CorruptFile {
                path,
                detail: format!("checksum mismatch for blob [{}, {})", cref.from, cref.to),
            });
        }
        Ok(())
    }
}
