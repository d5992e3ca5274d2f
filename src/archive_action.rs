//! The write orchestrator: enumerate inputs, diff against the previous
//! snapshot, feed new content to the writer, commit the new snapshot,
//! optionally drop aged snapshots, commit the catalogue.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};

use crate::catalogue::Catalogue;
use crate::content_ref::ContentRef;
use crate::content_writer::ContentFileWriter;
use crate::error::Result;
use crate::filters::FilterSet;
use crate::hostfs::{EntryKind, HostFs};
use crate::pipes::zstd_pipe::LEVEL_SNAPSHOT;
use crate::snapshot::{FileRecord, FileType, RefAddress, SnapshotState};

/// One task's configuration. A plain struct with defaults rather than a
/// fluent builder, since every field is independently optional and the
/// caller (config file or CLI) already has all of them at construction
/// time.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub name: String,
    pub archive_path: PathBuf,
    pub root: Option<PathBuf>,
    pub files_to_archive: Vec<PathBuf>,
    pub files_to_exclude: HashSet<PathBuf>,
    pub password: Option<String>,
    pub compress: bool,
    pub process_acls: bool,
    pub min_content_file_size: u64,
    pub max_storage_time: Option<Duration>,
}

pub struct ArchiveAction<'h> {
    host: &'h dyn HostFs,
}

fn unix_nanos(t: SystemTime) -> i128 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i128
}

impl<'h> ArchiveAction<'h> {
    pub fn new(host: &'h dyn HostFs) -> Self {
        ArchiveAction { host }
    }

    pub fn run(&self, task: &Task, warning: &mut dyn FnMut(String, String)) -> Result<()> {
        let result = self.run_inner(task, warning);
        if let Err(e) = &result {
            warning(task.name.clone(), e.to_string());
        }
        result
    }

    fn run_inner(&self, task: &Task, warning: &mut dyn FnMut(String, String)) -> Result<()> {
        let want_encryption = task.password.is_some();
        let mut catalogue = Catalogue::open(
            self.host,
            &task.archive_path,
            task.password.as_deref(),
            want_encryption,
        )?;
        let key = catalogue.key();

        let prev_descriptor = catalogue.snapshots().first().cloned();
        let prev_state = match &prev_descriptor {
            Some(d) => Some(SnapshotState::load(
                &catalogue.snapshot_path(&d.name),
                d.filters.clone(),
                task.password.as_deref(),
            )?),
            None => None,
        };

        let next_filters = FilterSet {
            zstd_level: Some(LEVEL_SNAPSHOT),
            chapoly_nonce: key.map(|_| fresh_nonce()),
            chacha_nonce: None,
        };
        let mut next_state = SnapshotState::new(next_filters.clone());

        let force_to_archive = if task.max_storage_time.is_some() && catalogue.num_states() > 0 {
            self.gc_decision(task, &catalogue, prev_state.as_ref())
        } else {
            HashSet::new()
        };

        let mut normal_writer = ContentFileWriter::new(self.host, &task.archive_path);
        if task.compress {
            normal_writer.enable_compression();
        }
        if let Some(key) = key {
            normal_writer.enable_encryption(key);
        }
        normal_writer.min_file_size(task.min_content_file_size);

        let mut long_term_writer = ContentFileWriter::new(self.host, &task.archive_path);
        if task.compress {
            long_term_writer.enable_compression();
        }
        if let Some(key) = key {
            long_term_writer.enable_encryption(key);
        }
        long_term_writer.min_file_size(task.min_content_file_size);

        let mut new_refs = Vec::new();

        let (files_to_archive, files_to_exclude) = self.resolve_roots(task);
        let entries = self.enumerate(task, &files_to_archive, &files_to_exclude, warning)?;

        for entry in entries {
            match self.build_record(
                task,
                &entry,
                prev_state.as_ref(),
                &force_to_archive,
                &mut normal_writer,
                &mut long_term_writer,
                &mut new_refs,
            ) {
                Ok(Some(record)) => next_state.add(record),
                Ok(None) => {}
                Err(e) if e.is_unrecoverable_output() => return Err(e),
                Err(e) => warning(entry.display().to_string(), e.to_string()),
            }
        }

        normal_writer.finish()?;
        long_term_writer.finish()?;

        if task.compress {
            let stats = normal_writer.stats;
            if stats.original > 0 {
                info!(
                    "task {}: compression ratio {:.2} ({} -> {} bytes)",
                    task.name,
                    stats.original as f64 / stats.compressed.max(1) as f64,
                    stats.original,
                    stats.compressed
                );
            }
        }

        let snapshot_name = unique_snapshot_name(self.host, &task.archive_path);
        let snapshot_path = task.archive_path.join(&snapshot_name);
        next_state.commit(&snapshot_path, key)?;

        catalogue.add_fs_state(
            snapshot_name,
            SystemTime::now(),
            next_filters,
            &next_state,
            new_refs,
        )?;

        if let Some(max_storage_time) = task.max_storage_time {
            self.prune(task, &mut catalogue, max_storage_time, warning)?;
        }

        catalogue.commit()?;
        Ok(())
    }

    fn resolve_roots(&self, task: &Task) -> (Vec<PathBuf>, HashSet<PathBuf>) {
        match &task.root {
            Some(root) => (
                task.files_to_archive.iter().map(|p| root.join(p)).collect(),
                task.files_to_exclude.iter().map(|p| root.join(p)).collect(),
            ),
            None => (task.files_to_archive.clone(), task.files_to_exclude.clone()),
        }
    }

    fn enumerate(
        &self,
        task: &Task,
        files_to_archive: &[PathBuf],
        files_to_exclude: &HashSet<PathBuf>,
        warning: &mut dyn FnMut(String, String),
    ) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        if files_to_archive.is_empty() {
            let root = task.root.clone().unwrap_or_else(|| PathBuf::from("."));
            self.walk(&root, files_to_exclude, &mut out);
        } else {
            for path in files_to_archive {
                if !self.host.exists(path) {
                    warning(path.display().to_string(), "path does not exist".into());
                    continue;
                }
                out.push(path.clone());
                if matches!(self.host.entry_kind(path), Ok(EntryKind::Dir)) {
                    self.walk(path, files_to_exclude, &mut out);
                }
            }
        }
        Ok(out)
    }

    /// Files-then-subdirectories within a directory, recursion deferred
    /// (explicit worklist, not a generator) per the traversal-order
    /// requirement — improves compression locality within content files.
    fn walk(&self, root: &Path, exclude: &HashSet<PathBuf>, out: &mut Vec<PathBuf>) {
        let mut pending_dirs = vec![root.to_path_buf()];
        while let Some(dir) = pending_dirs.pop() {
            let entries = match self.host.read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            let mut subdirs = Vec::new();
            for entry in entries {
                if exclude.contains(&entry.path) {
                    continue;
                }
                out.push(entry.path.clone());
                if entry.kind == EntryKind::Dir {
                    subdirs.push(entry.path);
                }
            }
            pending_dirs.extend(subdirs);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        task: &Task,
        path: &Path,
        prev_state: Option<&SnapshotState>,
        force_to_archive: &HashSet<PathBuf>,
        normal_writer: &mut ContentFileWriter,
        long_term_writer: &mut ContentFileWriter,
        new_refs: &mut Vec<ContentRef>,
    ) -> Result<Option<FileRecord>> {
        let rel_path = self.relative_path(task, path);
        let kind = self.host.entry_kind(path)?;

        match kind {
            EntryKind::Symlink => {
                let target = self.host.read_symlink(path)?;
                Ok(Some(FileRecord {
                    path: rel_path,
                    file_type: FileType::Symlink,
                    mod_time_ns: None,
                    unix_permissions: None,
                    symlink_target: Some(target),
                    acl: None,
                    default_acl: None,
                    content_ref: None,
                }))
            }
            EntryKind::Dir => {
                let (acl, default_acl) = if task.process_acls {
                    (self.host.get_acl(path)?, self.host.get_default_acl(path)?)
                } else {
                    (None, None)
                };
                Ok(Some(FileRecord {
                    path: rel_path,
                    file_type: FileType::Dir,
                    mod_time_ns: Some(unix_nanos(self.host.last_write_time(path)?)),
                    unix_permissions: Some(self.host.unix_permissions(path)?),
                    symlink_target: None,
                    acl,
                    default_acl,
                    content_ref: None,
                }))
            }
            EntryKind::File => {
                let mod_time = unix_nanos(self.host.last_write_time(path)?);
                let size = self.host.file_size(path)?;
                let acl = if task.process_acls {
                    self.host.get_acl(path)?
                } else {
                    None
                };

                let content_ref = if size == 0 {
                    None
                } else if let Some(addr) = prev_state.and_then(|s| s.get_ref_if_exist(&rel_path, mod_time)) {
                    Some(addr)
                } else if force_to_archive.contains(&rel_path) {
                    let r = long_term_writer.add(path)?;
                    let addr = RefAddress {
                        content_file_name: r.content_file_name.clone(),
                        from: r.from,
                    };
                    new_refs.push(r);
                    Some(addr)
                } else {
                    let r = normal_writer.add(path)?;
                    let addr = RefAddress {
                        content_file_name: r.content_file_name.clone(),
                        from: r.from,
                    };
                    new_refs.push(r);
                    Some(addr)
                };

                Ok(Some(FileRecord {
                    path: rel_path,
                    file_type: FileType::File,
                    mod_time_ns: Some(mod_time),
                    unix_permissions: Some(self.host.unix_permissions(path)?),
                    symlink_target: None,
                    acl,
                    default_acl: None,
                    content_ref,
                }))
            }
            EntryKind::Other => {
                debug!("skipping non-regular entry {}", path.display());
                Ok(None)
            }
        }
    }

    fn relative_path(&self, task: &Task, path: &Path) -> PathBuf {
        match &task.root {
            Some(root) => path.strip_prefix(root).unwrap_or(path).to_path_buf(),
            None => path.to_path_buf(),
        }
    }

    /// Garbage-collection / compaction decision: finds content files
    /// whose stable (every-snapshot) portion is mostly waste and forces
    /// their still-live files to be re-archived into a fresh, dense
    /// content file.
    fn gc_decision(
        &self,
        task: &Task,
        catalogue: &Catalogue,
        prev_state: Option<&SnapshotState>,
    ) -> HashSet<PathBuf> {
        let prev_state = match prev_state {
            Some(s) => s,
            None => return HashSet::new(),
        };
        let max_ref = catalogue.num_states() as u64;
        let min_size = task.min_content_file_size;

        let mut candidates: HashMap<String, Vec<(PathBuf, u64)>> = HashMap::new();
        for record in prev_state.files() {
            let Some(addr) = &record.content_ref else {
                continue;
            };
            let Some(cref) = catalogue.content_ref(&addr.content_file_name, addr.from) else {
                continue;
            };
            if cref.ref_count == max_ref {
                candidates
                    .entry(addr.content_file_name.clone())
                    .or_default()
                    .push((record.path.clone(), cref.space_taken));
            }
        }

        let mut force_to_archive = HashSet::new();
        let mut total_size = 0u64;
        let mut total_waste = 0u64;
        for (name, files) in &candidates {
            let on_disk = self
                .host
                .file_size(&task.archive_path.join(name))
                .unwrap_or(0);
            let used: u64 = files.iter().map(|(_, space)| space).sum();
            let waste = on_disk.max(min_size).saturating_sub(used);
            if waste >= min_size / 16 {
                for (path, space) in files {
                    force_to_archive.insert(path.clone());
                    total_size += space;
                }
                total_waste += waste;
            }
        }

        if total_size < min_size && total_waste < 10 * min_size {
            return HashSet::new();
        }
        if !force_to_archive.is_empty() {
            debug!(
                "task {}: compaction forcing {} files back through the writer",
                task.name,
                force_to_archive.len()
            );
        }
        force_to_archive
    }

    fn prune(
        &self,
        task: &Task,
        catalogue: &mut Catalogue,
        max_storage_time: Duration,
        warning: &mut dyn FnMut(String, String),
    ) -> Result<()> {
        let cutoff = SystemTime::now()
            .checked_sub(max_storage_time)
            .unwrap_or(UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let snapshots = catalogue.snapshots().to_vec();
        let mut to_remove = 0;
        for descriptor in snapshots.iter().skip(1).rev() {
            if descriptor.time_created < cutoff {
                to_remove += 1;
            } else {
                break;
            }
        }

        for _ in 0..to_remove {
            let tail = catalogue
                .snapshots()
                .last()
                .cloned()
                .expect("to_remove bounded by snapshot count");
            let state = SnapshotState::load(
                &catalogue.snapshot_path(&tail.name),
                tail.filters.clone(),
                task.password.as_deref(),
            )?;
            if let Err(e) = catalogue.remove_fs_state(&tail.name, &state) {
                warning(task.name.clone(), format!("prune failed: {e}"));
                return Err(e);
            }
            let _ = self.host.remove_file(&catalogue.snapshot_path(&tail.name));
        }
        Ok(())
    }
}

fn fresh_nonce() -> [u8; crate::pipes::crypto::NONCE_LEN] {
    let mut nonce = [0u8; crate::pipes::crypto::NONCE_LEN];
    getrandom::getrandom(&mut nonce).expect("system RNG must be available");
    nonce
}

fn unique_snapshot_name(host: &dyn HostFs, archive_dir: &Path) -> String {
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let base = format!("s{stamp}");
    if !host.exists(&archive_dir.join(&base)) {
        return base;
    }
    for n in 1.. {
        let candidate = format!("{base}#{n}");
        if !host.exists(&archive_dir.join(&candidate)) {
            return candidate;
        }
    }
    unreachable!()
}
