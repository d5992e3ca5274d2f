//! # archivarius — deduplicating, versioned backup engine
//!
//! Format guarantees:
//! - An archive is a directory: one `catalog` file, zero or more snapshot
//!   (`s...`) files, zero or more content (`c...`) files. Hidden files are
//!   ignored; everything else not referenced by `catalog` is swept on load
//!   and on commit.
//! - All pipes (`pipes::Source` / `pipes::Sink`) pump bytes through a linear
//!   chain: checksum, then compression, then (optionally) encryption.
//! - The catalogue is committed via temp-file + rename with surrounding
//!   `fsync`s (`catalogue::Catalogue::commit`); a crash before rename never
//!   corrupts the previously-committed state.
//! - Only one process may hold an archive open for writing at a time
//!   (`hostfs::HostFs::lock_archive`).

pub mod error;
pub mod pipes;
pub mod stream;
pub mod filters;
pub mod content_ref;
pub mod content_writer;
pub mod snapshot;
pub mod catalogue;
pub mod hostfs;
pub mod archive_action;
pub mod restore;
pub mod test_action;
pub mod config;

pub use error::{ArchivariusError, Result};
pub use catalogue::Catalogue;
pub use content_ref::{Checksum, ContentRef};
pub use snapshot::{FileRecord, FileType, SnapshotState};
pub use archive_action::{ArchiveAction, Task};
pub use restore::RestoreAction;
pub use test_action::TestAction;
pub use config::{default_config_path, read_config};
