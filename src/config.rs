//! Reads `archivarius.conf`: a TOML file listing one or more named
//! backup tasks. Grounded in `original_source/src/config.c++` (a
//! property-tree file of named `task` blocks) but expressed as TOML,
//! the teacher's own configuration format.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::archive_action::Task;
use crate::error::{ArchivariusError, Result};

const CONFIG_FILE_NAME: &str = "archivarius.conf";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "task", default)]
    tasks: Vec<TaskConfig>,
}

#[derive(Debug, Deserialize)]
struct TaskConfig {
    name: String,
    archive: PathBuf,
    root: Option<PathBuf>,
    #[serde(default)]
    include: Vec<PathBuf>,
    #[serde(default)]
    exclude: Vec<PathBuf>,
    #[serde(default)]
    max_storage_time: Option<String>,
    #[serde(default)]
    process_acls: bool,
    #[serde(default)]
    compress: bool,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    min_content_file_size: u64,
}

/// Finds `archivarius.conf` by searching, in order, `$HOME/.config`,
/// `/usr/local/etc`, `/etc`.
pub fn default_config_path() -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".config"));
    }
    candidates.push(PathBuf::from("/usr/local/etc"));
    candidates.push(PathBuf::from("/etc"));

    for dir in &candidates {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            return Ok(path);
        }
    }

    let searched = candidates
        .iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(ArchivariusError::UserInputError(format!(
        "{CONFIG_FILE_NAME} was not found in: {searched}"
    )))
}

/// Parses every `[[task]]` in `path` into a [`Task`]. Rejects duplicate
/// task names and duplicate archive paths up front, matching the
/// original's validation.
pub fn read_config(path: &Path) -> Result<Vec<Task>> {
    let text = std::fs::read_to_string(path).map_err(|e| ArchivariusError::io(path, e))?;
    let parsed: ConfigFile = toml::from_str(&text).map_err(|e| {
        ArchivariusError::UserInputError(format!("{}: {e}", path.display()))
    })?;

    let mut names = HashSet::new();
    let mut archive_paths = HashSet::new();
    let mut tasks = Vec::with_capacity(parsed.tasks.len());
    for task_config in parsed.tasks {
        if !names.insert(task_config.name.clone()) {
            return Err(ArchivariusError::UserInputError(format!(
                "task named '{}' already exists",
                task_config.name
            )));
        }
        if !archive_paths.insert(task_config.archive.clone()) {
            return Err(ArchivariusError::UserInputError(format!(
                "a task with archive '{}' already exists",
                task_config.archive.display()
            )));
        }
        tasks.push(to_task(task_config)?);
    }
    Ok(tasks)
}

fn to_task(cfg: TaskConfig) -> Result<Task> {
    let max_storage_time = cfg
        .max_storage_time
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    Ok(Task {
        name: cfg.name,
        archive_path: cfg.archive,
        root: cfg.root,
        files_to_archive: cfg.include,
        files_to_exclude: cfg.exclude.into_iter().collect(),
        password: cfg.password,
        compress: cfg.compress,
        process_acls: cfg.process_acls,
        min_content_file_size: cfg.min_content_file_size,
        max_storage_time,
    })
}

/// Parses a storage-time value like `"30d"`, `"4w"`, `"6m"`, `"2y"`.
/// The trailing letter picks the unit (day/week/month≈31d/year≈365d);
/// everything before it must be an integer count.
fn parse_duration(text: &str) -> Result<Duration> {
    let bad = || {
        ArchivariusError::UserInputError(
            "'max_storage_time' value must end on 'd', 'w', 'm' or 'y'".into(),
        )
    };
    let unit_char = text.chars().last().ok_or_else(bad)?;
    let multiplier: u64 = match unit_char {
        'd' => 24 * 3600,
        'w' => 7 * 24 * 3600,
        'm' => 31 * 24 * 3600,
        'y' => 365 * 24 * 3600,
        _ => return Err(bad()),
    };
    let count: u64 = text[..text.len() - 1]
        .parse()
        .map_err(|_| ArchivariusError::UserInputError(format!("invalid max_storage_time '{text}'")))?;
    Ok(Duration::from_secs(count * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archivarius.conf");
        std::fs::write(
            &path,
            r#"
            [[task]]
            name = "home"
            archive = "/backups/home"
            root = "/home/user"
            include = []
            exclude = ["cache"]
            max_storage_time = "30d"
            compress = true
            "#,
        )
        .unwrap();

        let tasks = read_config(&path).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "home");
        assert_eq!(tasks[0].max_storage_time, Some(Duration::from_secs(30 * 24 * 3600)));
        assert!(tasks[0].compress);
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archivarius.conf");
        std::fs::write(
            &path,
            r#"
            [[task]]
            name = "home"
            archive = "/backups/a"

            [[task]]
            name = "home"
            archive = "/backups/b"
            "#,
        )
        .unwrap();
        assert!(read_config(&path).is_err());
    }

    #[test]
    fn rejects_bad_duration_suffix() {
        assert!(parse_duration("30x").is_err());
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(2 * 7 * 24 * 3600));
    }
}
