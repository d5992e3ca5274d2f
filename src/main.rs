use std::path::PathBuf;
use std::process::ExitCode;

use archivarius::hostfs::HostFs;
use archivarius::{ArchiveAction, Catalogue, RestoreAction, Task, TestAction};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "archivarius", version, about = "Deduplicating, versioned backup engine")]
struct Cli {
    /// Path to the config file; defaults to the platform search order.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task (by name) or every task from the config file.
    Archive {
        name: Option<String>,
    },
    /// Rebuild a snapshot's files under a target directory.
    Restore {
        /// Archive path, used directly instead of looking up a task by name.
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Task name to look up in the config file instead of `--archive`.
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        target_dir: PathBuf,
        /// Snapshot index, 0 = most recent.
        #[arg(long, default_value_t = 0)]
        id: usize,
        #[arg(long)]
        prefix: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Print snapshot indices and creation times.
    List {
        archive: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Dump a snapshot's file records.
    ListFiles {
        archive: PathBuf,
        #[arg(long, default_value_t = 0)]
        id: usize,
        #[arg(long)]
        password: Option<String>,
    },
    /// Delete a snapshot and commit.
    Remove {
        archive: PathBuf,
        #[arg(long)]
        id: usize,
        #[arg(long)]
        password: Option<String>,
    },
    /// Verify an archive's integrity.
    Test {
        archive: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Print the build version.
    Version,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut warned = false;
    let mut warning = |header: String, message: String| {
        warned = true;
        eprintln!("warning: {header}: {message}");
    };

    let result = run(cli, &mut warning);

    match result {
        Ok(()) if warned => ExitCode::from(1),
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli, warning: &mut dyn FnMut(String, String)) -> archivarius::Result<()> {
    let host = archivarius::hostfs::PosixHostFs;

    match cli.command {
        // ── Archive ──────────────────────────────────────────────────────
        Commands::Archive { name } => {
            let config_path = resolve_config_path(cli.config)?;
            let tasks = archivarius::read_config(&config_path)?;
            let action = ArchiveAction::new(&host);
            let to_run: Vec<Task> = match name {
                Some(name) => tasks
                    .into_iter()
                    .filter(|t| t.name == name)
                    .collect(),
                None => tasks,
            };
            if to_run.is_empty() {
                return Err(archivarius::ArchivariusError::UserInputError(
                    "no matching task in config file".into(),
                ));
            }
            for task in &to_run {
                log::info!("archiving task '{}'", task.name);
                action.run(task, warning)?;
            }
        }

        // ── Restore ──────────────────────────────────────────────────────
        Commands::Restore {
            archive,
            name,
            target_dir,
            id,
            prefix,
            password,
        } => {
            let (archive_path, password) =
                resolve_archive_and_password(cli.config, archive, name, password)?;
            RestoreAction::new(&host).run(
                &archive_path,
                password.as_deref(),
                &target_dir,
                id,
                prefix.as_deref(),
                warning,
            )?;
            println!("restored → {}", target_dir.display());
        }

        // ── List ─────────────────────────────────────────────────────────
        Commands::List { archive, password } => {
            let catalogue =
                Catalogue::open(&host, &archive, password.as_deref(), password.is_some())?;
            for (index, descriptor) in catalogue.snapshots().iter().enumerate() {
                println!("{:>4}  {}  {}", index, format_time(descriptor.time_created), descriptor.name);
            }
        }

        // ── List-files ───────────────────────────────────────────────────
        Commands::ListFiles { archive, id, password } => {
            let catalogue =
                Catalogue::open(&host, &archive, password.as_deref(), password.is_some())?;
            let descriptor = catalogue
                .snapshots()
                .get(id)
                .ok_or_else(|| archivarius::ArchivariusError::UserInputError(format!("no snapshot #{id}")))?
                .clone();
            let state = archivarius::SnapshotState::load(
                &catalogue.snapshot_path(&descriptor.name),
                descriptor.filters.clone(),
                password.as_deref(),
            )?;
            for record in state.files() {
                println!("{:?}  {}", record.file_type, record.path.display());
            }
        }

        // ── Remove ───────────────────────────────────────────────────────
        Commands::Remove { archive, id, password } => {
            let mut catalogue =
                Catalogue::open(&host, &archive, password.as_deref(), password.is_some())?;
            let descriptor = catalogue
                .snapshots()
                .get(id)
                .ok_or_else(|| archivarius::ArchivariusError::UserInputError(format!("no snapshot #{id}")))?
                .clone();
            if descriptor.name != catalogue.snapshots().last().unwrap().name {
                return Err(archivarius::ArchivariusError::UserInputError(
                    "only the oldest snapshot can be removed".into(),
                ));
            }
            let state = archivarius::SnapshotState::load(
                &catalogue.snapshot_path(&descriptor.name),
                descriptor.filters.clone(),
                password.as_deref(),
            )?;
            catalogue.remove_fs_state(&descriptor.name, &state)?;
            host.remove_file(&catalogue.snapshot_path(&descriptor.name))?;
            catalogue.commit()?;
            println!("removed snapshot #{id} ({})", descriptor.name);
        }

        // ── Test ─────────────────────────────────────────────────────────
        Commands::Test { archive, password } => {
            TestAction::new(&host).run(&archive, password.as_deref(), warning)?;
            println!("test complete for {}", archive.display());
        }

        // ── Version ──────────────────────────────────────────────────────
        Commands::Version => {
            println!("archivarius {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn resolve_config_path(explicit: Option<PathBuf>) -> archivarius::Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p),
        None => archivarius::default_config_path(),
    }
}

fn resolve_archive_and_password(
    config: Option<PathBuf>,
    archive: Option<PathBuf>,
    name: Option<String>,
    password: Option<String>,
) -> archivarius::Result<(PathBuf, Option<String>)> {
    if let Some(archive) = archive {
        return Ok((archive, password));
    }
    let name = name.ok_or_else(|| {
        archivarius::ArchivariusError::UserInputError("either --archive or --name is required".into())
    })?;
    let config_path = resolve_config_path(config)?;
    let tasks = archivarius::read_config(&config_path)?;
    let task = tasks
        .into_iter()
        .find(|t| t.name == name)
        .ok_or_else(|| archivarius::ArchivariusError::UserInputError(format!("no task named '{name}'")))?;
    Ok((task.archive_path, password.or(task.password)))
}

fn format_time(unix_seconds: i64) -> String {
    use chrono::{Local, TimeZone};
    match Local.timestamp_opt(unix_seconds, 0) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => unix_seconds.to_string(),
    }
}
