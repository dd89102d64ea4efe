//! skiff - background file operations for the skiff file manager.
//!
//! Usage:
//!   skiff copy SOURCE... DEST       Copy trees in the background
//!   skiff move SOURCE... DEST       Move trees, renaming when possible
//!   skiff delete PATH...            Delete trees depth-first
//!   skiff tar SOURCE... ARCHIVE     Pack into a tar-family archive
//!   skiff untar ARCHIVE... DIR      Extract tar archives
//!   skiff zip SOURCE... ARCHIVE     Pack into a zip archive
//!   skiff unzip ARCHIVE... DIR      Extract zip archives
//!
//! Conflicts prompt on the terminal; progress renders on stderr. The
//! full-screen front-end drives the same engine through `skiff_ops`.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result};

use skiff_core::FileEntry;
use skiff_ops::{
    ConflictChoice, ConflictPolicy, ConflictRequest, CreateMode, JobEvent, JobHandle,
    JobRegistry, JobState, PackOptions, TransferOptions,
};

#[derive(Parser)]
#[command(
    name = "skiff",
    version,
    about = "Background file operations for the skiff file manager",
    long_about = "Runs the skiff file-operation engine from the command line: \
                  copy, move, delete and archive trees in the background with \
                  interactive conflict prompts and live progress."
)]
struct Cli {
    /// Overwrite every conflicting destination without prompting
    #[arg(long, global = true, conflicts_with = "skip_existing")]
    overwrite: bool,

    /// Keep every conflicting destination without prompting
    #[arg(long = "skip-existing", global = true)]
    skip_existing: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy files or directory trees
    Copy {
        /// Source paths followed by the destination
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Move files or directory trees
    Move {
        /// Source paths followed by the destination
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Delete files or directory trees
    Delete {
        /// Paths to remove
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Pack sources into a tar-family archive (format follows the extension)
    Tar {
        /// Source paths followed by the archive to write
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// Folder name wrapped around every entry inside the archive
        #[arg(long)]
        wrap: Option<String>,

        /// Behavior when the archive already exists
        #[arg(long, value_enum, default_value = "create")]
        mode: ModeArg,
    },

    /// Extract tar archives into a directory
    Untar {
        /// Archive paths followed by the destination directory
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Pack sources into a zip archive
    Zip {
        /// Source paths followed by the archive to write
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// Folder name wrapped around every entry inside the archive
        #[arg(long)]
        wrap: Option<String>,

        /// Behavior when the archive already exists
        #[arg(long, value_enum, default_value = "create")]
        mode: ModeArg,
    },

    /// Extract zip archives into a directory
    Unzip {
        /// Archive paths followed by the destination directory
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum ModeArg {
    /// Fail if the archive already exists
    #[default]
    Create,
    /// Append entries to the existing archive
    Add,
    /// Replace the existing archive
    Overwrite,
}

impl From<ModeArg> for CreateMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Create => Self::Create,
            ModeArg::Add => Self::Add,
            ModeArg::Overwrite => Self::Overwrite,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let policy = if cli.overwrite {
        ConflictPolicy::ProceedAll
    } else if cli.skip_existing {
        ConflictPolicy::SkipAll
    } else {
        ConflictPolicy::Prompt
    };
    let transfer = TransferOptions { conflicts: policy };

    let mut registry = JobRegistry::new();
    let (_, handle) = match cli.command {
        Command::Copy { paths } => {
            let (sources, destination) = split_destination(paths)?;
            registry.copy(sources, destination, transfer)
        }
        Command::Move { paths } => {
            let (sources, destination) = split_destination(paths)?;
            registry.move_to(sources, destination, transfer)
        }
        Command::Delete { paths } => registry.delete(paths),
        Command::Tar { paths, wrap, mode } => {
            let (sources, destination) = split_destination(paths)?;
            registry.tar(
                sources,
                destination,
                PackOptions {
                    mode: mode.into(),
                    wrap,
                },
            )
        }
        Command::Untar { paths } => {
            let (archives, destination) = split_destination(paths)?;
            registry.untar(archives, destination)
        }
        Command::Zip { paths, wrap, mode } => {
            let (sources, destination) = split_destination(paths)?;
            registry.zip(
                sources,
                destination,
                PackOptions {
                    mode: mode.into(),
                    wrap,
                },
            )
        }
        Command::Unzip { paths } => {
            let (archives, destination) = split_destination(paths)?;
            registry.unzip(archives, destination)
        }
    };

    drive(handle).await
}

/// The last path is the destination; everything before it is a source.
fn split_destination(mut paths: Vec<PathBuf>) -> Result<(Vec<PathBuf>, PathBuf)> {
    let destination = paths
        .pop()
        .ok_or_else(|| eyre!("destination path missing"))?;
    Ok((paths, destination))
}

/// Service the runner's events until it reports a terminal state.
async fn drive(mut handle: JobHandle) -> Result<()> {
    while let Some(event) = handle.next_event().await {
        match event {
            JobEvent::Progress(progress) => {
                let rate = humansize::format_size(
                    progress.bytes_per_second() as u64,
                    humansize::BINARY,
                );
                eprint!(
                    "\r{:<60} {:>5.1}%  {}/s{}",
                    progress.label(),
                    progress.percentage(),
                    rate,
                    format_eta(progress.eta())
                );
                let _ = io::stderr().flush();
            }
            JobEvent::Conflict(request) => {
                let choice = prompt(&request)?;
                request.answer(choice);
            }
            JobEvent::Complete(complete) => {
                eprintln!();
                for error in &complete.errors {
                    eprintln!("  {error}");
                }
                let summary = complete.summary();
                return match complete.state {
                    JobState::Completed | JobState::Cancelled => {
                        eprintln!("{summary}");
                        Ok(())
                    }
                    _ => Err(eyre!(summary)),
                };
            }
        }
    }
    Err(eyre!("operation ended without reporting"))
}

/// Blocking terminal prompt for one conflict.
fn prompt(request: &ConflictRequest) -> Result<ConflictChoice> {
    eprintln!();
    eprintln!("already exists: {}", request.existing.path.display());
    eprintln!("  source:       {}", describe(&request.source));
    eprintln!("  destination:  {}", describe(&request.existing));

    let stdin = io::stdin();
    loop {
        eprint!("overwrite? [y]es / [n]o / ne[w]er / [a]ll / [s]kip all / [c]ancel: ");
        io::stderr().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(ConflictChoice::Cancel);
        }
        match line.trim() {
            "y" | "yes" => return Ok(ConflictChoice::Yes),
            "n" | "no" => return Ok(ConflictChoice::No),
            "w" | "newer" => return Ok(ConflictChoice::Newer),
            "a" | "all" => return Ok(ConflictChoice::YesAll),
            "s" | "skip" => return Ok(ConflictChoice::NoAll),
            "c" | "cancel" | "q" => return Ok(ConflictChoice::Cancel),
            _ => continue,
        }
    }
}

/// Size and mtime detail row for the conflict prompt.
fn describe(entry: &FileEntry) -> String {
    let size = humansize::format_size(entry.size, humansize::BINARY);
    let mtime: chrono::DateTime<chrono::Local> = entry.mtime.into();
    format!("{:>10}  {}", size, mtime.format("%Y-%m-%d %H:%M:%S"))
}

fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => format!("  eta {}s", eta.as_secs()),
        None => String::new(),
    }
}
