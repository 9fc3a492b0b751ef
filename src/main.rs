use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use polyfs::resource::SearchPathResolver;
use polyfs::{EntryMetadata, FileHandle, open_descriptor, open_resource};

#[derive(Debug, Parser)]
#[command(name = "polyfs", version, about = "File operations on local, archive, FTP and SFTP targets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the children of a directory.
    Ls {
        target: String,
        #[arg(short, long)]
        long: bool,
    },
    /// Print file content.
    Cat { target: String },
    /// Print every descendant of a directory.
    Tree { target: String },
    /// Copy a local file to the target.
    Put { target: String, source: PathBuf },
    /// Delete a file or an empty directory.
    Rm {
        target: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory and its missing parents.
    Mkdir { target: String },
    /// Resolve a resource name through POLYFS_RESOURCE_PATH and show it.
    Resource { name: String },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut handle = match &cli.command {
        Command::Resource { name } => open_resource(&SearchPathResolver::from_env(), name)?,
        Command::Ls { target, .. }
        | Command::Cat { target }
        | Command::Tree { target }
        | Command::Put { target, .. }
        | Command::Rm { target, .. }
        | Command::Mkdir { target } => open_descriptor(target)?,
    };
    debug!(target_handle = %handle, "handle opened");

    let outcome = run(&cli.command, handle.as_mut());
    let closed = handle.close();
    outcome?;
    closed?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run(command: &Command, handle: &mut (dyn FileHandle + 'static)) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match command {
        Command::Ls { long, .. } => list(handle, *long, &mut out),
        Command::Cat { .. } => cat(handle, &mut out),
        Command::Tree { .. } => {
            writeln!(out, "{handle}")?;
            print_tree(handle, 1, &mut out)
        }
        Command::Put { source, .. } => {
            let mut file = File::open(source)?;
            let copied = handle.copy_from(&mut file)?;
            info!(bytes = copied, "copied {} to {handle}", source.display());
            Ok(())
        }
        Command::Rm { recursive, .. } => {
            if !handle.exists()? {
                bail!("{handle} does not exist");
            }
            if *recursive {
                handle.delete_recursive()?;
            } else {
                handle.delete()?;
            }
            info!("deleted {handle}");
            Ok(())
        }
        Command::Mkdir { .. } => {
            if !handle.mkdirs()? {
                bail!("could not create {handle}");
            }
            Ok(())
        }
        Command::Resource { .. } => {
            if handle.is_directory()? {
                list(handle, false, &mut out)
            } else {
                cat(handle, &mut out)
            }
        }
    }
}

fn list(handle: &mut (dyn FileHandle + 'static), long: bool, out: &mut impl Write) -> Result<()> {
    if !handle.is_directory()? {
        bail!("{handle} is not a directory");
    }
    let mut children = handle.iterate()?;
    while let Some(child) = children.next_child() {
        let mut child = child?;
        if long {
            let metadata = child.metadata()?;
            writeln!(out, "{} {}", format_metadata(metadata.as_ref()), child.name())?;
        } else {
            writeln!(out, "{}", child.name())?;
        }
    }
    Ok(())
}

fn cat(handle: &mut (dyn FileHandle + 'static), out: &mut impl Write) -> Result<()> {
    let mut reader = handle.open_read()?;
    io::copy(&mut reader, out)?;
    reader.close()?;
    Ok(())
}

fn print_tree(
    handle: &mut (dyn FileHandle + 'static),
    depth: usize,
    out: &mut impl Write,
) -> Result<()> {
    let mut children = handle.iterate()?;
    while let Some(child) = children.next_child() {
        let mut child = child?;
        let is_dir = child.is_directory()?;
        let suffix = if is_dir { "/" } else { "" };
        writeln!(out, "{}{}{suffix}", "  ".repeat(depth), child.name())?;
        if is_dir {
            print_tree(&mut *child, depth + 1, out)?;
        }
    }
    Ok(())
}

fn format_metadata(metadata: Option<&EntryMetadata>) -> String {
    let Some(metadata) = metadata else {
        return format!("{:<1} {:>8} {:<16}", "?", "-", "-");
    };
    let kind = if metadata.is_dir { "d" } else { "-" };
    let size = if metadata.is_dir {
        "-".to_string()
    } else {
        human_size(metadata.size)
    };
    let modified = metadata
        .modified
        .map(|ts| {
            let dt: DateTime<Local> = DateTime::<Local>::from(ts);
            dt.format("%Y-%m-%d %H:%M").to_string()
        })
        .unwrap_or_else(|| "-".to_string());
    format!("{kind:<1} {size:>8} {modified:<16}")
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut size = bytes as f64;
    let mut unit_idx = 0usize;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes}{}", UNITS[unit_idx])
    } else {
        format!("{size:.1}{}", UNITS[unit_idx])
    }
}
