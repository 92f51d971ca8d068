use clap::{Parser, Subcommand};
use rarchive::archive::{Archive, OpenMode};
use rarchive::error::ArchiveError;
use rarchive::recovery;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "rarchive", about = "Read and write stored RAR 4.x archives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new archive from files and directories
    Create {
        #[arg(short, long)]
        output: PathBuf,
        /// Replace the archive if it already exists
        #[arg(short, long)]
        force: bool,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Append files and directories to an existing archive
    Add {
        archive: PathBuf,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Store a single input file under this name
        #[arg(long = "as")]
        name: Option<String>,
    },
    /// List archive contents
    List {
        archive: PathBuf,
        /// Include directory entries
        #[arg(long)]
        dirs: bool,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Extract entries into a directory
    Extract {
        archive: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Entry names to extract (default: all)
        names: Vec<String>,
    },
    /// Write one entry's content to stdout
    Cat {
        archive: PathBuf,
        name: String,
    },
    /// Rename an entry
    Rename {
        archive: PathBuf,
        old: String,
        new: String,
    },
    /// Delete an entry
    Delete {
        archive: PathBuf,
        name: String,
    },
    /// Check every block and content checksum
    Verify {
        archive: PathBuf,
    },
    /// Copy the healthy entries of a damaged archive into a new one
    Repair {
        archive: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { output, force, input } => {
            let mode = match (output.exists(), force) {
                (true, true)  => OpenMode::ReplaceExisting,
                (true, false) => return Err(format!("{} already exists (use --force)", output.display()).into()),
                (false, _)    => OpenMode::CreateNew,
            };
            let mut ar = Archive::open(&output, mode)?;
            for path in &input {
                add_tree(&mut ar, path)?;
            }
            ar.close()?;
            println!("Created: {}", output.display());
        }

        // ── Add ──────────────────────────────────────────────────────────────
        Commands::Add { archive, input, name } => {
            let mut ar = Archive::open(&archive, OpenMode::AppendOrRead)?;
            match (name, input.as_slice()) {
                (Some(name), [single]) => {
                    ar.add_file(single, Some(name.as_str()))?;
                    println!("  added   {} as {}", single.display(), name);
                }
                (Some(_), _) => return Err("--as needs exactly one input".into()),
                (None, _) => {
                    for path in &input {
                        add_tree(&mut ar, path)?;
                    }
                }
            }
            ar.close()?;
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { archive, dirs, json } => {
            let mut ar = Archive::open(&archive, OpenMode::AppendOrRead)?;
            let entries: Vec<_> = ar.entries()?
                .into_iter()
                .filter(|e| dirs || !e.is_directory())
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("Archive: {}", archive.display());
                println!("{:>5}  {:<40} {:>12} {:>8}  {:<19}", "Index", "Name", "Size", "CRC32", "Modified");
                for e in &entries {
                    let name = if e.is_directory() { format!("{}/", e.name) } else { e.name.clone() };
                    let modified = e.modified
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".into());
                    println!("{:>5}  {:<40} {:>12} {:08x}  {}", e.index, name, e.size, e.crc32, modified);
                }
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { archive, output_dir, names } => {
            let mut ar = Archive::open(&archive, OpenMode::AppendOrRead)?;
            let filter: Vec<&str> = names.iter().map(String::as_str).collect();
            let count = if filter.is_empty() {
                ar.extract_all(&output_dir)?
            } else {
                ar.extract_to(&output_dir, Some(filter.as_slice()))?
            };
            println!("Extracted {} file(s) to: {}", count, output_dir.display());
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { archive, name } => {
            let mut ar = Archive::open(&archive, OpenMode::AppendOrRead)?;
            let data = ar.get_content_by_name(&name, 0)?;
            std::io::stdout().lock().write_all(&data)?;
        }

        // ── Rename ───────────────────────────────────────────────────────────
        Commands::Rename { archive, old, new } => {
            let mut ar = Archive::open(&archive, OpenMode::AppendOrRead)?;
            ar.rename_by_name(&old, &new)?;
            ar.close()?;
            println!("Renamed: {} → {}", old, new);
        }

        // ── Delete ───────────────────────────────────────────────────────────
        Commands::Delete { archive, name } => {
            let mut ar = Archive::open(&archive, OpenMode::AppendOrRead)?;
            ar.delete_by_name(&name)?;
            ar.close()?;
            println!("Deleted: {}", name);
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { archive } => {
            let report = recovery::scan_file(&archive)?;
            println!("{}", report.summary());
            for block in report.block_log.iter().filter(|b| !b.is_usable()) {
                let name = block.entry.as_ref().map(|e| e.name.as_str()).unwrap_or("-");
                println!("  offset {:>10}  {:<24} {:?}", block.offset, name, block.health);
            }
            if !report.is_intact() {
                std::process::exit(1);
            }
        }

        // ── Repair ───────────────────────────────────────────────────────────
        Commands::Repair { archive, output } => {
            let repaired = recovery::repair(&archive, &output)?;
            println!("{}", repaired.report.summary());
            println!("Recovered {} file(s) into {} ({} skipped)",
                repaired.recovered_files, output.display(), repaired.skipped);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Add `root` to the archive: a file directly, a directory recursively.
/// Entry names are relative to the parent of `root`.
fn add_tree(ar: &mut Archive, root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let base = root.parent().unwrap_or_else(|| Path::new(""));
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(base).unwrap_or(entry.path());
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            match ar.add_directory(&name) {
                // Top-level directories carry no separator and are not stored.
                Ok(()) | Err(ArchiveError::InvalidArgument(_)) => {}
                Err(e) => return Err(e.into()),
            }
        } else if entry.file_type().is_file() {
            match ar.add_file(entry.path(), Some(name.as_str())) {
                Ok(()) => println!("  added   {}", name),
                Err(e @ (ArchiveError::InvalidArgument(_) | ArchiveError::AlreadyExists(_))) => {
                    eprintln!("  skipped {}: {}", name, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
