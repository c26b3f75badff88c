use std::io::{Seek, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ratar_core::config::Config;
use ratar_core::index::default_index_path;
use ratar_core::mount::tar_source::TarMountSource;
use ratar_core::open::open_or_build_index;
use ratar_core::{MountSource, RatarError};

#[derive(Parser)]
#[command(name = "ratar", version, about = "Random-access TAR archive indexing")]
struct Cli {
    /// Increase log verbosity (repeatable); defaults to the RUST_LOG env var.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or reuse) the on-disk index for an archive.
    Index {
        archive: PathBuf,
        #[arg(long)]
        index_path: Option<PathBuf>,
        /// Force a full rebuild even if an existing index validates.
        #[arg(long)]
        force: bool,
        /// Honor two-zero-block EOF only when unset (supports `tar --concatenate`).
        #[arg(long)]
        ignore_zeros: bool,
    },
    /// Print the attributes of one path inside the archive.
    Stat { archive: PathBuf, path: String },
    /// List one directory level inside the archive.
    Ls { archive: PathBuf, path: String },
    /// Print the contents of one file inside the archive to stdout.
    Cat { archive: PathBuf, path: String },
    /// Print index metadata and statfs-equivalent info for an archive.
    MountInfo { archive: PathBuf },
    /// Index-bypass recovery scan: reconstruct a file list without the
    /// on-disk index, tolerating corrupt/truncated headers.
    Scan {
        archive: PathBuf,
        #[arg(long)]
        verbose: bool,
        /// Salvage every healthy regular file into this directory.
        #[arg(long)]
        extract_to: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::default();

    match cli.command {
        Commands::Index { archive, index_path, force, ignore_zeros } => {
            let index_path = index_path.unwrap_or_else(|| default_index_path(&archive));
            let mut config = config;
            config.ignore_zeros = ignore_zeros;
            let (index, _stream) = open_or_build_index(&archive, &index_path, &config, force)?;
            let meta = index.read_meta()?;
            println!("Index:        {}", index_path.display());
            println!("Archive size: {} B", meta.archive_size);
            println!("Backend:      {}", meta.backend_name);
            println!("Schema:       {}", meta.schema_version);
        }

        Commands::Stat { archive, path } => {
            let source = open_mount_source(&archive, &config)?;
            match source.lookup(&path)? {
                Some(entry) => {
                    println!("path:      {}", entry.full_path());
                    println!("size:      {}", entry.size);
                    println!("mode:      {:o}", entry.mode);
                    println!("uid:gid:   {}:{}", entry.uid, entry.gid);
                    println!("mtime:     {}", entry.mtime);
                    println!("kind:      {:?}", entry.kind);
                    println!("version:   {}", entry.version);
                    println!("nested:    {}", entry.is_nested_archive);
                }
                None => {
                    eprintln!("{path}: not found");
                    std::process::exit(1);
                }
            }
        }

        Commands::Ls { archive, path } => {
            let source = open_mount_source(&archive, &config)?;
            for entry in source.list(&path)? {
                let marker = match entry.kind {
                    ratar_core::EntryKind::Directory => "/",
                    ratar_core::EntryKind::Symlink => "@",
                    _ => "",
                };
                println!("{:>10}  {}{}", entry.size, entry.name, marker);
            }
        }

        Commands::Cat { archive, path } => {
            let source = open_mount_source(&archive, &config)?;
            let entry = source
                .lookup(&path)?
                .ok_or_else(|| RatarError::NotFound(path.clone()))?;
            let reader = source.open(&entry)?;
            let stream = reader.lock().expect("stencil mutex poisoned");
            let bytes = stream.read_all_parallel(&ratar_core::CancellationToken::new())?;
            std::io::stdout().write_all(&bytes)?;
        }

        Commands::MountInfo { archive } => {
            let index_path = default_index_path(&archive);
            let (index, _stream) = open_or_build_index(&archive, &index_path, &config, false)?;
            let meta = index.read_meta()?;
            println!("── ratar mount info ─────────────────────────────");
            println!("  Archive        {}", archive.display());
            println!("  Index          {}", index_path.display());
            println!("  Archive size   {} B", meta.archive_size);
            println!("  Backend        {}", meta.backend_name);
            println!("  Backend vers.  {}", meta.backend_version);
            println!("  Schema vers.   {}", meta.schema_version);
            println!("  ignore_zeros   {}", meta.ignore_zeros);
        }

        Commands::Scan { archive, verbose, extract_to } => {
            use ratar_core::recovery;

            let (_backend, stream) = ratar_core::open_seekable_stream(&archive, &config)?;
            let bytes = {
                let mut guard = stream.lock().expect("stream mutex poisoned");
                ratar_core::seekable::read_all(&mut *guard)?
            };
            let mut cursor = std::io::Cursor::new(bytes);

            let report = if let Some(dst) = &extract_to {
                recovery::extract_recoverable(&mut cursor, dst)?
            } else {
                cursor.seek(std::io::SeekFrom::Start(0))?;
                recovery::scan::<_, fn(u64, u64)>(&mut cursor, 0, None)?
            };

            println!("{}", report.summary());
            println!("  Blocks scanned:   {}", report.total_scanned);
            println!("  Healthy blocks:   {}", report.healthy_blocks);
            println!("  Corrupt blocks:   {}", report.corrupt_blocks);
            println!("  Truncated blocks: {}", report.truncated_blocks);
            println!("  Unknown typeflag: {}", report.unknown_typeflag_blocks);
            if report.bytes_deduplicated > 0 {
                println!("  Deduplicated:     {} B", report.bytes_deduplicated);
            }

            if verbose {
                println!();
                println!("  ── Block log ──────────────────────────────");
                for (i, sb) in report.block_log.iter().enumerate() {
                    let status = match &sb.health {
                        recovery::BlockHealth::Healthy => "ok".to_string(),
                        recovery::BlockHealth::HeaderCorrupt => "corrupt header".to_string(),
                        recovery::BlockHealth::TruncatedPayload { declared, available } => {
                            format!("truncated ({declared} declared, {available} available)")
                        }
                        recovery::BlockHealth::UnknownTypeflag { byte } => {
                            format!("unknown typeflag {byte:#x}")
                        }
                    };
                    println!("  [{i:4}] @{:>10}  {status}", sb.archive_offset);
                }
            }
        }
    }

    Ok(())
}

/// Open a plain (non-union, non-recursive) `TarMountSource` for one
/// archive path, building or reusing its index as needed.
fn open_mount_source(archive: &PathBuf, config: &Config) -> Result<Arc<dyn MountSource>, Box<dyn std::error::Error>> {
    let index_path = default_index_path(archive);
    let (index, stream) = open_or_build_index(archive, &index_path, config, false)?;
    Ok(Arc::new(TarMountSource::new(index, stream)))
}
