//! Disk Catalog CLI
//!
//! Scans directory trees into a catalog and queries it.

use clap::{Parser, Subcommand};
use env_logger::Env;
use humansize::{format_size, BINARY};
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};

use disk_catalog::config::DEFAULT_DB_PATH;
use disk_catalog::{
    scan_roots, CatalogStore, FileEntry, ScanConfig, ScanConfigBuilder, ScanError, ScanErrorKind,
    ScanResult,
};

const ABOUT: &str = r#"
Disk Catalog - incremental disk cataloger

Examples:
  disk_catalog scan -r /                      Catalog the root volume
  disk_catalog scan -r /home -r /data         Catalog several trees
  disk_catalog scan -r /data --max-depth 2    Catalog two levels deep
  disk_catalog scan --config scan.json        Take settings from a file
  disk_catalog find '\.iso$'                  Search names by regex
  disk_catalog ls /home                       List catalogued children
  disk_catalog volumes                        List known volumes
"#;

/// Incremental disk cataloger
#[derive(Parser)]
#[command(name = "disk_catalog")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan trees into the catalog, pruning entries that no longer exist
    Scan {
        /// Root directory to scan (repeatable)
        #[arg(short = 'r', long = "root", required_unless_present = "config")]
        roots: Vec<PathBuf>,

        /// Catalog database path
        #[arg(short = 'd', long)]
        db: Option<PathBuf>,

        /// Maximum depth below each root (0 = root only)
        #[arg(long)]
        max_depth: Option<usize>,

        /// Print the summary and progress as JSON
        #[arg(long)]
        json: bool,

        /// Do not print progress
        #[arg(long)]
        no_progress: bool,

        /// Number of previous catalogs to keep
        #[arg(long)]
        keep_backups: Option<usize>,

        /// JSON config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Search catalogued names by regex (matched against lowercased names)
    Find {
        /// Regular expression
        pattern: String,

        /// Catalog database path
        #[arg(short = 'd', long)]
        db: Option<PathBuf>,

        /// Print matches as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the catalogued children of a path
    Ls {
        /// Absolute or relative path
        path: PathBuf,

        /// Catalog database path
        #[arg(short = 'd', long)]
        db: Option<PathBuf>,
    },

    /// List known volumes
    Volumes {
        /// Catalog database path
        #[arg(short = 'd', long)]
        db: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct FoundEntry<'a> {
    path: String,
    #[serde(flatten)]
    entry: &'a FileEntry,
}

#[derive(Serialize)]
struct ScanSummary<'a> {
    #[serde(flatten)]
    result: &'a ScanResult,
    errors: Vec<String>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Some(Commands::Scan {
            roots,
            db,
            max_depth,
            json,
            no_progress,
            keep_backups,
            config,
        }) => {
            let mut builder = match config {
                Some(path) => match ScanConfig::from_json_file(&path) {
                    Ok(loaded) => ScanConfigBuilder::from_config(loaded),
                    Err(e) => fail(e),
                },
                None => ScanConfig::builder(),
            };
            if !roots.is_empty() {
                builder = builder.roots(roots);
            }
            if let Some(db) = db {
                builder = builder.db_path(db);
            }
            if max_depth.is_some() {
                builder = builder.max_depth(max_depth);
            }
            if let Some(keep) = keep_backups {
                builder = builder.keep_backups(keep);
            }
            if no_progress {
                builder = builder.show_progress(false);
            }
            if json {
                builder = builder.json_progress(true);
            }
            run_scan(&builder.build(), json)
        }
        Some(Commands::Find { pattern, db, json }) => run_find(&db_or_default(db), &pattern, json),
        Some(Commands::Ls { path, db }) => run_ls(&db_or_default(db), &path),
        Some(Commands::Volumes { db }) => run_volumes(&db_or_default(db)),
        None => {
            println!("{}", ABOUT);
            println!("Use 'disk_catalog --help' for the full command reference");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        fail(e);
    }
}

fn fail(error: ScanError) -> ! {
    log::error!("{}", error);
    std::process::exit(1);
}

fn db_or_default(db: Option<PathBuf>) -> PathBuf {
    db.unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ScanError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ScanError::new(ScanErrorKind::Unknown, None, e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn run_scan(config: &ScanConfig, json: bool) -> Result<(), ScanError> {
    info!("Roots: {:?}", config.roots);
    info!("Catalog: {:?}", config.db_path);
    match config.max_depth {
        Some(depth) => info!("Max depth: {}", depth),
        None => info!("Max depth: unbounded"),
    }

    let results = scan_roots(config)?;

    if json {
        let summaries: Vec<ScanSummary<'_>> = results
            .iter()
            .map(|result| ScanSummary {
                result,
                errors: result.errors.iter().map(|e| e.to_string()).collect(),
            })
            .collect();
        return print_json(&summaries);
    }

    for (root, result) in config.roots.iter().zip(&results) {
        println!("Scan of {}:", root.display());
        println!("  Directories: {}", result.total_dirs);
        println!("  Files: {}", result.total_files);
        println!("  Symlinks: {}", result.total_symlinks);
        println!("  Other: {}", result.total_other);
        println!("  Size: {}", format_size(result.total_bytes, BINARY));
        println!("  Placeholders: {}", result.placeholders);
        println!("  Pruned: {}", result.pruned_entries);
        println!("  Skipped mounts: {}", result.skipped_mounts);
        println!("  Errors: {}", result.error_count());
        println!("  Duration: {}ms", result.duration_ms);
    }
    Ok(())
}

fn run_find(db: &Path, pattern: &str, json: bool) -> Result<(), ScanError> {
    let store = CatalogStore::open_read_only(db)?;
    let entries = store.find_by_name_regex(pattern)?;

    if json {
        let mut found = Vec::with_capacity(entries.len());
        for entry in &entries {
            found.push(FoundEntry {
                path: store.full_path(entry)?,
                entry,
            });
        }
        return print_json(&found);
    }

    for entry in &entries {
        println!("[{}] {}", entry.id, store.full_path(entry)?);
    }
    info!("{} matches", entries.len());
    Ok(())
}

fn run_ls(db: &Path, path: &Path) -> Result<(), ScanError> {
    let store = CatalogStore::open_read_only(db)?;
    let absolute = std::path::absolute(path)
        .map_err(|e| ScanError::invalid_path(path.to_path_buf(), e.to_string()))?;
    let entry = store
        .lookup_path(&absolute)?
        .ok_or_else(|| ScanError::not_found(absolute.clone()))?;

    for child in store.get_children(entry.id)? {
        println!(
            "{:<9} {:>10}  {}",
            child.file_type.as_str(),
            format_size(child.size, BINARY),
            child.name
        );
    }
    Ok(())
}

fn run_volumes(db: &Path) -> Result<(), ScanError> {
    let store = CatalogStore::open_read_only(db)?;
    for volume in store.volumes()? {
        println!(
            "[{}] {}\t{}\t{}\tblock {}",
            volume.id, volume.mount_point, volume.device, volume.file_system, volume.block_size
        );
    }
    Ok(())
}
