use anyhow::{Context, Result};
use clap::Parser;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

use gitbin_core::backup::Backup;
use gitbin_core::codec::ZstdCodec;
use gitbin_core::config::{Settings, DEFAULT_CONFIG_FILE};
use gitbin_core::fs::OsFs;
use gitbin_core::restore;
use gitbin_core::store::JsonStore;
use gitbin_core::transport::GitTransport;

mod logging;

use logging::LogFormat;

const LOCK_FILE: &str = ".gitbin.lock";

#[derive(Parser)]
#[command(name = "gitbin", version, about = "Back up a directory into size-capped git repositories")]
struct Cli {
    /// Back up new and changed files
    #[arg(short, long, conflicts_with = "restore")]
    backup: bool,
    /// Restore every file recorded in the manifest
    #[arg(short, long)]
    restore: bool,
    /// Settings file; defaults apply when it does not exist
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long, value_enum, default_value_t = LogFormat::Human)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_format);

    if !cli.backup && !cli.restore {
        info!("no action requested (use -b to back up or -r to restore)");
        return Ok(());
    }
    let settings = Settings::load(&cli.config)?;
    if cli.backup {
        backup(&settings)
    } else {
        restore(&settings)
    }
}

/// Exclusive lock on `dir` for the lifetime of the returned handle.
fn lock_dir(dir: &Path) -> Result<File> {
    fs::create_dir_all(dir).with_context(|| format!("create dir {:?}", dir))?;
    let path = dir.join(LOCK_FILE);
    let f = File::create(&path).with_context(|| format!("create {:?}", path))?;
    f.try_lock_exclusive()
        .with_context(|| format!("{:?} is locked by another gitbin run", dir))?;
    Ok(f)
}

fn backup(settings: &Settings) -> Result<()> {
    let _lock = lock_dir(&settings.backup_location)?;
    let mut store = JsonStore::open(&settings.manifest_path())?;
    let transport = GitTransport::new(settings);
    let codec = ZstdCodec::default();
    let report = Backup::new(settings, &OsFs, &codec, &transport, &mut store).run()?;
    println!(
        "backup: {} new, {} updated, {} unchanged; {} segment(s), {} bin(s) published",
        report.added,
        report.updated,
        report.unchanged,
        report.segments_written,
        report.bins_published.len()
    );
    Ok(())
}

fn restore(settings: &Settings) -> Result<()> {
    let _lock = lock_dir(&settings.restore_location)?;
    let transport = GitTransport::new(settings);
    let report = restore::run(settings, &OsFs, &ZstdCodec::default(), &transport)?;
    println!(
        "restore: {} file(s) from {} bin(s) into {}",
        report.restored.len(),
        report.bins_fetched,
        settings.restore_target.display()
    );
    Ok(())
}
