use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::Settings;
use crate::error::Error;
use crate::fs::Fs;
use crate::manifest::RestoreEntry;
use crate::path_safety::validate_name;
use crate::store::{JsonStore, ManifestStore};
use crate::transport::Transport;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub bins_fetched: usize,
    pub restored: Vec<PathBuf>,
    /// Entries whose segments were corrupt or could not be decoded.
    pub failed: Vec<String>,
}

/// Directories restore works with.
#[derive(Clone, Debug)]
pub struct RestoreLayout {
    /// Holds one local mirror per bin, named after the bin.
    pub mirrors: PathBuf,
    /// Shared scratch area, wiped after every file.
    pub scratch: PathBuf,
    /// Where rebuilt files land.
    pub target: PathBuf,
}

impl RestoreLayout {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mirrors: settings.restore_location.clone(),
            scratch: settings.scratch_dir(),
            target: settings.restore_target.clone(),
        }
    }
}

/// Full restore: fetch every bin, load the manifest recovered from them and
/// rebuild each file.
pub fn run(
    settings: &Settings,
    fs: &dyn Fs,
    codec: &dyn Codec,
    transport: &dyn Transport,
) -> Result<RestoreReport> {
    fs.create_dir_all(&settings.restore_target)?;
    fs.create_dir_all(&settings.restore_location)?;

    info!("restoring git repositories to manifest location..");
    let mirrors = transport.fetch_all(&settings.manifest_name)?;

    info!("finding files to restore..");
    let store = JsonStore::open_existing(&settings.restore_location.join(&settings.manifest_name))?;
    let entries = store.all_entries_for_restore()?;

    info!(files = entries.len(), "restoring files..");
    let layout = RestoreLayout::from_settings(settings);
    let mut report = restore_all(fs, codec, &entries, &layout)?;
    report.bins_fetched = mirrors.len();
    info!(restored = report.restored.len(), failed = report.failed.len(), "restore complete");
    if !report.failed.is_empty() {
        return Err(Error::FilesFailed(report.failed).into());
    }
    Ok(report)
}

/// Restore every entry. A corrupt or undecodable entry is logged, listed in
/// `failed` and skipped; any other error ends the run.
pub fn restore_all(
    fs: &dyn Fs,
    codec: &dyn Codec,
    entries: &[RestoreEntry],
    layout: &RestoreLayout,
) -> Result<RestoreReport> {
    fs.create_dir_all(&layout.target)?;
    let mut report = RestoreReport::default();
    for e in entries {
        match restore_entry(fs, codec, e, layout) {
            Ok(dest) => report.restored.push(dest),
            Err(err) if Error::is_file_local(&err) => {
                warn!(file = %e.entry.file_name, error = %format!("{err:#}"), "file not restored");
                report.failed.push(e.entry.file_name.clone());
            }
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}

/// Rebuild one file into `layout.target`. The scratch area is removed
/// afterwards whether or not the rebuild succeeded.
pub fn restore_entry(
    fs: &dyn Fs,
    codec: &dyn Codec,
    item: &RestoreEntry,
    layout: &RestoreLayout,
) -> Result<PathBuf> {
    let result = gather_and_rebuild(fs, codec, item, layout);
    let cleanup = fs.remove_dir_all(&layout.scratch);
    let dest = result.with_context(|| format!("restore {}", item.entry.file_name))?;
    cleanup?;
    Ok(dest)
}

fn gather_and_rebuild(
    fs: &dyn Fs,
    codec: &dyn Codec,
    item: &RestoreEntry,
    layout: &RestoreLayout,
) -> Result<PathBuf> {
    let file_name = &item.entry.file_name;
    validate_name(file_name)?;
    if item.segments.is_empty() {
        return Err(Error::MissingSegment(PathBuf::from(file_name)).into());
    }
    fs.create_dir_all(&layout.scratch)?;

    let mut staged = Vec::with_capacity(item.segments.len());
    for loc in &item.segments {
        validate_name(&loc.bin.name)?;
        validate_name(&loc.segment.segment_name)?;
        let src = layout.mirrors.join(&loc.bin.name).join(&loc.segment.segment_name);
        if !fs.exists(&src) {
            return Err(Error::MissingSegment(src).into());
        }
        if let Some(expected) = &loc.segment.hash_hex {
            if fs.digest(&src)?.to_hex().as_str() != expected.as_str() {
                return Err(Error::DigestMismatch(src).into());
            }
        }
        let dst = layout.scratch.join(&loc.segment.segment_name);
        fs.copy(&src, &dst, true)?;
        staged.push(dst);
    }

    let rebuilt = codec
        .reconstruct(&staged)
        .map_err(|e| Error::Codec(format!("reconstruct {file_name}: {e:#}")))?;
    debug!(file = %file_name, rebuilt = %rebuilt.display(), "reconstructed");

    // The codec decides how deep below scratch the file ends up.
    let found = fs
        .find_file(&layout.scratch, file_name)?
        .ok_or_else(|| Error::Codec(format!("{file_name} not found after reconstruction")))?;
    let dest = layout.target.join(file_name);
    fs.copy(&found, &dest, true)?;
    debug!(file = %file_name, dest = %dest.display(), "restored");
    Ok(dest)
}
