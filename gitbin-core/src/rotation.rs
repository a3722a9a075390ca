//! Storage bin rotation: pick the bin that receives the next segment and
//! mint a new one once the newest bin would overflow.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::Error;
use crate::fs::Fs;
use crate::transport::Transport;

/// A bin directory as found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bin {
    pub seq: u64,
    pub name: String,
    pub path: PathBuf,
}

/// Rotation context for one run. Allocation reads the newest bin's current
/// footprint, so a single context must own all allocations against a
/// backup location.
#[derive(Clone, Debug)]
pub struct BinRotation {
    root: PathBuf,
    convention: String,
    max_bytes: u64,
    minted: Vec<String>,
}

impl BinRotation {
    pub fn new(root: impl Into<PathBuf>, convention: impl Into<String>, max_bytes: u64) -> Self {
        Self { root: root.into(), convention: convention.into(), max_bytes, minted: Vec::new() }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.backup_location.clone(),
            settings.bin_naming_convention.clone(),
            settings.max_bin_bytes(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Names of bins minted by this context, oldest first.
    pub fn minted(&self) -> &[String] {
        &self.minted
    }

    pub fn bin_name(&self, seq: u64) -> String {
        format!("{}{}", self.convention, seq)
    }

    pub fn bin_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Sequence number encoded in a directory name. `None` when the name does
    /// not carry the convention prefix; an error when it does but the rest
    /// is not a decimal number.
    pub fn parse_seq(&self, dir_name: &str) -> Result<Option<u64>> {
        let Some(rest) = dir_name.strip_prefix(self.convention.as_str()) else {
            return Ok(None);
        };
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Config(format!(
                "directory {:?} matches bin prefix {:?} but has no sequence number",
                dir_name, self.convention
            ))
            .into());
        }
        let seq = rest.parse::<u64>().map_err(|e| {
            Error::Config(format!("bad sequence number in {:?}: {e}", dir_name))
        })?;
        Ok(Some(seq))
    }

    /// Existing bins ordered by sequence number.
    pub fn bins(&self, fs: &dyn Fs) -> Result<Vec<Bin>> {
        let mut out = Vec::new();
        for dir in fs.list_dirs(&self.root)? {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(seq) = self.parse_seq(name)? {
                out.push(Bin { seq, name: name.to_string(), path: dir.clone() });
            }
        }
        out.sort_by_key(|b| b.seq);
        Ok(out)
    }

    /// Sum of the sizes of files directly inside the bin.
    pub fn footprint(fs: &dyn Fs, bin: &Path) -> Result<u64> {
        let mut total = 0u64;
        for f in fs.list_files(bin, false)? {
            total += fs.file_len(&f)?;
        }
        Ok(total)
    }

    /// Bin that should receive a segment of `size` bytes.
    pub fn allocate(&mut self, fs: &dyn Fs, transport: &dyn Transport, size: u64) -> Result<Bin> {
        let bins = self.bins(fs)?;
        let Some(newest) = bins.last() else {
            return self.mint(fs, transport, 0, size);
        };
        let used = Self::footprint(fs, &newest.path)?;
        if used + size > self.max_bytes {
            debug!(bin = %newest.name, used, size, max = self.max_bytes, "bin full");
            return self.mint(fs, transport, newest.seq + 1, size);
        }
        Ok(newest.clone())
    }

    fn mint(&mut self, fs: &dyn Fs, transport: &dyn Transport, seq: u64, size: u64) -> Result<Bin> {
        if size > self.max_bytes {
            return Err(Error::Config(format!(
                "segment of {} bytes can never fit a bin of {} bytes",
                size, self.max_bytes
            ))
            .into());
        }
        let name = self.bin_name(seq);
        let path = self.bin_path(&name);
        fs.create_dir_all(&path)?;
        if let Err(e) = transport.init_bin(&path) {
            // An uninitialized directory would be taken for the newest bin
            // by the next run.
            fs.remove_dir_all(&path)?;
            return Err(e.context(format!("initialize bin {name}")));
        }
        info!(bin = %name, "minted new bin");
        self.minted.push(name.clone());
        Ok(Bin { seq, name, path })
    }
}
