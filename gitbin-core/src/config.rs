use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Error;

pub const DEFAULT_CONFIG_FILE: &str = "gitbin.json";
pub const DEFAULT_MANIFEST_NAME: &str = "manifest.json";

/// Run settings. Read from a camelCase JSON document; every field has a
/// default so a partial file is fine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Directory holding the bins and the manifest.
    pub backup_location: PathBuf,
    /// Directory whose files are backed up.
    pub source_location: PathBuf,
    /// Directory the bins are cloned into on restore.
    pub restore_location: PathBuf,
    /// Directory restored files are written to.
    pub restore_target: PathBuf,
    pub recursive: bool,
    /// Glob patterns (relative to `source_location`) left out of the listing.
    pub exclude: Vec<String>,
    pub segment_size_kb: u64,
    pub bin_size_kb: u64,
    pub bin_naming_convention: String,
    /// Directory holding one bare remote per bin.
    pub remote_location: PathBuf,
    pub overwrite_on_add: bool,
    /// Commit identity; together with `git_password` also the login used
    /// when talking to remotes.
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
    /// Remote password or token. Prefer `GITBIN_GIT_PASSWORD` over the file.
    #[serde(skip_serializing)]
    pub git_password: Option<String>,
    pub manifest_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_location: PathBuf::from("backup"),
            source_location: PathBuf::from("."),
            restore_location: PathBuf::from("restore"),
            restore_target: PathBuf::from("."),
            recursive: false,
            exclude: Vec::new(),
            segment_size_kb: 80_000,
            bin_size_kb: 800_000,
            bin_naming_convention: "gitBackup-".to_string(),
            remote_location: PathBuf::new(),
            overwrite_on_add: true,
            git_user_name: None,
            git_user_email: None,
            git_password: None,
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
        }
    }
}

/// Environment variables that override path settings after the file is read.
const ENV_OVERRIDES: &[&str] = &[
    "GITBIN_BACKUP_LOCATION",
    "GITBIN_SOURCE_LOCATION",
    "GITBIN_RESTORE_LOCATION",
    "GITBIN_RESTORE_TARGET",
    "GITBIN_REMOTE_LOCATION",
];

impl Settings {
    /// Read settings from `path` if it exists (defaults otherwise), apply
    /// `GITBIN_*` overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut s = if path.exists() {
            let f = File::open(path).with_context(|| format!("open {:?}", path))?;
            serde_json::from_reader(f).with_context(|| format!("parse settings {:?}", path))?
        } else {
            Settings::default()
        };
        s.apply_env(|k| std::env::var(k).ok());
        s.validate()?;
        Ok(s)
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(pw) = get("GITBIN_GIT_PASSWORD") {
            self.git_password = Some(pw);
        }
        for key in ENV_OVERRIDES {
            let Some(v) = get(key) else { continue };
            let v = PathBuf::from(v);
            match *key {
                "GITBIN_BACKUP_LOCATION" => self.backup_location = v,
                "GITBIN_SOURCE_LOCATION" => self.source_location = v,
                "GITBIN_RESTORE_LOCATION" => self.restore_location = v,
                "GITBIN_RESTORE_TARGET" => self.restore_target = v,
                "GITBIN_REMOTE_LOCATION" => self.remote_location = v,
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let conv = &self.bin_naming_convention;
        if conv.is_empty() {
            return Err(Error::Config("binNamingConvention must not be empty".into()).into());
        }
        if conv.contains('/') || conv.contains('\\') || conv.starts_with('.') {
            return Err(Error::Config(format!(
                "binNamingConvention {:?} must be a plain directory name prefix",
                conv
            ))
            .into());
        }
        if self.segment_size_kb == 0 || self.bin_size_kb == 0 {
            return Err(Error::Config("segment and bin sizes must be non-zero".into()).into());
        }
        if self.segment_size_kb > self.bin_size_kb {
            return Err(Error::Config(format!(
                "segmentSizeKb ({}) exceeds binSizeKb ({})",
                self.segment_size_kb, self.bin_size_kb
            ))
            .into());
        }
        if self.remote_location.as_os_str().is_empty() {
            return Err(Error::Config("remoteLocation is required".into()).into());
        }
        if self.git_password.is_some() && self.git_user_name.is_none() {
            return Err(Error::Config("a git password needs gitUserName".into()).into());
        }
        crate::path_safety::validate_name(&self.manifest_name)
            .map_err(|e| Error::Config(format!("manifestName: {e}")))?;
        Ok(())
    }

    pub fn max_segment_bytes(&self) -> u64 {
        self.segment_size_kb * 1024
    }

    pub fn max_bin_bytes(&self) -> u64 {
        self.bin_size_kb * 1024
    }

    /// Path of the manifest a backup run maintains.
    pub fn manifest_path(&self) -> PathBuf {
        self.backup_location.join(&self.manifest_name)
    }

    /// Where the codec writes segments before they are placed into bins.
    pub fn staging_dir(&self) -> PathBuf {
        self.backup_location.join(".staging")
    }

    /// Scratch area used to reassemble one file during restore.
    pub fn scratch_dir(&self) -> PathBuf {
        self.restore_location.join("temp")
    }
}
