//! Change detection: list the source tree and sort files into new, updated
//! and unchanged by comparing the live mtime with the manifest's
//! `last_modified`. Time-based only, so a copy that preserves timestamps,
//! or clock skew between runs, can hide a change.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Error;
use crate::fs::Fs;
use crate::store::ManifestStore;

/// A file found in the source tree. `name` is the manifest key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    New,
    Updated,
    Unchanged,
}

#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub added: Vec<SourceFile>,
    pub updated: Vec<SourceFile>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty()
    }
}

pub fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for g in patterns {
        b.add(Glob::new(g).map_err(|e| Error::Config(format!("exclude pattern {g:?}: {e}")))?);
    }
    Ok(b.build()?)
}

/// Files under `root` (top level only unless `recursive`), sorted by name.
/// Files below any of `skip_dirs` and files matching `excludes` are left
/// out. Two files sharing a name cannot share a manifest key, so that is a
/// configuration error.
pub fn list_sources(
    fs: &dyn Fs,
    root: &Path,
    recursive: bool,
    excludes: &GlobSet,
    skip_dirs: &[&Path],
) -> Result<Vec<SourceFile>> {
    // Compared in resolved form so differently spelled paths still match.
    // A skip dir that does not exist yet cannot hold files.
    let base = fs.canonical(root).unwrap_or_else(|| root.to_path_buf());
    let skip: Vec<PathBuf> = skip_dirs.iter().filter_map(|d| fs.canonical(d)).collect();
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut out = Vec::new();
    for path in fs.list_files(root, recursive)? {
        let rel = path.strip_prefix(root).unwrap_or(&path);
        let resolved = base.join(rel);
        if skip.iter().any(|d| resolved.starts_with(d)) {
            continue;
        }
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if excludes.is_match(&rel_str) {
            debug!(file = %rel_str, "excluded");
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("file name of {:?} is not UTF-8", path)))?
            .to_string();
        if let Some(prev) = seen.insert(name.clone(), path.clone()) {
            return Err(Error::Config(format!(
                "{:?} and {:?} share the name {:?}",
                prev, path, name
            ))
            .into());
        }
        out.push(SourceFile { name, path });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn classify(store: &dyn ManifestStore, fs: &dyn Fs, file: &SourceFile) -> Result<Change> {
    let Some(entry) = store.get(&file.name)? else {
        return Ok(Change::New);
    };
    if fs.modified(&file.path)? > entry.last_modified {
        Ok(Change::Updated)
    } else {
        Ok(Change::Unchanged)
    }
}

pub fn detect_changes(
    store: &dyn ManifestStore,
    fs: &dyn Fs,
    files: Vec<SourceFile>,
) -> Result<ChangeSet> {
    let mut set = ChangeSet::default();
    for f in files {
        match classify(store, fs, &f)? {
            Change::New => {
                debug!(file = %f.name, "new file");
                set.added.push(f);
            }
            Change::Updated => {
                debug!(file = %f.name, "updated file");
                set.updated.push(f);
            }
            Change::Unchanged => set.unchanged += 1,
        }
    }
    Ok(set)
}
