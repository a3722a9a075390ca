//! Manifest persistence. The whole manifest is one document; `JsonStore`
//! rewrites it on every mutation, `MemoryStore` keeps it in memory.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Error;
use crate::manifest::{
    Manifest, ManifestEntry, RepositoryEntry, RestoreEntry, SegmentLocation, UNASSIGNED,
};

pub trait ManifestStore {
    fn get(&self, file_name: &str) -> Result<Option<ManifestEntry>>;
    /// Insert or update by file name; assigns ids to new entries and
    /// segments and fixes up segment back-references.
    fn put(&mut self, entry: ManifestEntry) -> Result<ManifestEntry>;
    fn get_bin(&self, name: &str) -> Result<Option<RepositoryEntry>>;
    /// Insert (assigning an id) or update by id.
    fn put_bin(&mut self, bin: RepositoryEntry) -> Result<RepositoryEntry>;
    /// A miss is an error: callers only ask for ids the manifest handed out.
    fn get_bin_by_id(&self, id: u64) -> Result<RepositoryEntry>;
    /// All bins in id order.
    fn bins(&self) -> Result<Vec<RepositoryEntry>>;
    fn all_entries_for_restore(&self) -> Result<Vec<RestoreEntry>>;
    /// Backing file, when there is one.
    fn path(&self) -> Option<&Path>;
}

impl Manifest {
    fn get(&self, file_name: &str) -> Option<ManifestEntry> {
        self.files.iter().find(|e| e.file_name == file_name).cloned()
    }

    fn put(&mut self, mut entry: ManifestEntry) -> ManifestEntry {
        let existing = self.files.iter().position(|e| e.file_name == entry.file_name);
        if let Some(pos) = existing {
            entry.id = self.files[pos].id;
        } else if entry.id == UNASSIGNED {
            entry.id = self.next_entry_id;
            self.next_entry_id += 1;
        }
        for seg in &mut entry.segments {
            if seg.id == UNASSIGNED {
                seg.id = self.next_segment_id;
                self.next_segment_id += 1;
            }
            seg.manifest_entry_id = entry.id;
        }
        match existing {
            Some(pos) => self.files[pos] = entry.clone(),
            None => self.files.push(entry.clone()),
        }
        entry
    }

    fn get_bin(&self, name: &str) -> Option<RepositoryEntry> {
        self.bins.iter().find(|b| b.name == name).cloned()
    }

    fn put_bin(&mut self, mut bin: RepositoryEntry) -> RepositoryEntry {
        if bin.id == UNASSIGNED {
            if let Some(found) = self.bins.iter().find(|b| b.name == bin.name) {
                bin.id = found.id;
            }
        }
        match self.bins.iter().position(|b| b.id == bin.id && bin.id != UNASSIGNED) {
            Some(pos) => self.bins[pos] = bin.clone(),
            None => {
                bin.id = self.next_bin_id;
                self.next_bin_id += 1;
                self.bins.push(bin.clone());
            }
        }
        bin
    }

    fn get_bin_by_id(&self, id: u64) -> Result<RepositoryEntry> {
        self.bins
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| Error::MissingBin(format!("id {id}")).into())
    }

    fn restore_set(&self) -> Result<Vec<RestoreEntry>> {
        let mut out = Vec::with_capacity(self.files.len());
        for entry in &self.files {
            let mut segments = Vec::with_capacity(entry.segments.len());
            for seg in &entry.segments {
                let bin = self.get_bin_by_id(seg.repository_entry_id).with_context(|| {
                    format!("segment {} of {}", seg.segment_name, entry.file_name)
                })?;
                segments.push(SegmentLocation { segment: seg.clone(), bin });
            }
            out.push(RestoreEntry { entry: entry.clone(), segments });
        }
        Ok(out)
    }
}

/// In-memory store; nothing survives the process.
#[derive(Default, Debug, Clone)]
pub struct MemoryStore {
    doc: Manifest,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.doc
    }
}

impl ManifestStore for MemoryStore {
    fn get(&self, file_name: &str) -> Result<Option<ManifestEntry>> {
        Ok(self.doc.get(file_name))
    }
    fn put(&mut self, entry: ManifestEntry) -> Result<ManifestEntry> {
        Ok(self.doc.put(entry))
    }
    fn get_bin(&self, name: &str) -> Result<Option<RepositoryEntry>> {
        Ok(self.doc.get_bin(name))
    }
    fn put_bin(&mut self, bin: RepositoryEntry) -> Result<RepositoryEntry> {
        Ok(self.doc.put_bin(bin))
    }
    fn get_bin_by_id(&self, id: u64) -> Result<RepositoryEntry> {
        self.doc.get_bin_by_id(id)
    }
    fn bins(&self) -> Result<Vec<RepositoryEntry>> {
        Ok(self.doc.bins.clone())
    }
    fn all_entries_for_restore(&self) -> Result<Vec<RestoreEntry>> {
        self.doc.restore_set()
    }
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Store backed by a pretty-printed JSON file, rewritten after every
/// mutation via a temp file and rename.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    doc: Manifest,
}

impl JsonStore {
    /// Open `path`, starting an empty manifest when it does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let doc = if path.exists() {
            let f = File::open(path).with_context(|| format!("open {:?}", path))?;
            serde_json::from_reader(f).with_context(|| format!("read manifest {:?}", path))?
        } else {
            Manifest::default()
        };
        Ok(Self { path: path.to_path_buf(), doc })
    }

    /// Open an existing manifest; absence is an error.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingManifest(path.to_path_buf()).into());
        }
        Self::open(path)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.doc
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {:?}", parent))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = File::create(&tmp).with_context(|| format!("create {:?}", tmp))?;
            f.write_all(serde_json::to_string_pretty(&self.doc)?.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {:?} -> {:?}", tmp, self.path))?;
        debug!(path = %self.path.display(), files = self.doc.files.len(), "manifest saved");
        Ok(())
    }
}

impl ManifestStore for JsonStore {
    fn get(&self, file_name: &str) -> Result<Option<ManifestEntry>> {
        Ok(self.doc.get(file_name))
    }
    fn put(&mut self, entry: ManifestEntry) -> Result<ManifestEntry> {
        let stored = self.doc.put(entry);
        self.save()?;
        Ok(stored)
    }
    fn get_bin(&self, name: &str) -> Result<Option<RepositoryEntry>> {
        Ok(self.doc.get_bin(name))
    }
    fn put_bin(&mut self, bin: RepositoryEntry) -> Result<RepositoryEntry> {
        let stored = self.doc.put_bin(bin);
        self.save()?;
        Ok(stored)
    }
    fn get_bin_by_id(&self, id: u64) -> Result<RepositoryEntry> {
        self.doc.get_bin_by_id(id)
    }
    fn bins(&self) -> Result<Vec<RepositoryEntry>> {
        Ok(self.doc.bins.clone())
    }
    fn all_entries_for_restore(&self) -> Result<Vec<RestoreEntry>> {
        self.doc.restore_set()
    }
    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
