use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::codec::{Codec, Compressed};
use crate::config::Settings;
use crate::detect::{self, SourceFile};
use crate::error::Error;
use crate::fs::Fs;
use crate::manifest::{CompressedFileEntry, ManifestEntry, RepositoryEntry};
use crate::rotation::{Bin, BinRotation};
use crate::store::ManifestStore;
use crate::transport::Transport;

/// Id of the bin that hosts the manifest copy.
pub const MANIFEST_BIN_ID: u64 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub segments_written: usize,
    pub bins_minted: Vec<String>,
    pub bins_published: Vec<String>,
    /// Files skipped because their content could not be compressed. Their
    /// manifest records are left as they were.
    pub failed: Vec<String>,
}

/// One backup run. Owns the rotation context and borrows the collaborators
/// exclusively for its lifetime; files are processed strictly one at a time.
pub struct Backup<'a> {
    settings: &'a Settings,
    fs: &'a dyn Fs,
    codec: &'a dyn Codec,
    transport: &'a dyn Transport,
    store: &'a mut dyn ManifestStore,
    rotation: BinRotation,
}

impl<'a> Backup<'a> {
    pub fn new(
        settings: &'a Settings,
        fs: &'a dyn Fs,
        codec: &'a dyn Codec,
        transport: &'a dyn Transport,
        store: &'a mut dyn ManifestStore,
    ) -> Self {
        let rotation = BinRotation::from_settings(settings);
        Self { settings, fs, codec, transport, store, rotation }
    }

    pub fn run(&mut self) -> Result<BackupReport> {
        let s = self.settings;
        self.fs.create_dir_all(&s.backup_location)?;
        self.fs.create_dir_all(&s.source_location)?;
        // Leftovers of an aborted run.
        self.fs.remove_dir_all(&s.staging_dir())?;

        info!("indexing files..");
        let excludes = detect::build_excludes(&s.exclude)?;
        let sources = detect::list_sources(
            self.fs,
            &s.source_location,
            s.recursive,
            &excludes,
            &[&s.backup_location, &s.restore_location],
        )?;

        info!(files = sources.len(), "checking files for changes..");
        let changes = detect::detect_changes(&*self.store, self.fs, sources)?;
        let mut report = BackupReport { unchanged: changes.unchanged, ..Default::default() };

        if !changes.added.is_empty() {
            info!(count = changes.added.len(), "compressing new files..");
        }
        for file in &changes.added {
            match self.add_new_file(file) {
                Ok(n) => {
                    report.segments_written += n;
                    report.added += 1;
                }
                Err(e) if Error::is_file_local(&e) => self.skip(file, &e, &mut report.failed)?,
                Err(e) => return Err(e),
            }
        }
        if !changes.updated.is_empty() {
            info!(count = changes.updated.len(), "compressing updated files..");
        }
        for file in &changes.updated {
            match self.update_file(file) {
                Ok(n) => {
                    report.segments_written += n;
                    report.updated += 1;
                }
                Err(e) if Error::is_file_local(&e) => self.skip(file, &e, &mut report.failed)?,
                Err(e) => return Err(e),
            }
        }

        if report.added + report.updated > 0 {
            info!("backing up manifest..");
            self.self_host_manifest()?;
        }

        info!("committing and updating git remotes..");
        report.bins_published = self.publish_pending()?;
        report.bins_minted = self.rotation.minted().to_vec();
        info!(
            added = report.added,
            updated = report.updated,
            unchanged = report.unchanged,
            segments = report.segments_written,
            minted = report.bins_minted.len(),
            published = report.bins_published.len(),
            failed = report.failed.len(),
            "backup complete"
        );
        if !report.failed.is_empty() {
            return Err(Error::FilesFailed(report.failed).into());
        }
        Ok(report)
    }

    fn skip(&self, file: &SourceFile, err: &anyhow::Error, failed: &mut Vec<String>) -> Result<()> {
        warn!(file = %file.name, error = %format!("{err:#}"), "file skipped");
        failed.push(file.name.clone());
        self.fs.remove_dir_all(&self.settings.staging_dir())
    }

    fn compress(&self, file: &SourceFile) -> Result<Compressed> {
        let stage = self.settings.staging_dir();
        self.fs.remove_dir_all(&stage)?;
        let c = self
            .codec
            .compress(&file.path, &stage, self.settings.max_segment_bytes())
            .map_err(|e| Error::Codec(format!("compress {}: {e:#}", file.name)))?;
        debug!(file = %file.name, segments = c.segments, "compressed");
        Ok(c)
    }

    fn segment(&self, c: &Compressed, file: &SourceFile, i: u32) -> Result<(PathBuf, String, u64)> {
        let path = c.segment_path(&file.name, i);
        if !self.fs.exists(&path) {
            return Err(Error::MissingSegment(path).into());
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Codec(format!("unusable segment path {:?}", path)))?
            .to_string();
        let size = self.fs.file_len(&path)?;
        Ok((path, name, size))
    }

    /// Registered record for `bin`, marked as awaiting publish.
    fn claim_bin(&mut self, bin: &Bin) -> Result<RepositoryEntry> {
        let mut repo = match self.store.get_bin(&bin.name)? {
            Some(r) => r,
            None => self.store.put_bin(RepositoryEntry::new(bin.name.clone()))?,
        };
        if !repo.pending_publish {
            repo.pending_publish = true;
            repo = self.store.put_bin(repo)?;
        }
        Ok(repo)
    }

    /// Allocate a bin for a fresh segment position and move the segment in.
    fn place_new(&mut self, path: &Path, name: String, size: u64) -> Result<CompressedFileEntry> {
        let bin = self.rotation.allocate(self.fs, self.transport, size)?;
        let repo = self.claim_bin(&bin)?;
        let mut seg = CompressedFileEntry::new(name, repo.id);
        seg.hash_hex = Some(self.fs.digest(path)?.to_hex().to_string());
        // Fresh positions are never recorded, so a file already sitting there
        // was left by an interrupted run or a shrink and may be overwritten.
        if self.fs.exists(&bin.path.join(&seg.segment_name)) {
            debug!(segment = %seg.segment_name, bin = %bin.name, "overwriting unrecorded segment");
            self.transport.replace(path, &bin.path)?;
        } else {
            self.transport.place(path, &bin.path)?;
        }
        debug!(segment = %seg.segment_name, bin = %bin.name, size, "segment placed");
        Ok(seg)
    }

    fn add_new_file(&mut self, file: &SourceFile) -> Result<usize> {
        let c = self.compress(file)?;
        let now = Utc::now();
        let mut entry = ManifestEntry::new(file.name.clone(), now);
        for i in 0..c.segments {
            let (path, name, size) = self.segment(&c, file, i)?;
            let seg = self.place_new(&path, name, size)?;
            entry.segments.push(seg);
        }
        // Persisted only once every segment sits in its bin.
        self.store.put(entry)?;
        self.fs.remove_dir_all(&self.settings.staging_dir())?;
        Ok(c.segments as usize)
    }

    fn update_file(&mut self, file: &SourceFile) -> Result<usize> {
        let mut entry = self
            .store
            .get(&file.name)?
            .ok_or_else(|| Error::MissingManifestEntry(file.name.clone()))?;
        let c = self.compress(file)?;
        let existing = entry.segments.len();
        for i in 0..c.segments {
            let (path, name, size) = self.segment(&c, file, i)?;
            let idx = i as usize;
            if idx < existing {
                let repo = self.store.get_bin_by_id(entry.segments[idx].repository_entry_id)?;
                let bin_path = self.rotation.bin_path(&repo.name);
                if !repo.pending_publish {
                    self.store.put_bin(RepositoryEntry { pending_publish: true, ..repo.clone() })?;
                }
                let hash = self.fs.digest(&path)?.to_hex().to_string();
                self.transport.replace(&path, &bin_path)?;
                let seg = &mut entry.segments[idx];
                seg.segment_name = name;
                seg.hash_hex = Some(hash);
                debug!(segment = %seg.segment_name, bin = %repo.name, size, "segment replaced");
            } else {
                let seg = self.place_new(&path, name, size)?;
                entry.segments.push(seg);
            }
        }
        if (c.segments as usize) < existing {
            debug!(file = %file.name, from = existing, to = c.segments, "segment list shrunk");
            entry.segments.truncate(c.segments as usize);
        }
        entry.last_modified = Utc::now();
        self.store.put(entry)?;
        self.fs.remove_dir_all(&self.settings.staging_dir())?;
        Ok(c.segments as usize)
    }

    /// Copy the manifest's backing file into the first bin, overwriting the
    /// previous copy.
    fn self_host_manifest(&mut self) -> Result<()> {
        let mut repo = self.store.get_bin_by_id(MANIFEST_BIN_ID)?;
        if !repo.pending_publish {
            repo.pending_publish = true;
            repo = self.store.put_bin(repo)?;
        }
        let Some(src) = self.store.path().map(Path::to_path_buf) else {
            debug!("store has no backing file; nothing to copy");
            return Ok(());
        };
        let file_name = src
            .file_name()
            .ok_or_else(|| Error::Config(format!("manifest path {:?} has no file name", src)))?;
        let dest = self.rotation.bin_path(&repo.name).join(file_name);
        self.fs.copy(&src, &dest, true)?;
        debug!(bin = %repo.name, "manifest copied");
        Ok(())
    }

    /// Publish every bin still marked pending, including ones left over by
    /// a run that failed before publishing.
    fn publish_pending(&mut self) -> Result<Vec<String>> {
        let mut published = Vec::new();
        let mut pending: Vec<(u64, RepositoryEntry)> = Vec::new();
        for repo in self.store.bins()? {
            if repo.pending_publish {
                let seq = self.rotation.parse_seq(&repo.name)?.unwrap_or(u64::MAX);
                pending.push((seq, repo));
            }
        }
        pending.sort_by_key(|(seq, _)| *seq);
        for (_, mut repo) in pending {
            let path = self.rotation.bin_path(&repo.name);
            self.transport.publish(&path)?;
            repo.pending_publish = false;
            self.store.put_bin(repo.clone())?;
            published.push(repo.name);
        }
        Ok(published)
    }
}
