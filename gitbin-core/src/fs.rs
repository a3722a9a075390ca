//! Filesystem capability used by rotation, detection, the backup engine and
//! restore. `OsFs` is the real thing; `MemFs` is a simulated tree so the
//! allocation and reconstruction logic can be exercised without touching
//! disk.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub trait Fs {
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    /// Immediate subdirectories of `dir`, sorted. A missing `dir` has none.
    fn list_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    /// Regular files directly in `dir` (or anywhere below it when
    /// `recursive`), sorted. A missing `dir` has none.
    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>>;
    fn file_len(&self, path: &Path) -> Result<u64>;
    fn modified(&self, path: &Path) -> Result<DateTime<Utc>>;
    /// Copy a file. With `overwrite == false` an existing target is an error.
    fn copy(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    /// Remove a directory tree; a missing tree is not an error.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn digest(&self, path: &Path) -> Result<blake3::Hash>;
    /// Absolute path with `.`, `..` and symlinks resolved, or `None` when
    /// `path` does not exist.
    fn canonical(&self, path: &Path) -> Option<PathBuf>;

    /// First file (in path order) anywhere below `dir` named exactly `name`.
    fn find_file(&self, dir: &Path, name: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .list_files(dir, true)?
            .into_iter()
            .find(|p| p.file_name().map(|n| n == name).unwrap_or(false)))
    }
}

/// Real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsFs;

impl Fs for OsFs {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).with_context(|| format!("create dir {:?}", path))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for ent in std::fs::read_dir(dir).with_context(|| format!("read dir {:?}", dir))? {
            let ent = ent?;
            if ent.file_type()?.is_dir() {
                out.push(ent.path());
            }
        }
        out.sort();
        Ok(out)
    }

    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        let mut walk = walkdir::WalkDir::new(dir).min_depth(1);
        if !recursive {
            walk = walk.max_depth(1);
        }
        for ent in walk {
            let ent = ent?;
            if ent.file_type().is_file() {
                out.push(ent.path().to_path_buf());
            }
        }
        out.sort();
        Ok(out)
    }

    fn file_len(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path).with_context(|| format!("stat {:?}", path))?.len())
    }

    fn modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("mtime {:?}", path))?;
        Ok(DateTime::<Utc>::from(mtime))
    }

    fn copy(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        if !overwrite && to.exists() {
            bail!("refusing to overwrite {:?}", to);
        }
        std::fs::copy(from, to).with_context(|| format!("copy {:?} -> {:?}", from, to))?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).with_context(|| format!("remove {:?}", path))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(path).with_context(|| format!("remove dir {:?}", path))
    }

    fn digest(&self, path: &Path) -> Result<blake3::Hash> {
        let mut f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let mut h = blake3::Hasher::new();
        std::io::copy(&mut f, &mut h).with_context(|| format!("hash {:?}", path))?;
        Ok(h.finalize())
    }

    fn canonical(&self, path: &Path) -> Option<PathBuf> {
        std::fs::canonicalize(path).ok()
    }
}

#[derive(Clone, Debug)]
struct MemFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Default, Debug)]
struct MemState {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, MemFile>,
}

/// Simulated filesystem. Clones share the same tree, so a test can hand one
/// handle to the code under test and keep another to inspect the result.
#[derive(Clone, Debug, Default)]
pub struct MemFs {
    inner: Arc<Mutex<MemState>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write a file stamped with the current time, creating parent dirs.
    pub fn write(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        self.write_at(path, data, Utc::now());
    }

    pub fn write_at(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
        let path = path.as_ref();
        let mut st = self.state();
        if let Some(parent) = path.parent() {
            insert_ancestors(&mut st.dirs, parent);
        }
        st.files.insert(path.to_path_buf(), MemFile { data: data.into(), modified });
    }

    pub fn set_modified(&self, path: impl AsRef<Path>, modified: DateTime<Utc>) -> Result<()> {
        let path = path.as_ref();
        match self.state().files.get_mut(path) {
            Some(f) => {
                f.modified = modified;
                Ok(())
            }
            None => bail!("no such file {:?}", path),
        }
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state().files.get(path.as_ref()).map(|f| f.data.clone())
    }
}

/// Lexical cleanup for the simulated tree, which has no links and no
/// working directory.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn insert_ancestors(dirs: &mut BTreeSet<PathBuf>, path: &Path) {
    for a in path.ancestors() {
        if a.as_os_str().is_empty() {
            continue;
        }
        dirs.insert(a.to_path_buf());
    }
}

impl Fs for MemFs {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut st = self.state();
        if st.files.contains_key(path) {
            bail!("{:?} is a file", path);
        }
        insert_ancestors(&mut st.dirs, path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let st = self.state();
        st.dirs.contains(path) || st.files.contains_key(path)
    }

    fn list_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let st = self.state();
        Ok(st.dirs.iter().filter(|d| d.parent() == Some(dir)).cloned().collect())
    }

    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        let st = self.state();
        Ok(st
            .files
            .keys()
            .filter(|p| {
                if recursive {
                    p.starts_with(dir) && p.as_path() != dir
                } else {
                    p.parent() == Some(dir)
                }
            })
            .cloned()
            .collect())
    }

    fn file_len(&self, path: &Path) -> Result<u64> {
        match self.state().files.get(path) {
            Some(f) => Ok(f.data.len() as u64),
            None => bail!("stat {:?}: no such file", path),
        }
    }

    fn modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        match self.state().files.get(path) {
            Some(f) => Ok(f.modified),
            None => bail!("mtime {:?}: no such file", path),
        }
    }

    fn copy(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        let mut st = self.state();
        let Some(src) = st.files.get(from).cloned() else {
            bail!("copy {:?}: no such file", from);
        };
        if let Some(parent) = to.parent() {
            if !parent.as_os_str().is_empty() && !st.dirs.contains(parent) {
                bail!("copy {:?} -> {:?}: parent directory missing", from, to);
            }
        }
        if !overwrite && st.files.contains_key(to) {
            bail!("refusing to overwrite {:?}", to);
        }
        st.files.insert(to.to_path_buf(), MemFile { data: src.data, modified: Utc::now() });
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match self.state().files.remove(path) {
            Some(_) => Ok(()),
            None => bail!("remove {:?}: no such file", path),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let mut st = self.state();
        st.files.retain(|p, _| !p.starts_with(path));
        st.dirs.retain(|d| !d.starts_with(path));
        Ok(())
    }

    fn digest(&self, path: &Path) -> Result<blake3::Hash> {
        match self.state().files.get(path) {
            Some(f) => Ok(blake3::hash(&f.data)),
            None => bail!("hash {:?}: no such file", path),
        }
    }

    fn canonical(&self, path: &Path) -> Option<PathBuf> {
        let p = normalize(path);
        self.exists(&p).then_some(p)
    }
}
