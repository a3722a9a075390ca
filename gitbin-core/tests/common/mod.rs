#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use gitbin_core::codec::{Codec, Compressed};
use gitbin_core::config::Settings;
use gitbin_core::fs::{Fs, MemFs};
use gitbin_core::transport::Transport;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const KB: u64 = 1024;

/// Settings rooted in a MemFs tree: sources in /src, bins in /backup.
pub fn mem_settings(bin_kb: u64, segment_kb: u64) -> Settings {
    Settings {
        backup_location: PathBuf::from("/backup"),
        source_location: PathBuf::from("/src"),
        restore_location: PathBuf::from("/restore"),
        restore_target: PathBuf::from("/out"),
        segment_size_kb: segment_kb,
        bin_size_kb: bin_kb,
        bin_naming_convention: "conv-".to_string(),
        remote_location: PathBuf::from("/remotes"),
        ..Settings::default()
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Transport over a MemFs that records what it was asked to do.
#[derive(Default)]
pub struct MemTransport {
    fs: MemFs,
    log: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
    fail_init_of: Mutex<Option<String>>,
    fail_place_of: Mutex<Option<String>>,
    keep_existing: AtomicBool,
}

impl MemTransport {
    pub fn new(fs: &MemFs) -> Self {
        Self { fs: fs.clone(), ..Self::default() }
    }

    /// The next `init_bin` of `bin` fails.
    pub fn fail_init_of(&self, bin: &str) {
        *self.fail_init_of.lock().unwrap() = Some(bin.to_string());
    }

    /// The next `place` of `segment` fails.
    pub fn fail_place_of(&self, segment: &str) {
        *self.fail_place_of.lock().unwrap() = Some(segment.to_string());
    }

    /// `place` refuses to overwrite, like `overwriteOnAdd = false`.
    pub fn keep_existing(&self) {
        self.keep_existing.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    fn record(&self, what: &str, path: &Path) {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        self.log.lock().unwrap().push(format!("{what} {name}"));
    }

    fn move_into(&self, segment: &Path, bin: &Path) -> Result<PathBuf> {
        let name = segment.file_name().ok_or_else(|| anyhow!("no name: {:?}", segment))?;
        let dest = bin.join(name);
        self.fs.copy(segment, &dest, true)?;
        self.fs.remove_file(segment)?;
        Ok(dest)
    }
}

/// Clears `slot` and returns true when it holds the file name of `path`.
fn take_if_named(slot: &Mutex<Option<String>>, path: &Path) -> bool {
    let mut slot = slot.lock().unwrap();
    let name = path.file_name().map(|n| n.to_string_lossy().to_string());
    if slot.is_some() && *slot == name {
        *slot = None;
        return true;
    }
    false
}

impl Transport for MemTransport {
    fn init_bin(&self, bin: &Path) -> Result<()> {
        if take_if_named(&self.fail_init_of, bin) {
            bail!("remote init failed");
        }
        self.record("init", bin);
        Ok(())
    }

    fn place(&self, segment: &Path, bin: &Path) -> Result<PathBuf> {
        if take_if_named(&self.fail_place_of, segment) {
            bail!("connection reset");
        }
        if self.keep_existing.load(Ordering::SeqCst) {
            if let Some(name) = segment.file_name() {
                if self.fs.exists(&bin.join(name)) {
                    bail!("{:?} already exists", bin.join(name));
                }
            }
        }
        self.record("place", segment);
        self.move_into(segment, bin)
    }

    fn replace(&self, segment: &Path, bin: &Path) -> Result<PathBuf> {
        self.record("replace", segment);
        self.move_into(segment, bin)
    }

    fn publish(&self, bin: &Path) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            bail!("remote unreachable");
        }
        self.record("publish", bin);
        Ok(())
    }

    fn fetch_all(&self, _manifest_name: &str) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Codec over a MemFs that stores bytes as-is, cut into segments. Rebuilt
/// files land two directories below the scratch area.
pub struct SplitCodec {
    fs: MemFs,
    reject: Option<&'static str>,
}

impl SplitCodec {
    pub fn new(fs: &MemFs) -> Self {
        Self { fs: fs.clone(), reject: None }
    }

    /// Fails to compress or rebuild any file whose name ends in `suffix`.
    pub fn rejecting(fs: &MemFs, suffix: &'static str) -> Self {
        Self { fs: fs.clone(), reject: Some(suffix) }
    }

    fn check(&self, name: &str) -> Result<()> {
        match self.reject {
            Some(suffix) if name.ends_with(suffix) => bail!("corrupt/unreadable"),
            _ => Ok(()),
        }
    }
}

impl Codec for SplitCodec {
    fn compress(&self, source: &Path, stage_dir: &Path, max_segment_bytes: u64) -> Result<Compressed> {
        let name = source.file_name().and_then(|n| n.to_str()).ok_or_else(|| anyhow!("bad name"))?;
        self.check(name)?;
        let data = self.fs.read(source).ok_or_else(|| anyhow!("missing {:?}", source))?;
        self.fs.create_dir_all(stage_dir)?;
        let chunks: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(max_segment_bytes as usize).map(<[u8]>::to_vec).collect()
        };
        let c = Compressed {
            artifact: stage_dir.join(format!("{name}.zst")),
            segments: chunks.len() as u32,
        };
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.fs.write(c.segment_path(name, i as u32), chunk);
        }
        Ok(c)
    }

    fn reconstruct(&self, segments: &[PathBuf]) -> Result<PathBuf> {
        let first = segments.first().ok_or_else(|| anyhow!("no segments"))?;
        let name = first
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".zst"))
            .ok_or_else(|| anyhow!("not a primary segment: {:?}", first))?;
        self.check(name)?;
        let mut data = Vec::new();
        for s in segments {
            data.extend(self.fs.read(s).ok_or_else(|| anyhow!("missing {:?}", s))?);
        }
        let dir = first.parent().ok_or_else(|| anyhow!("no parent"))?;
        let out = dir.join("extract").join("deep").join(name);
        self.fs.write(&out, data);
        Ok(out)
    }
}
