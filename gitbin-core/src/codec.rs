use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Error;
use crate::path_safety::validate_name;

/// Result of compressing one file: the primary artifact (segment 0) and the
/// total number of segments written next to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compressed {
    pub artifact: PathBuf,
    pub segments: u32,
}

impl Compressed {
    /// Path of segment `index`; continuations sit beside the artifact.
    pub fn segment_path(&self, file_name: &str, index: u32) -> PathBuf {
        if index == 0 {
            return self.artifact.clone();
        }
        self.artifact.with_file_name(continuation_name(file_name, index))
    }
}

/// Physical name of continuation segment `index` (>= 1) of `file_name`.
pub fn continuation_name(file_name: &str, index: u32) -> String {
    format!("{}.z{:02}", file_name, index)
}

pub trait Codec {
    /// Compress `source` into `stage_dir`, cutting the output into segments
    /// of at most `max_segment_bytes`.
    fn compress(&self, source: &Path, stage_dir: &Path, max_segment_bytes: u64)
        -> Result<Compressed>;

    /// Rebuild the original file from its segments (in order); returns the
    /// path of the rebuilt file, somewhere below the first segment's dir.
    fn reconstruct(&self, segments: &[PathBuf]) -> Result<PathBuf>;
}

const MAGIC: &[u8; 8] = b"GITBINZ\x01";
const MAX_HEADER_LEN: u32 = 64 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug)]
struct SegmentHeader {
    version: u32,
    file_name: String,
    original_len: u64,
}

/// zstd stream prefixed with a small bincode header naming the file.
/// Segment 0 is `{name}.zst`, segment i is `{name}.z{i:02}`; the segments
/// concatenated in order are the stream.
#[derive(Clone, Copy, Debug)]
pub struct ZstdCodec {
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn compress(
        &self,
        source: &Path,
        stage_dir: &Path,
        max_segment_bytes: u64,
    ) -> Result<Compressed> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Codec(format!("unusable file name {:?}", source)))?
            .to_string();
        validate_name(&file_name)?;
        if max_segment_bytes == 0 {
            return Err(Error::Codec("segment size must be non-zero".into()).into());
        }
        std::fs::create_dir_all(stage_dir)
            .with_context(|| format!("create dir {:?}", stage_dir))?;

        let mut input = File::open(source).with_context(|| format!("open {:?}", source))?;
        let original_len = input.metadata()?.len();
        let header = SegmentHeader { version: 1, file_name: file_name.clone(), original_len };
        let header_bytes = bincode::serialize(&header).context("serialize segment header")?;

        let artifact = stage_dir.join(format!("{}.zst", file_name));
        let mut out = SplitWriter::new(artifact.clone(), file_name.clone(), max_segment_bytes);
        out.write_all(MAGIC)?;
        out.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        out.write_all(&header_bytes)?;

        let mut enc = zstd::stream::Encoder::new(&mut out, self.level)
            .map_err(|e| Error::Codec(format!("zstd init: {e}")))?;
        let copied = io::copy(&mut input, &mut enc).with_context(|| format!("read {:?}", source))?;
        enc.finish().map_err(|e| Error::Codec(format!("zstd finish: {e}")))?;
        let segments = out.finish()?;

        if copied != original_len {
            return Err(Error::Codec(format!(
                "{:?} changed while compressing ({} of {} bytes)",
                source, copied, original_len
            ))
            .into());
        }
        Ok(Compressed { artifact, segments })
    }

    fn reconstruct(&self, segments: &[PathBuf]) -> Result<PathBuf> {
        let first = segments.first().ok_or_else(|| Error::Codec("no segments given".into()))?;
        let mut reader: Box<dyn Read> = Box::new(io::empty());
        for p in segments {
            let f = File::open(p).with_context(|| format!("open segment {:?}", p))?;
            reader = Box::new(reader.chain(BufReader::new(f)));
        }

        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|e| Error::Codec(format!("{:?}: short read on magic: {e}", first)))?;
        if &magic != MAGIC {
            return Err(Error::Codec(format!("{:?}: bad magic", first)).into());
        }
        let mut len4 = [0u8; 4];
        reader
            .read_exact(&mut len4)
            .map_err(|e| Error::Codec(format!("{:?}: short read on header: {e}", first)))?;
        let hdr_len = u32::from_le_bytes(len4);
        if hdr_len > MAX_HEADER_LEN {
            return Err(Error::Codec(format!("{:?}: header too large ({hdr_len})", first)).into());
        }
        let mut hdr = vec![0u8; hdr_len as usize];
        reader
            .read_exact(&mut hdr)
            .map_err(|e| Error::Codec(format!("{:?}: short read on header: {e}", first)))?;
        let header: SegmentHeader = bincode::deserialize(&hdr)
            .map_err(|e| Error::Codec(format!("{:?}: header decode: {e}", first)))?;
        validate_name(&header.file_name)
            .map_err(|e| Error::Codec(format!("{:?}: header names {e}", first)))?;

        let out_dir = first.parent().unwrap_or_else(|| Path::new(".")).join("extract");
        std::fs::create_dir_all(&out_dir).with_context(|| format!("create dir {:?}", out_dir))?;
        let out = out_dir.join(&header.file_name);
        let written = {
            let mut f = File::create(&out).with_context(|| format!("create {:?}", out))?;
            let mut dec = zstd::stream::Decoder::new(reader)
                .map_err(|e| Error::Codec(format!("zstd init: {e}")))?;
            let n = io::copy(&mut dec, &mut f);
            f.flush()?;
            n
        };
        let written = match written {
            Ok(n) => n,
            Err(e) => {
                discard(&out);
                return Err(Error::Codec(format!("{:?}: zstd decode: {e}", first)).into());
            }
        };
        if written != header.original_len {
            discard(&out);
            return Err(Error::Codec(format!(
                "{:?}: expected {} bytes, decoded {}",
                first, header.original_len, written
            ))
            .into());
        }
        Ok(out)
    }
}

/// Remove a partially decoded output after a failure.
fn discard(out: &Path) {
    if let Err(e) = std::fs::remove_file(out) {
        debug!(path = %out.display(), error = %e, "could not remove partial output");
    }
}

/// Writer that rolls to the next segment file every `max` bytes.
struct SplitWriter {
    artifact: PathBuf,
    file_name: String,
    max: u64,
    opened: u32,
    cur: Option<File>,
    cur_len: u64,
}

impl SplitWriter {
    fn new(artifact: PathBuf, file_name: String, max: u64) -> Self {
        Self { artifact, file_name, max, opened: 0, cur: None, cur_len: 0 }
    }

    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut f) = self.cur.take() {
            f.flush()?;
        }
        let path = if self.opened == 0 {
            self.artifact.clone()
        } else {
            self.artifact.with_file_name(continuation_name(&self.file_name, self.opened))
        };
        self.cur = Some(File::create(path)?);
        self.opened += 1;
        self.cur_len = 0;
        Ok(())
    }

    fn finish(mut self) -> io::Result<u32> {
        if self.cur.is_none() {
            self.roll()?;
        }
        if let Some(f) = self.cur.as_mut() {
            f.flush()?;
        }
        Ok(self.opened)
    }
}

impl Write for SplitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cur.is_none() || self.cur_len >= self.max {
            self.roll()?;
        }
        let room = (self.max - self.cur_len).min(buf.len() as u64) as usize;
        match self.cur.as_mut() {
            Some(f) => {
                f.write_all(&buf[..room])?;
                self.cur_len += room as u64;
                Ok(room)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "no open segment")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.cur.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_names_are_two_digit() {
        assert_eq!(continuation_name("a.txt", 1), "a.txt.z01");
        assert_eq!(continuation_name("a.txt", 12), "a.txt.z12");
        let c = Compressed { artifact: PathBuf::from("/s/a.txt.zst"), segments: 3 };
        assert_eq!(c.segment_path("a.txt", 0), PathBuf::from("/s/a.txt.zst"));
        assert_eq!(c.segment_path("a.txt", 2), PathBuf::from("/s/a.txt.z02"));
    }

    #[test]
    fn split_writer_caps_every_segment() {
        let td = tempfile::tempdir().unwrap();
        let mut w = SplitWriter::new(td.path().join("f.zst"), "f".into(), 10);
        w.write_all(&[7u8; 35]).unwrap();
        assert_eq!(w.finish().unwrap(), 4);
        let lens: Vec<u64> = ["f.zst", "f.z01", "f.z02", "f.z03"]
            .iter()
            .map(|n| std::fs::metadata(td.path().join(n)).unwrap().len())
            .collect();
        assert_eq!(lens, vec![10, 10, 10, 5]);
    }
}
