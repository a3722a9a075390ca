use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id value carried by records the store has not assigned yet.
pub const UNASSIGNED: u64 = 0;

/// One backed-up source file. `segments[i]` is segment `i` of the codec
/// output: 0 is the primary artifact, 1.. are continuations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: u64,
    pub file_name: String,
    pub created: DateTime<Utc>,
    /// Time of the last successful backup, not the file's mtime.
    pub last_modified: DateTime<Utc>,
    pub segments: Vec<CompressedFileEntry>,
}

impl ManifestEntry {
    pub fn new(file_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: UNASSIGNED,
            file_name: file_name.into(),
            created: now,
            last_modified: now,
            segments: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompressedFileEntry {
    pub id: u64,
    pub segment_name: String,
    pub manifest_entry_id: u64,
    pub repository_entry_id: u64,
    /// BLAKE3 of the segment as placed; checked before reconstruction.
    #[serde(default)]
    pub hash_hex: Option<String>,
}

impl CompressedFileEntry {
    pub fn new(segment_name: impl Into<String>, repository_entry_id: u64) -> Self {
        Self {
            id: UNASSIGNED,
            segment_name: segment_name.into(),
            manifest_entry_id: UNASSIGNED,
            repository_entry_id,
            hash_hex: None,
        }
    }
}

/// A storage bin: a directory bound to a git working copy and its remote.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub id: u64,
    pub name: String,
    /// Set when segments were placed but the bin has not been pushed since.
    #[serde(default)]
    pub pending_publish: bool,
}

impl RepositoryEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { id: UNASSIGNED, name: name.into(), pending_publish: false }
    }
}

/// A segment paired with the bin that holds it, as handed to restore.
#[derive(Clone, Debug)]
pub struct SegmentLocation {
    pub segment: CompressedFileEntry,
    pub bin: RepositoryEntry,
}

/// Everything needed to rebuild one file, segments in codec order.
#[derive(Clone, Debug)]
pub struct RestoreEntry {
    pub entry: ManifestEntry,
    pub segments: Vec<SegmentLocation>,
}

/// Serialized form of the whole manifest (`manifest.json`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub next_entry_id: u64,
    pub next_segment_id: u64,
    pub next_bin_id: u64,
    pub bins: Vec<RepositoryEntry>,
    pub files: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: 1,
            next_entry_id: 1,
            next_segment_id: 1,
            next_bin_id: 1,
            bins: Vec::new(),
            files: Vec::new(),
        }
    }
}
