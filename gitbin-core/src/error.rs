use std::path::PathBuf;
use thiserror::Error;

/// Failure categories a caller may need to tell apart. Functions still
/// return `anyhow::Result`; these travel inside it and can be recovered
/// with `downcast_ref`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("manifest entry not found: {0}")]
    MissingManifestEntry(String),
    #[error("storage bin not found: {0}")]
    MissingBin(String),
    #[error("segment not found: {}", .0.display())]
    MissingSegment(PathBuf),
    #[error("manifest not found: {}", .0.display())]
    MissingManifest(PathBuf),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("segment digest mismatch: {}", .0.display())]
    DigestMismatch(PathBuf),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{} file(s) failed: {}", .0.len(), .0.join(", "))]
    FilesFailed(Vec<String>),
}

impl Error {
    /// Whether `err` only concerns the file being processed, so the run can
    /// skip that file and carry on.
    pub fn is_file_local(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::Codec(_) | Error::DigestMismatch(_)))
    }
}
