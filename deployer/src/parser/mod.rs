//! The `ArtifactParser` adapter from spec §4.4: reads an artifact
//! container stream, non-seeking, and exposes its metadata. The
//! container format itself is out of scope (spec.md §1 Non-goals); only
//! `tar::TarArtifactParser` is shipped, grounded on the teacher's
//! `deployer/src/manager/queue.rs::extract_tar_gz_data`.

pub mod tar;

use std::io::Read;

use fleet_common::ArtifactMeta;

pub use self::tar::TarArtifactParser;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("malformed artifact container: {0}")]
    Malformed(String),
    #[error("missing required container entry: {0}")]
    MissingEntry(String),
    #[error("unsupported artifact format version: {0}")]
    UnsupportedVersion(u32),
    #[error("i/o error reading artifact stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed metadata json: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait ArtifactParser: Send + Sync {
    /// Reads the full container, returning its metadata. `reader` must
    /// not be seeked; the parser consumes it sequentially.
    fn read(&self, reader: &mut dyn Read) -> Result<ArtifactMeta, ParseError>;

    /// Stops after the first entry (`header-info.json`), for the
    /// already-uploaded-and-verified `CompleteUpload` path where a
    /// "headers only" read is all that is needed downstream (spec §4.4).
    fn read_headers_only(&self, reader: &mut dyn Read) -> Result<ArtifactMeta, ParseError>;
}
