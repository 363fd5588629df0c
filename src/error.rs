use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The uploaded bytes are not a readable archive. Fatal to the parse.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a readable zip archive: {0}")]
    Unreadable(#[from] zip::result::ZipError),
}

#[derive(Debug, Error)]
pub enum ChapterWriteError {
    #[error("novel not found: {novel_id}")]
    NovelNotFound { novel_id: String },

    #[error("chapter {number} already exists for novel {novel_id}")]
    Duplicate { novel_id: String, number: u32 },

    #[error("write chapter {number}: {message}")]
    Storage { number: u32, message: String },
}

#[derive(Debug, Error)]
pub enum AudioDispatchError {
    #[error("audio queue closed")]
    QueueClosed,

    #[error("write audio outbox: {0}")]
    Outbox(String),

    #[error("audio worker request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("audio worker rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid source url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("GET {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("GET {url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("no chapters found at {url}")]
    NoChapters { url: String },

    #[error("unparsable page {url}: {reason}")]
    Parse { url: String, reason: String },
}

#[derive(Debug, Error)]
#[error("job {job_id} stalled in {status} for more than {}s", .max_age.as_secs())]
pub struct JobTimeoutError {
    pub job_id: String,
    pub status: String,
    pub max_age: Duration,
}

/// Another attempt holds the source.
#[derive(Debug, Error)]
#[error("source {source_id} is already syncing")]
pub struct SyncInProgress {
    pub source_id: String,
}

/// A degraded-but-survivable problem found while reading an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureWarning {
    pub kind: WarningKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    UnreadableEntry,
    MissingContainer,
    MalformedContainer,
    MissingPackage,
    MalformedPackage,
    MissingSpineEntry,
    MalformedNavigation,
}

impl StructureWarning {
    pub fn new(kind: WarningKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for StructureWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}
