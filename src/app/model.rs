use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = String;
pub type UserId = String;
pub type NovelId = String;
pub type ChapterId = String;
pub type SourceId = String;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ArchiveImport,
    SourceImport,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Parsing,
    CreatingChapters,
    GeneratingAudio,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Parsing => "parsing",
            Self::CreatingChapters => "creating_chapters",
            Self::GeneratingAudio => "generating_audio",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedChapter {
    pub chapter_id: ChapterId,
    pub number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: JobId,
    pub kind: JobKind,
    pub user_id: UserId,
    pub novel_id: NovelId,
    pub status: JobStatus,
    pub status_message: String,

    /// Set once when the chapter list is known; `None` before that.
    pub total_chapters: Option<u32>,
    pub chapters_processed: u32,
    pub audio_completed: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub original_file_name: Option<String>,
    #[serde(default)]
    pub requested_status: Option<String>,
    #[serde(default)]
    pub source_id: Option<SourceId>,

    #[serde(default)]
    pub created_chapters: Vec<CreatedChapter>,
    #[serde(default)]
    pub audio_completed_chapters: BTreeSet<ChapterId>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ImportJob {
    pub fn new(kind: JobKind, user_id: UserId, novel_id: NovelId, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            kind,
            user_id,
            novel_id,
            status: JobStatus::Queued,
            status_message: "queued for processing".to_string(),
            total_chapters: None,
            chapters_processed: 0,
            audio_completed: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            original_file_name: None,
            requested_status: None,
            source_id: None,
            created_chapters: Vec::new(),
            audio_completed_chapters: BTreeSet::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total_chapters.unwrap_or(0)
    }

    pub fn owns_chapter(&self, chapter_id: &str) -> bool {
        self.created_chapters
            .iter()
            .any(|chapter| chapter.chapter_id == chapter_id)
    }

    pub fn is_audio_done(&self) -> bool {
        self.total_chapters
            .is_some_and(|total| self.audio_completed >= total)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovelSource {
    pub id: SourceId,
    pub novel_id: NovelId,
    pub user_id: UserId,
    pub source_url: String,
    pub platform: String,
    pub enabled: bool,

    pub last_synced_chapter: Option<u32>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub next_sync_time: DateTime<Utc>,
    pub sync_interval_minutes: u32,

    pub error_message: Option<String>,
    pub consecutive_failures: u32,
}

impl NovelSource {
    pub fn new(
        user_id: UserId,
        novel_id: NovelId,
        source_url: String,
        platform: String,
        sync_interval_minutes: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            novel_id,
            user_id,
            source_url,
            platform,
            enabled: true,
            last_synced_chapter: None,
            last_sync_time: None,
            sync_status: SyncStatus::Idle,
            sync_started_at: None,
            next_sync_time: now,
            sync_interval_minutes: sync_interval_minutes.max(1),
            error_message: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_sync_time <= now
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    Epub,
}

/// Publishes an archive import for a worker to pick up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub novel_id: NovelId,
    pub source_file: String,
    pub requested_status: Option<String>,
    pub archive_kind: ArchiveKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterAudioRequest {
    pub chapter_id: ChapterId,
    pub job_id: JobId,
    pub novel_id: NovelId,
    pub chapter_number: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChapterRange {
    Full,
    Range { start: u32, end: Option<u32> },
}

impl ChapterRange {
    pub fn starting_at(start: u32) -> Self {
        Self::Range { start, end: None }
    }

    pub fn contains(&self, number: u32) -> bool {
        match *self {
            Self::Full => true,
            Self::Range { start, end } => number >= start && end.is_none_or(|end| number <= end),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSyncRequest {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub range: ChapterRange,
}
