use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::dispatcher::AudioDispatcher;
use crate::app::job_store::{FileStore, JobStore};
use crate::app::model::{
    ArchiveKind, ChapterAudioRequest, CreatedChapter, ImportJob, ImportRequest, JobKind,
    JobStatus, NovelSource,
};
use crate::app::novel_store::{NewChapter, NovelContent, NovelMetadata};
use crate::app::queue::KeyedLocks;
use crate::error::JobTimeoutError;

const DEFAULT_STALLED_JOB_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// Told about every job that reaches a terminal state, after it is persisted.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn job_finished(&self, job: &ImportJob);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn job_finished(&self, job: &ImportJob) {
        tracing::info!(
            job_id = %job.id,
            novel_id = %job.novel_id,
            status = %job.status,
            chapters = job.chapters_processed,
            audio = job.audio_completed,
            errors = job.errors.len(),
            "job finished"
        );
    }
}

/// A chapter ready to be written, already carrying its final number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChapter {
    pub number: u32,
    pub title: String,
    pub html: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistOptions {
    /// Stop at the first failed write so the written chapters stay a prefix.
    pub stop_on_write_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub created: Vec<CreatedChapter>,
    pub write_errors: usize,
    pub dispatch_errors: usize,
    pub stopped_early: bool,
    /// The job became terminal (cancelled, swept) while chapters were written.
    pub interrupted: bool,
}

impl PersistOutcome {
    pub fn highest_created(&self) -> Option<u32> {
        self.created.iter().map(|chapter| chapter.number).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Applied { job_completed: bool },
    /// An audio failure report moved the job to `failed`.
    JobFailed,
    Duplicate,
    UnknownChapter,
    /// The job is already terminal.
    Ignored,
}

impl std::fmt::Display for CallbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied {
                job_completed: true,
            } => f.write_str("applied; job completed"),
            Self::Applied {
                job_completed: false,
            } => f.write_str("applied"),
            Self::JobFailed => f.write_str("applied; job failed"),
            Self::Duplicate => f.write_str("duplicate"),
            Self::UnknownChapter => f.write_str("unknown chapter"),
            Self::Ignored => f.write_str("ignored; job already finished"),
        }
    }
}

struct Mutation {
    job: ImportJob,
    applied: bool,
}

pub struct ImportCoordinator {
    jobs: Arc<dyn JobStore>,
    novels: Arc<dyn NovelContent>,
    files: Arc<dyn FileStore>,
    audio: Arc<dyn AudioDispatcher>,
    notifier: Arc<dyn Notifier>,
    locks: KeyedLocks,
    stalled_job_after: Duration,
}

impl ImportCoordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        novels: Arc<dyn NovelContent>,
        files: Arc<dyn FileStore>,
        audio: Arc<dyn AudioDispatcher>,
    ) -> Self {
        Self {
            jobs,
            novels,
            files,
            audio,
            notifier: Arc::new(LogNotifier),
            locks: KeyedLocks::new(),
            stalled_job_after: DEFAULT_STALLED_JOB_AFTER,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_stalled_job_after(mut self, max_age: Duration) -> Self {
        self.stalled_job_after = max_age;
        self
    }

    pub fn novels(&self) -> &Arc<dyn NovelContent> {
        &self.novels
    }

    pub async fn get_job(&self, job_id: &str) -> anyhow::Result<Option<ImportJob>> {
        self.jobs.get(job_id).await.context("load job")
    }

    pub async fn submit_archive_import(
        &self,
        user_id: &str,
        novel_id: &str,
        source_file: &str,
        original_file_name: Option<String>,
        requested_status: Option<String>,
    ) -> anyhow::Result<ImportRequest> {
        let mut job = ImportJob::new(
            JobKind::ArchiveImport,
            user_id.to_string(),
            novel_id.to_string(),
            Utc::now(),
        );
        job.original_file_name = original_file_name;
        job.requested_status = requested_status.clone();
        self.jobs.put(&job).await.context("save job")?;
        tracing::info!(job_id = %job.id, novel_id, source_file, "archive import queued");

        Ok(ImportRequest {
            job_id: job.id,
            user_id: user_id.to_string(),
            novel_id: novel_id.to_string(),
            source_file: source_file.to_string(),
            requested_status,
            archive_kind: ArchiveKind::Epub,
        })
    }

    /// Runs a queued archive import to `generating_audio` (or `completed`).
    /// Redelivered requests for jobs already past `queued` are no-ops.
    pub async fn process_archive_import(
        &self,
        request: &ImportRequest,
    ) -> anyhow::Result<ImportJob> {
        match self.try_process_archive_import(request).await {
            Ok(job) => Ok(job),
            Err(err) => {
                tracing::error!(job_id = %request.job_id, ?err, "archive import failed");
                if let Err(fail_err) = self.fail(&request.job_id, format!("{err:#}")).await {
                    tracing::warn!(job_id = %request.job_id, ?fail_err, "record import failure");
                }
                Err(err)
            }
        }
    }

    async fn try_process_archive_import(
        &self,
        request: &ImportRequest,
    ) -> anyhow::Result<ImportJob> {
        let job_id = request.job_id.as_str();
        let started = self
            .mutate(job_id, |job| {
                if job.status != JobStatus::Queued {
                    return false;
                }
                job.status = JobStatus::Parsing;
                job.status_message = "parsing archive".to_string();
                true
            })
            .await?;
        if !started.applied {
            tracing::info!(job_id, status = %started.job.status, "import already handled; skipping");
            return Ok(started.job);
        }

        let bytes = match self.files.read(&request.source_file).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return self
                    .fail(job_id, format!("read uploaded archive: {err:#}"))
                    .await;
            }
        };
        let parsed = tokio::task::spawn_blocking(move || crate::epub::parse(&bytes))
            .await
            .context("join epub parser")?;
        let book = match parsed {
            Ok(book) => book,
            Err(err) => return self.fail(job_id, err.to_string()).await,
        };

        let novel_id = started.job.novel_id.as_str();
        let metadata = NovelMetadata {
            owner_id: started.job.user_id.clone(),
            title: book_title(&book.title, started.job.original_file_name.as_deref()),
            author: book.author.clone(),
        };
        if self
            .novels
            .ensure_novel(novel_id, &metadata)
            .await
            .context("create novel")?
        {
            tracing::info!(job_id, novel_id, title = %metadata.title, "novel created from archive");
        }

        let highest = self
            .novels
            .highest_chapter_number(novel_id)
            .await
            .context("load highest chapter number")?;

        let mut warnings = book
            .warnings
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if let Some(cover) = &book.cover
            && let Err(err) = self
                .novels
                .attach_cover(novel_id, &cover.name, &cover.bytes)
                .await
        {
            tracing::warn!(job_id, cover = %cover.name, ?err, "attach cover failed");
            warnings.push(format!("attach cover {}: {err:#}", cover.name));
        }

        let total = u32::try_from(book.chapters.len()).context("too many chapters")?;
        if !self.begin_chapter_creation(job_id, total, warnings).await? {
            return self.require_job(job_id).await;
        }

        let pending = book
            .chapters
            .into_iter()
            .map(|chapter| PendingChapter {
                number: highest + chapter.sequence,
                title: chapter.title,
                html: chapter.html,
            })
            .collect();
        let outcome = self
            .persist_chapters(job_id, pending, PersistOptions::default())
            .await?;
        tracing::info!(
            job_id,
            created = outcome.created.len(),
            write_errors = outcome.write_errors,
            dispatch_errors = outcome.dispatch_errors,
            "archive chapters persisted"
        );

        self.finish_chapter_creation(job_id).await
    }

    /// A queued job that a source sync will fill.
    pub async fn create_source_job(&self, source: &NovelSource) -> anyhow::Result<ImportJob> {
        let mut job = ImportJob::new(
            JobKind::SourceImport,
            source.user_id.clone(),
            source.novel_id.clone(),
            Utc::now(),
        );
        job.source_id = Some(source.id.clone());
        self.jobs.put(&job).await.context("save job")?;
        Ok(job)
    }

    /// `queued → parsing` for a job whose chapters come from a source fetch.
    /// Returns false unless the job was queued.
    pub async fn begin_source_fetch(&self, job_id: &str) -> anyhow::Result<bool> {
        let mutation = self
            .mutate(job_id, |job| {
                if job.status != JobStatus::Queued {
                    return false;
                }
                job.status = JobStatus::Parsing;
                job.status_message = "fetching chapters from source".to_string();
                true
            })
            .await?;
        Ok(mutation.applied)
    }

    /// Fixes the chapter total and moves `parsing → creating_chapters`.
    /// Returns false when the job is not parsing (terminal included).
    pub async fn begin_chapter_creation(
        &self,
        job_id: &str,
        total: u32,
        warnings: Vec<String>,
    ) -> anyhow::Result<bool> {
        let mutation = self
            .mutate(job_id, |job| {
                if job.status != JobStatus::Parsing {
                    return false;
                }
                job.total_chapters.get_or_insert(total);
                job.warnings.extend(warnings);
                job.status = JobStatus::CreatingChapters;
                job.status_message = format!("creating {total} chapters");
                true
            })
            .await?;
        Ok(mutation.applied)
    }

    /// Moves to `generating_audio`, or straight to `completed` when every
    /// chapter's audio is already done (always the case for zero chapters).
    pub async fn finish_chapter_creation(&self, job_id: &str) -> anyhow::Result<ImportJob> {
        let mutation = self
            .mutate(job_id, |job| {
                if job.is_audio_done() {
                    job.status = JobStatus::Completed;
                    job.status_message = "import completed".to_string();
                } else {
                    job.status = JobStatus::GeneratingAudio;
                    job.status_message = format!(
                        "generating audio for {} chapters",
                        job.created_chapters.len()
                    );
                }
                true
            })
            .await?;
        Ok(mutation.job)
    }

    /// Writes chapters in order, dispatching one audio request per chapter
    /// written. Failures are recorded on the job and never abort the batch
    /// unless `stop_on_write_error` is set.
    pub async fn persist_chapters(
        &self,
        job_id: &str,
        chapters: Vec<PendingChapter>,
        options: PersistOptions,
    ) -> anyhow::Result<PersistOutcome> {
        let job = self.require_job(job_id).await?;
        let mut outcome = PersistOutcome::default();

        for chapter in chapters {
            let new_chapter = NewChapter {
                novel_id: job.novel_id.clone(),
                number: chapter.number,
                title: chapter.title,
                html: chapter.html,
                status: job.requested_status.clone(),
            };

            let chapter_id = match self.novels.create_chapter(&new_chapter).await {
                Ok(chapter_id) => chapter_id,
                Err(err) => {
                    tracing::warn!(job_id, number = new_chapter.number, %err, "chapter write failed");
                    outcome.write_errors += 1;
                    let message = err.to_string();
                    let recorded = self
                        .mutate(job_id, |job| {
                            job.errors.push(message);
                            true
                        })
                        .await?;
                    if !recorded.applied {
                        outcome.interrupted = true;
                        break;
                    }
                    if options.stop_on_write_error {
                        outcome.stopped_early = true;
                        break;
                    }
                    continue;
                }
            };

            let created = CreatedChapter {
                chapter_id: chapter_id.clone(),
                number: new_chapter.number,
            };
            let recorded = self
                .mutate(job_id, |job| {
                    job.chapters_processed += 1;
                    job.created_chapters.push(created.clone());
                    job.status_message = format!(
                        "created {} of {} chapters",
                        job.chapters_processed,
                        job.total()
                    );
                    true
                })
                .await?;
            outcome.created.push(created);
            if !recorded.applied {
                outcome.interrupted = true;
                break;
            }

            let request = ChapterAudioRequest {
                chapter_id: chapter_id.clone(),
                job_id: job_id.to_string(),
                novel_id: job.novel_id.clone(),
                chapter_number: new_chapter.number,
            };
            if let Err(err) = self.audio.dispatch(&request).await {
                tracing::warn!(job_id, chapter_id = %chapter_id, %err, "audio dispatch failed");
                outcome.dispatch_errors += 1;
                let message = format!("chapter {}: {err}", new_chapter.number);
                self.mutate(job_id, |job| {
                    job.errors.push(message);
                    true
                })
                .await?;
            }
        }

        Ok(outcome)
    }

    /// Applies one audio-completion callback. Each chapter counts once;
    /// the job completes when every chapter's audio is done.
    pub async fn on_audio_complete(
        &self,
        job_id: &str,
        chapter_id: &str,
    ) -> anyhow::Result<CallbackOutcome> {
        let mut outcome = CallbackOutcome::Ignored;
        self.mutate(job_id, |job| {
            if !job.owns_chapter(chapter_id) {
                outcome = CallbackOutcome::UnknownChapter;
                return false;
            }
            if !job.audio_completed_chapters.insert(chapter_id.to_string()) {
                outcome = CallbackOutcome::Duplicate;
                return false;
            }
            let done = u32::try_from(job.audio_completed_chapters.len()).unwrap_or(u32::MAX);
            job.audio_completed = done.min(job.total());
            let job_completed = job.is_audio_done();
            if job_completed {
                job.status = JobStatus::Completed;
                job.status_message = "import completed".to_string();
            } else {
                job.status_message =
                    format!("audio ready for {} of {} chapters", job.audio_completed, job.total());
            }
            outcome = CallbackOutcome::Applied { job_completed };
            true
        })
        .await?;

        tracing::debug!(job_id, chapter_id, ?outcome, "audio callback");
        Ok(outcome)
    }

    /// A worker could not generate a chapter's audio. The job fails; audio
    /// already reported for the chapter makes this a duplicate.
    pub async fn on_audio_failed(
        &self,
        job_id: &str,
        chapter_id: &str,
        reason: &str,
    ) -> anyhow::Result<CallbackOutcome> {
        let mut outcome = CallbackOutcome::Ignored;
        self.mutate(job_id, |job| {
            let Some(number) = job
                .created_chapters
                .iter()
                .find(|chapter| chapter.chapter_id == chapter_id)
                .map(|chapter| chapter.number)
            else {
                outcome = CallbackOutcome::UnknownChapter;
                return false;
            };
            if job.audio_completed_chapters.contains(chapter_id) {
                outcome = CallbackOutcome::Duplicate;
                return false;
            }
            let message = format!("audio generation failed for chapter {number}: {reason}");
            job.status = JobStatus::Failed;
            job.errors.push(message.clone());
            job.status_message = message;
            outcome = CallbackOutcome::JobFailed;
            true
        })
        .await?;

        tracing::debug!(job_id, chapter_id, reason, ?outcome, "audio failure callback");
        Ok(outcome)
    }

    /// Fails a non-terminal job. Terminal jobs are returned untouched.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> anyhow::Result<ImportJob> {
        let mutation = self
            .mutate(job_id, |job| {
                job.status = JobStatus::Failed;
                job.status_message = format!("cancelled: {reason}");
                true
            })
            .await?;
        if mutation.applied {
            tracing::info!(job_id, reason, "job cancelled");
        }
        Ok(mutation.job)
    }

    pub async fn fail(&self, job_id: &str, message: String) -> anyhow::Result<ImportJob> {
        let mutation = self
            .mutate(job_id, |job| {
                job.status = JobStatus::Failed;
                job.errors.push(message.clone());
                job.status_message = message;
                true
            })
            .await?;
        Ok(mutation.job)
    }

    /// Fails every non-terminal job not updated within the stalled-job age.
    pub async fn sweep_stalled(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let max_age = chrono::Duration::from_std(self.stalled_job_after)
            .context("stalled job age out of range")?;
        let cutoff = now - max_age;

        let mut swept = Vec::new();
        for candidate in self.jobs.list().await.context("list jobs")? {
            if candidate.status.is_terminal() || candidate.updated_at >= cutoff {
                continue;
            }
            let mutation = self
                .mutate(&candidate.id, |job| {
                    if job.updated_at >= cutoff {
                        return false;
                    }
                    let err = JobTimeoutError {
                        job_id: job.id.clone(),
                        status: job.status.to_string(),
                        max_age: self.stalled_job_after,
                    };
                    job.status = JobStatus::Failed;
                    job.status_message = err.to_string();
                    job.errors.push(err.to_string());
                    true
                })
                .await?;
            if mutation.applied {
                tracing::warn!(job_id = %candidate.id, "stalled job failed");
                swept.push(candidate.id);
            }
        }
        Ok(swept)
    }

    async fn require_job(&self, job_id: &str) -> anyhow::Result<ImportJob> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))
    }

    /// Read-modify-write under the job's lock. `apply` is skipped for
    /// terminal jobs and returns false to leave the job unpersisted.
    async fn mutate<F>(&self, job_id: &str, apply: F) -> anyhow::Result<Mutation>
    where
        F: FnOnce(&mut ImportJob) -> bool + Send,
    {
        let guard = self.locks.lock(job_id).await;
        let mut job = self.require_job(job_id).await?;
        if job.status.is_terminal() || !apply(&mut job) {
            return Ok(Mutation {
                job,
                applied: false,
            });
        }

        let now = Utc::now();
        job.updated_at = now;
        let finished = job.status.is_terminal();
        if finished && job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
        self.jobs.put(&job).await.context("save job")?;
        drop(guard);

        if finished {
            self.notifier.job_finished(&job).await;
        }
        Ok(Mutation { job, applied: true })
    }
}

/// The archive's own title, else the uploaded file's stem.
fn book_title(title: &str, original_file_name: Option<&str>) -> String {
    if !title.trim().is_empty() {
        return title.trim().to_string();
    }
    original_file_name
        .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
        .filter(|stem| !stem.is_empty())
        .unwrap_or("Untitled")
        .to_string()
}
