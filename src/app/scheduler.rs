use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::app::coordinator::{ImportCoordinator, PendingChapter, PersistOptions};
use crate::app::job_store::SourceStore;
use crate::app::model::{ChapterRange, JobId, NovelSource, SourceId, SyncStatus};
use crate::app::queue::InProcessQueue;
use crate::config::Settings;
use crate::error::SyncInProgress;
use crate::fetch::{ChapterFetcher, parse_source_url};

/// Failure backoff: `min(interval * 2^failures, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_backoff_minutes: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_backoff_minutes: 1440,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_backoff_minutes: u32) -> Self {
        Self {
            max_backoff_minutes,
        }
    }

    pub fn delay_minutes(&self, interval_minutes: u32, failures: u32) -> u64 {
        let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        u64::from(interval_minutes.max(1))
            .saturating_mul(factor)
            .min(u64::from(self.max_backoff_minutes))
    }

    pub fn delay(&self, interval_minutes: u32, failures: u32) -> chrono::Duration {
        let minutes = self.delay_minutes(interval_minutes, failures);
        chrono::Duration::minutes(i64::try_from(minutes).unwrap_or(i64::from(u32::MAX)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub backoff: BackoffPolicy,
    /// 0 never disables.
    pub disable_after_failures: u32,
    pub poll_interval: Duration,
    /// A `syncing` source whose attempt started longer ago than this is
    /// treated as orphaned and may be picked up again.
    pub sync_lease: Duration,
    pub default_sync_interval_minutes: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            disable_after_failures: 10,
            poll_interval: Duration::from_secs(900),
            sync_lease: Duration::from_secs(6 * 60 * 60),
            default_sync_interval_minutes: 60,
        }
    }
}

impl SchedulerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            backoff: BackoffPolicy::new(settings.max_backoff_minutes),
            disable_after_failures: settings.disable_after_failures,
            poll_interval: settings.poll_interval(),
            sync_lease: settings.stalled_job_after(),
            default_sync_interval_minutes: settings.default_sync_interval_minutes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub source: NovelSource,
    pub job_id: JobId,
    pub created: usize,
    pub succeeded: bool,
}

#[derive(Debug)]
pub struct StartedSync {
    pub source_id: SourceId,
    pub handle: JoinHandle<()>,
}

struct Attempt {
    created: usize,
    highest_persisted: Option<u32>,
    failure: Option<String>,
}

pub struct SourceScheduler {
    sources: Arc<dyn SourceStore>,
    coordinator: Arc<ImportCoordinator>,
    fetcher: Arc<dyn ChapterFetcher>,
    queue: InProcessQueue,
    in_flight: Arc<Mutex<HashSet<SourceId>>>,
    options: SchedulerOptions,
}

impl SourceScheduler {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        coordinator: Arc<ImportCoordinator>,
        fetcher: Arc<dyn ChapterFetcher>,
        queue: InProcessQueue,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            sources,
            coordinator,
            fetcher,
            queue,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            options,
        }
    }

    pub async fn get_source(&self, source_id: &str) -> anyhow::Result<Option<NovelSource>> {
        self.sources.get(source_id).await.context("load source")
    }

    pub async fn list_sources(&self) -> anyhow::Result<Vec<NovelSource>> {
        self.sources.list().await.context("list sources")
    }

    /// Creates an enabled source that is due immediately.
    pub async fn register_source(
        &self,
        user_id: &str,
        novel_id: &str,
        source_url: &str,
        platform: &str,
        sync_interval_minutes: Option<u32>,
    ) -> anyhow::Result<NovelSource> {
        let url = parse_source_url(source_url)?;
        let source = NovelSource::new(
            user_id.to_string(),
            novel_id.to_string(),
            url.to_string(),
            platform.to_string(),
            sync_interval_minutes.unwrap_or(self.options.default_sync_interval_minutes),
            Utc::now(),
        );
        self.sources.put(&source).await.context("save source")?;
        tracing::info!(source_id = %source.id, novel_id, url = %source.source_url, "source registered");
        Ok(source)
    }

    /// Re-enabling clears the failure streak and makes the source due now.
    pub async fn set_enabled(&self, source_id: &str, enabled: bool) -> anyhow::Result<NovelSource> {
        let mut source = self.require_source(source_id).await?;
        source.enabled = enabled;
        if enabled {
            source.consecutive_failures = 0;
            source.error_message = None;
            source.next_sync_time = Utc::now();
        }
        self.sources.put(&source).await.context("save source")?;
        tracing::info!(source_id, enabled, "source toggled");
        Ok(source)
    }

    /// Changes the interval between successful syncs. A source that is not
    /// backing off is rescheduled from its last sync.
    pub async fn update_interval(
        &self,
        source_id: &str,
        sync_interval_minutes: u32,
    ) -> anyhow::Result<NovelSource> {
        if sync_interval_minutes == 0 {
            anyhow::bail!("sync interval must be at least one minute");
        }
        let mut source = self.require_source(source_id).await?;
        source.sync_interval_minutes = sync_interval_minutes;
        if source.sync_status != SyncStatus::Failed {
            let interval = chrono::Duration::minutes(i64::from(sync_interval_minutes));
            source.next_sync_time = source
                .last_sync_time
                .map_or_else(Utc::now, |last| last + interval);
        }
        self.sources.put(&source).await.context("save source")?;
        tracing::info!(source_id, sync_interval_minutes, "source interval updated");
        Ok(source)
    }

    /// Deletes a source that is not syncing. Its jobs and chapters stay.
    pub async fn remove_source(&self, source_id: &str) -> anyhow::Result<NovelSource> {
        let _claim = InFlight::claim(&self.in_flight, source_id).ok_or_else(|| SyncInProgress {
            source_id: source_id.to_string(),
        })?;
        let source = self.require_source(source_id).await?;
        if self.lease_held(&source, Utc::now())? {
            return Err(SyncInProgress {
                source_id: source_id.to_string(),
            }
            .into());
        }
        self.sources.delete(source_id).await.context("delete source")?;
        tracing::info!(source_id, "source removed");
        Ok(source)
    }

    /// A `syncing` record whose attempt started inside the lease.
    fn lease_held(&self, source: &NovelSource, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let lease = chrono::Duration::from_std(self.options.sync_lease)
            .context("sync lease out of range")?;
        Ok(source.sync_status == SyncStatus::Syncing
            && source
                .sync_started_at
                .is_some_and(|started_at| now - started_at < lease))
    }

    /// Starts one attempt per due source that is not already being synced.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> anyhow::Result<Vec<StartedSync>> {
        let mut started = Vec::new();

        for source in self.list_sources().await? {
            if !source.is_due(now) {
                continue;
            }
            if self.lease_held(&source, now)? {
                tracing::debug!(source_id = %source.id, "sync already running; skipping");
                continue;
            }
            let Some(claim) = InFlight::claim(&self.in_flight, &source.id) else {
                continue;
            };

            let scheduler = Arc::clone(self);
            let source_id = source.id.clone();
            let handle = self.queue.spawn(async move {
                if let Err(err) = scheduler.sync_claimed(&claim, &source_id, None).await {
                    tracing::error!(source_id = %source_id, ?err, "source sync failed");
                }
            });
            started.push(StartedSync {
                source_id: source.id,
                handle,
            });
        }
        Ok(started)
    }

    /// One sync attempt. `None` syncs incrementally past the newest chapter
    /// the novel already has. Fails with [`SyncInProgress`] while another
    /// attempt holds the source.
    pub async fn sync_source(
        &self,
        source_id: &str,
        range: Option<ChapterRange>,
    ) -> anyhow::Result<SyncReport> {
        let claim = InFlight::claim(&self.in_flight, source_id).ok_or_else(|| SyncInProgress {
            source_id: source_id.to_string(),
        })?;
        let source = self.require_source(source_id).await?;
        if self.lease_held(&source, Utc::now())? {
            return Err(SyncInProgress {
                source_id: source_id.to_string(),
            }
            .into());
        }
        self.sync_claimed(&claim, source_id, range).await
    }

    async fn sync_claimed(
        &self,
        _claim: &InFlight,
        source_id: &str,
        range: Option<ChapterRange>,
    ) -> anyhow::Result<SyncReport> {
        let mut source = self.require_source(source_id).await?;
        source.sync_status = SyncStatus::Syncing;
        source.sync_started_at = Some(Utc::now());
        self.sources.put(&source).await.context("save source")?;

        let job = match self.coordinator.create_source_job(&source).await {
            Ok(job) => job,
            Err(err) => {
                let message = format!("create sync job: {err:#}");
                let mut source = self.require_source(source_id).await?;
                source.sync_started_at = None;
                self.record_failure(&mut source, message, Utc::now());
                self.sources.put(&source).await.context("save source")?;
                return Err(err);
            }
        };
        tracing::info!(source_id, job_id = %job.id, "source sync started");

        let attempt = match self.attempt(&source, &job.id, range).await {
            Ok(attempt) => attempt,
            Err(err) => Attempt {
                created: 0,
                highest_persisted: None,
                failure: Some(format!("{err:#}")),
            },
        };
        if let Some(message) = &attempt.failure
            && let Err(err) = self.coordinator.fail(&job.id, message.clone()).await
        {
            tracing::warn!(source_id, job_id = %job.id, ?err, "record sync job failure");
        }

        let now = Utc::now();
        let mut source = self.require_source(source_id).await?;
        if let Some(highest) = attempt.highest_persisted {
            let last = source.last_synced_chapter.unwrap_or(0);
            source.last_synced_chapter = Some(last.max(highest));
        }
        source.sync_started_at = None;
        let succeeded = attempt.failure.is_none();
        match attempt.failure {
            None => self.record_success(&mut source, now),
            Some(message) => self.record_failure(&mut source, message, now),
        }
        self.sources.put(&source).await.context("save source")?;

        Ok(SyncReport {
            source,
            job_id: job.id,
            created: attempt.created,
            succeeded,
        })
    }

    async fn attempt(
        &self,
        source: &NovelSource,
        job_id: &str,
        range: Option<ChapterRange>,
    ) -> anyhow::Result<Attempt> {
        let highest = self
            .coordinator
            .novels()
            .highest_chapter_number(&source.novel_id)
            .await
            .context("load highest chapter number")?;
        let range = range.unwrap_or_else(|| {
            let last = source.last_synced_chapter.unwrap_or(0);
            ChapterRange::starting_at(last.max(highest) + 1)
        });

        if !self.coordinator.begin_source_fetch(job_id).await? {
            return Ok(Attempt {
                created: 0,
                highest_persisted: None,
                failure: Some("sync job ended before chapters were fetched".to_string()),
            });
        }

        let fetched = match self.fetcher.fetch_chapters(&source.source_url, range).await {
            Ok(fetched) => fetched,
            Err(err) => {
                return Ok(Attempt {
                    created: 0,
                    highest_persisted: None,
                    failure: Some(err.to_string()),
                });
            }
        };
        let mut pending = fetched
            .into_iter()
            .filter(|chapter| range.contains(chapter.number))
            .filter(|chapter| range != ChapterRange::Full || chapter.number > highest)
            .map(PendingChapter::from)
            .collect::<Vec<_>>();
        pending.sort_by_key(|chapter| chapter.number);

        let total = u32::try_from(pending.len()).context("too many chapters")?;
        if !self
            .coordinator
            .begin_chapter_creation(job_id, total, Vec::new())
            .await?
        {
            return Ok(Attempt {
                created: 0,
                highest_persisted: None,
                failure: Some("sync job ended before chapters were written".to_string()),
            });
        }

        let outcome = self
            .coordinator
            .persist_chapters(
                job_id,
                pending,
                PersistOptions {
                    stop_on_write_error: true,
                },
            )
            .await?;
        self.coordinator.finish_chapter_creation(job_id).await?;

        let failure = if outcome.interrupted {
            Some("sync job ended while chapters were written".to_string())
        } else if outcome.write_errors > 0 {
            let job = self.coordinator.get_job(job_id).await?;
            let detail = job
                .and_then(|job| job.errors.last().cloned())
                .unwrap_or_else(|| "chapter write failed".to_string());
            Some(detail)
        } else {
            None
        };

        Ok(Attempt {
            created: outcome.created.len(),
            highest_persisted: outcome.highest_created(),
            failure,
        })
    }

    fn record_success(&self, source: &mut NovelSource, now: DateTime<Utc>) {
        source.sync_status = SyncStatus::Success;
        source.consecutive_failures = 0;
        source.error_message = None;
        source.last_sync_time = Some(now);
        source.next_sync_time =
            now + chrono::Duration::minutes(i64::from(source.sync_interval_minutes.max(1)));
        tracing::info!(
            source_id = %source.id,
            last_synced_chapter = ?source.last_synced_chapter,
            next_sync_time = %source.next_sync_time,
            "source sync succeeded"
        );
    }

    fn record_failure(&self, source: &mut NovelSource, message: String, now: DateTime<Utc>) {
        source.sync_status = SyncStatus::Failed;
        source.consecutive_failures = source.consecutive_failures.saturating_add(1);
        source.next_sync_time = now
            + self
                .options
                .backoff
                .delay(source.sync_interval_minutes, source.consecutive_failures);
        let threshold = self.options.disable_after_failures;
        if threshold > 0 && source.consecutive_failures >= threshold {
            source.enabled = false;
        }
        tracing::warn!(
            source_id = %source.id,
            failures = source.consecutive_failures,
            disabled = !source.enabled,
            error = %message,
            "source sync failed"
        );
        source.error_message = Some(message);
    }

    /// Polls on `poll_interval` and sweeps stalled jobs until `shutdown`
    /// resolves. In-flight attempts are left to finish on their own.
    pub async fn run<S>(self: Arc<Self>, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    match self.tick(now).await {
                        Ok(started) if !started.is_empty() => {
                            tracing::info!(started = started.len(), "source syncs started");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(?err, "scheduler tick failed"),
                    }
                    match self.coordinator.sweep_stalled(now).await {
                        Ok(swept) if !swept.is_empty() => {
                            tracing::warn!(swept = swept.len(), "stalled jobs failed");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(?err, "stalled job sweep failed"),
                    }
                }
            }
        }

        tracing::info!("scheduler stopped");
        Ok(())
    }

    async fn require_source(&self, source_id: &str) -> anyhow::Result<NovelSource> {
        self.get_source(source_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("source not found: {source_id}"))
    }
}

/// Membership in the in-flight set, released on drop.
struct InFlight {
    set: Arc<Mutex<HashSet<SourceId>>>,
    source_id: SourceId,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<SourceId>>>, source_id: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.insert(source_id.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            source_id: source_id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy::default();
        let delays = (0..8)
            .map(|failures| policy.delay_minutes(60, failures))
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1440, 1440, 1440]);
    }

    #[test]
    fn backoff_is_monotone_and_bounded_for_huge_failure_counts() {
        let policy = BackoffPolicy::new(300);
        let mut previous = 0;
        for failures in [0, 1, 2, 10, 31, 63, 64, 200, u32::MAX] {
            let delay = policy.delay_minutes(7, failures);
            assert!(delay >= previous);
            assert!(delay <= 300);
            previous = delay;
        }
    }

    #[test]
    fn in_flight_claim_is_exclusive_until_dropped() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let first = InFlight::claim(&set, "s1").expect("first claim");
        assert!(InFlight::claim(&set, "s1").is_none());
        assert!(InFlight::claim(&set, "s2").is_some());
        drop(first);
        assert!(InFlight::claim(&set, "s1").is_some());
    }
}
