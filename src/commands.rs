use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;

use crate::app::coordinator::ImportCoordinator;
use crate::app::dispatcher::build_audio_dispatcher;
use crate::app::job_store::{LocalFsFileStore, LocalFsJobStore, LocalFsSourceStore};
use crate::app::novel_store::LocalFsNovelContent;
use crate::app::model::ChapterRange;
use crate::app::queue::InProcessQueue;
use crate::app::scheduler::{SchedulerOptions, SourceScheduler};
use crate::cli::{
    AudioCompleteArgs, AudioFailedArgs, CancelArgs, ImportArgs, JobArgs, ParseArgs, SourceAddArgs,
    SourceCommand, SourceUpdateArgs, SyncArgs,
};
use crate::config::Settings;
use crate::fetch::HttpChapterFetcher;

/// Local-filesystem wiring of the coordinator and scheduler.
pub struct Runtime {
    pub settings: Settings,
    pub coordinator: Arc<ImportCoordinator>,
    pub scheduler: Arc<SourceScheduler>,
    uploads_dir: PathBuf,
}

impl Runtime {
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let data_dir = settings.data_dir.clone();
        let uploads_dir = data_dir.join("uploads");

        let coordinator = Arc::new(
            ImportCoordinator::new(
                Arc::new(LocalFsJobStore::new(&data_dir)),
                Arc::new(LocalFsNovelContent::new(&data_dir)),
                Arc::new(LocalFsFileStore::new(&uploads_dir)),
                build_audio_dispatcher(&settings).context("build audio dispatcher")?,
            )
            .with_stalled_job_after(settings.stalled_job_after()),
        );
        let scheduler = Arc::new(SourceScheduler::new(
            Arc::new(LocalFsSourceStore::new(&data_dir)),
            Arc::clone(&coordinator),
            Arc::new(HttpChapterFetcher::new(&settings).context("build chapter fetcher")?),
            InProcessQueue::new(settings.max_concurrent_syncs),
            SchedulerOptions::from_settings(&settings),
        ));

        Ok(Self {
            settings,
            coordinator,
            scheduler,
            uploads_dir,
        })
    }

    /// Copies an archive into the upload area; returns its file-store name.
    async fn stage_upload(&self, path: &Path) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(&self.uploads_dir)
            .await
            .with_context(|| format!("create uploads dir: {}", self.uploads_dir.display()))?;
        let name = format!("{}.epub", uuid::Uuid::new_v4().simple());
        tokio::fs::copy(path, self.uploads_dir.join(&name))
            .await
            .with_context(|| format!("copy upload: {}", path.display()))?;
        Ok(name)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

pub fn parse(args: ParseArgs) -> anyhow::Result<()> {
    let bytes = std::fs::read(&args.epub)
        .with_context(|| format!("read epub: {}", args.epub.display()))?;
    let book = crate::epub::parse(&bytes).context("parse epub")?;
    print_json(&book)
}

pub async fn import(runtime: &Runtime, args: ImportArgs) -> anyhow::Result<()> {
    let source_file = runtime.stage_upload(&args.epub).await?;
    let original_file_name = args
        .epub
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let request = runtime
        .coordinator
        .submit_archive_import(
            &args.user_id,
            &args.novel_id,
            &source_file,
            original_file_name,
            args.requested_status,
        )
        .await?;
    let job = runtime.coordinator.process_archive_import(&request).await?;
    print_json(&job)
}

pub async fn audio_complete(runtime: &Runtime, args: AudioCompleteArgs) -> anyhow::Result<()> {
    let outcome = runtime
        .coordinator
        .on_audio_complete(&args.job, &args.chapter)
        .await?;
    println!("{outcome}");
    Ok(())
}

pub async fn audio_failed(runtime: &Runtime, args: AudioFailedArgs) -> anyhow::Result<()> {
    let outcome = runtime
        .coordinator
        .on_audio_failed(&args.job, &args.chapter, &args.reason)
        .await?;
    println!("{outcome}");
    Ok(())
}

pub async fn cancel(runtime: &Runtime, args: CancelArgs) -> anyhow::Result<()> {
    let job = runtime.coordinator.cancel(&args.job, &args.reason).await?;
    print_json(&job)
}

pub async fn job(runtime: &Runtime, args: JobArgs) -> anyhow::Result<()> {
    let job = runtime
        .coordinator
        .get_job(&args.job)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job not found: {}", args.job))?;
    print_json(&job)
}

pub async fn source(runtime: &Runtime, command: SourceCommand) -> anyhow::Result<()> {
    let scheduler = &runtime.scheduler;
    match command {
        SourceCommand::Add(SourceAddArgs {
            novel_id,
            user_id,
            url,
            platform,
            interval_minutes,
        }) => {
            let source = scheduler
                .register_source(&user_id, &novel_id, &url, &platform, interval_minutes)
                .await?;
            print_json(&source)
        }
        SourceCommand::List => print_json(&scheduler.list_sources().await?),
        SourceCommand::Enable(args) => print_json(&scheduler.set_enabled(&args.source, true).await?),
        SourceCommand::Disable(args) => {
            print_json(&scheduler.set_enabled(&args.source, false).await?)
        }
        SourceCommand::Update(SourceUpdateArgs {
            source,
            interval_minutes,
        }) => print_json(&scheduler.update_interval(&source, interval_minutes).await?),
        SourceCommand::Remove(args) => {
            let source = scheduler.remove_source(&args.source).await?;
            println!("removed {}", source.id);
            Ok(())
        }
    }
}

pub async fn sync(runtime: &Runtime, args: SyncArgs) -> anyhow::Result<()> {
    let scheduler = &runtime.scheduler;
    if let Some(source_id) = &args.source {
        let report = scheduler.sync_source(source_id, sync_range(&args)).await?;
        return print_json(&report.source);
    }

    if args.once {
        let started = scheduler.tick(Utc::now()).await?;
        let count = started.len();
        for sync in started {
            if let Err(err) = sync.handle.await {
                tracing::error!(source_id = %sync.source_id, ?err, "sync task panicked");
            }
        }
        println!("synced {count} sources");
        return Ok(());
    }

    tracing::info!(
        poll_interval_secs = runtime.settings.poll_interval_secs,
        "scheduler running; ctrl-c to stop"
    );
    Arc::clone(scheduler)
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(?err, "listen for ctrl-c");
            }
        })
        .await
}

/// `None` keeps the incremental default.
fn sync_range(args: &SyncArgs) -> Option<ChapterRange> {
    if args.full {
        return Some(ChapterRange::Full);
    }
    if args.start.is_none() && args.end.is_none() {
        return None;
    }
    Some(ChapterRange::Range {
        start: args.start.unwrap_or(1),
        end: args.end,
    })
}

pub async fn sweep(runtime: &Runtime) -> anyhow::Result<()> {
    let swept = runtime.coordinator.sweep_stalled(Utc::now()).await?;
    print_json(&swept)
}
