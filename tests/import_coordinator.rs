mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use common::{CONTAINER, Harness, RecordingAudio, package_opf, simple_epub, zip_bytes};
use novelingest::app::coordinator::{CallbackOutcome, ImportCoordinator, Notifier};
use novelingest::app::job_store::{JobStore, LocalFsJobStore};
use novelingest::app::model::{ArchiveKind, ImportJob, ImportRequest, JobStatus, NovelSource};
use novelingest::app::novel_store::NovelMetadata;

const NOVEL: &str = "novel-1";
const USER: &str = "user-1";

async fn import(
    harness: &Harness,
    coordinator: &ImportCoordinator,
    bytes: Vec<u8>,
) -> anyhow::Result<ImportJob> {
    harness.files.insert("upload.epub", bytes);
    let request = coordinator
        .submit_archive_import(USER, NOVEL, "upload.epub", Some("book.epub".into()), None)
        .await?;
    coordinator.process_archive_import(&request).await
}

fn chapter_ids(job: &ImportJob) -> Vec<String> {
    job.created_chapters
        .iter()
        .map(|chapter| chapter.chapter_id.clone())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_callbacks_count_once() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = Arc::new(harness.coordinator());
    let job = import(&harness, &coordinator, simple_epub(3)).await?;
    assert_eq!(job.status, JobStatus::GeneratingAudio);
    assert_eq!(job.total_chapters, Some(3));
    assert_eq!(job.chapters_processed, 3);
    let ids = chapter_ids(&job);

    let tasks = (0..2)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let job_id = job.id.clone();
            let chapter_id = ids[0].clone();
            tokio::spawn(async move { coordinator.on_audio_complete(&job_id, &chapter_id).await })
        })
        .collect::<Vec<_>>();
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await??);
    }
    assert!(outcomes.contains(&CallbackOutcome::Applied {
        job_completed: false
    }));
    assert!(outcomes.contains(&CallbackOutcome::Duplicate));

    let job = coordinator.get_job(&job.id).await?.expect("job");
    assert_eq!(job.audio_completed, 1);
    assert_eq!(job.status, JobStatus::GeneratingAudio);

    assert_eq!(
        coordinator.on_audio_complete(&job.id, &ids[1]).await?,
        CallbackOutcome::Applied {
            job_completed: false
        }
    );
    assert_eq!(
        coordinator.on_audio_complete(&job.id, &ids[2]).await?,
        CallbackOutcome::Applied {
            job_completed: true
        }
    );
    assert_eq!(
        coordinator.on_audio_complete(&job.id, &ids[2]).await?,
        CallbackOutcome::Ignored
    );

    let job = coordinator.get_job(&job.id).await?.expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.audio_completed, 3);
    assert!(job.completed_at.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_callbacks_never_exceed_total() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = Arc::new(harness.coordinator());
    let job = import(&harness, &coordinator, simple_epub(4)).await?;
    let ids = chapter_ids(&job);

    let mut tasks = Vec::new();
    for _ in 0..3 {
        for chapter_id in &ids {
            let coordinator = Arc::clone(&coordinator);
            let job_id = job.id.clone();
            let chapter_id = chapter_id.clone();
            tasks.push(tokio::spawn(async move {
                coordinator.on_audio_complete(&job_id, &chapter_id).await
            }));
        }
    }
    let mut completions = 0;
    for task in tasks {
        if task.await?? == (CallbackOutcome::Applied { job_completed: true }) {
            completions += 1;
        }
    }

    let job = coordinator.get_job(&job.id).await?.expect("job");
    assert_eq!(completions, 1);
    assert_eq!(job.audio_completed, 4);
    assert_eq!(job.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn book_without_chapters_completes_immediately() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let opf = package_opf("Front matter only", "", &["toc.xhtml"]);
    let bytes = zip_bytes(&[
        ("META-INF/container.xml", CONTAINER.as_bytes()),
        ("OEBPS/content.opf", opf.as_bytes()),
        ("OEBPS/toc.xhtml", b"<p>contents</p>"),
    ]);

    let job = import(&harness, &coordinator, bytes).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_chapters, Some(0));
    assert!(job.completed_at.is_some());
    assert!(harness.audio.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn chapters_are_numbered_after_existing_ones() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness.novels.seed(NOVEL, 7);
    let coordinator = harness.coordinator();

    let job = import(&harness, &coordinator, simple_epub(2)).await?;
    assert_eq!(harness.novels.numbers(NOVEL), vec![7, 8, 9]);
    let numbers = job
        .created_chapters
        .iter()
        .map(|c| c.number)
        .collect::<Vec<_>>();
    assert_eq!(numbers, vec![8, 9]);

    let requests = harness.audio.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].chapter_number, 8);
    assert_eq!(requests[0].job_id, job.id);
    assert_eq!(requests[0].novel_id, NOVEL);
    Ok(())
}

#[tokio::test]
async fn requested_status_and_cover_reach_the_catalogue() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let opf = package_opf("Covered", "", &["ch1.xhtml"]);
    harness.files.insert(
        "covered.epub",
        zip_bytes(&[
            ("META-INF/container.xml", CONTAINER.as_bytes()),
            ("OEBPS/content.opf", opf.as_bytes()),
            ("OEBPS/ch1.xhtml", b"<h1>One</h1><p>x</p>"),
            ("cover.jpg", b"jpg"),
        ]),
    );
    let request = coordinator
        .submit_archive_import(USER, NOVEL, "covered.epub", None, Some("published".into()))
        .await?;
    coordinator.process_archive_import(&request).await?;

    let chapter = harness.novels.chapter(NOVEL, 1).expect("chapter 1");
    assert_eq!(chapter.title, "One");
    assert_eq!(chapter.status.as_deref(), Some("published"));
    assert_eq!(
        harness.novels.covers(),
        vec![(NOVEL.to_string(), "cover.jpg".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn failed_chapter_write_is_recorded_and_skipped() -> anyhow::Result<()> {
    let harness = Harness::new();
    harness.novels.fail_on(2);
    let coordinator = harness.coordinator();

    let job = import(&harness, &coordinator, simple_epub(3)).await?;
    assert_eq!(job.status, JobStatus::GeneratingAudio);
    assert_eq!(job.total_chapters, Some(3));
    assert_eq!(job.chapters_processed, 2);
    assert_eq!(job.errors.len(), 1);
    assert!(job.errors[0].contains("disk full"));
    assert_eq!(harness.novels.numbers(NOVEL), vec![1, 3]);
    assert_eq!(harness.audio.requests().len(), 2);

    for chapter_id in chapter_ids(&job) {
        coordinator.on_audio_complete(&job.id, &chapter_id).await?;
    }
    let job = coordinator.get_job(&job.id).await?.expect("job");
    assert_eq!(job.audio_completed, 2);
    assert_eq!(job.status, JobStatus::GeneratingAudio);
    Ok(())
}

#[tokio::test]
async fn audio_dispatch_failure_leaves_chapter_processed() -> anyhow::Result<()> {
    let harness = Harness::with_audio(RecordingAudio::failing());
    let coordinator = harness.coordinator();

    let job = import(&harness, &coordinator, simple_epub(2)).await?;
    assert_eq!(job.chapters_processed, 2);
    assert_eq!(job.errors.len(), 2);
    assert!(job.errors[0].contains("audio queue closed"));
    assert_eq!(job.status, JobStatus::GeneratingAudio);
    Ok(())
}

#[tokio::test]
async fn unreadable_archive_fails_the_job() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();

    let job = import(&harness, &coordinator, b"PK? not really".to_vec()).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.status_message.contains("zip"));
    assert!(job.completed_at.is_some());
    assert!(harness.novels.numbers(NOVEL).is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_upload_fails_the_job() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let request = coordinator
        .submit_archive_import(USER, NOVEL, "never-uploaded.epub", None, None)
        .await?;

    let job = coordinator.process_archive_import(&request).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.status_message.contains("never-uploaded.epub"));
    Ok(())
}

#[tokio::test]
async fn redelivered_import_request_is_a_no_op() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    harness.files.insert("upload.epub", simple_epub(2));
    let request = coordinator
        .submit_archive_import(USER, NOVEL, "upload.epub", None, None)
        .await?;

    coordinator.process_archive_import(&request).await?;
    let again = coordinator.process_archive_import(&request).await?;
    assert_eq!(again.chapters_processed, 2);
    assert_eq!(harness.novels.numbers(NOVEL), vec![1, 2]);
    assert_eq!(harness.audio.requests().len(), 2);
    Ok(())
}

#[tokio::test]
async fn cancelled_job_ignores_late_callbacks() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let job = import(&harness, &coordinator, simple_epub(2)).await?;
    let ids = chapter_ids(&job);

    let cancelled = coordinator.cancel(&job.id, "user asked").await?;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.status_message, "cancelled: user asked");

    assert_eq!(
        coordinator.on_audio_complete(&job.id, &ids[0]).await?,
        CallbackOutcome::Ignored
    );
    let again = coordinator.cancel(&job.id, "second time").await?;
    assert_eq!(again.status_message, "cancelled: user asked");
    assert_eq!(again.audio_completed, 0);
    Ok(())
}

#[tokio::test]
async fn audio_failure_fails_the_job_and_later_callbacks_are_ignored() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let job = import(&harness, &coordinator, simple_epub(2)).await?;
    let ids = chapter_ids(&job);

    coordinator.on_audio_complete(&job.id, &ids[0]).await?;
    assert_eq!(
        coordinator.on_audio_failed(&job.id, &ids[0], "late retry").await?,
        CallbackOutcome::Duplicate
    );
    assert_eq!(
        coordinator.on_audio_failed(&job.id, "someone-elses", "x").await?,
        CallbackOutcome::UnknownChapter
    );
    assert_eq!(
        coordinator.on_audio_failed(&job.id, &ids[1], "tts timeout").await?,
        CallbackOutcome::JobFailed
    );

    let failed = coordinator.get_job(&job.id).await?.expect("job");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.status_message,
        "audio generation failed for chapter 2: tts timeout"
    );
    assert!(failed.completed_at.is_some());
    assert_eq!(
        coordinator.on_audio_complete(&job.id, &ids[1]).await?,
        CallbackOutcome::Ignored
    );
    assert_eq!(
        coordinator.on_audio_failed(&job.id, &ids[1], "again").await?,
        CallbackOutcome::Ignored
    );
    Ok(())
}

#[tokio::test]
async fn archive_import_creates_the_novel_from_book_metadata() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    import(&harness, &coordinator, simple_epub(1)).await?;
    assert_eq!(
        harness.novels.novel(NOVEL),
        Some(NovelMetadata {
            owner_id: USER.to_string(),
            title: "Sample".to_string(),
            author: "Author".to_string(),
        })
    );

    let opf = package_opf("", "", &["ch1.xhtml"]);
    harness.files.insert(
        "untitled.epub",
        zip_bytes(&[
            ("META-INF/container.xml", CONTAINER.as_bytes()),
            ("OEBPS/content.opf", opf.as_bytes()),
            ("OEBPS/ch1.xhtml", b"<h1>One</h1><p>x</p>"),
        ]),
    );
    let request = coordinator
        .submit_archive_import(USER, "novel-2", "untitled.epub", Some("my book.epub".into()), None)
        .await?;
    coordinator.process_archive_import(&request).await?;
    let novel = harness.novels.novel("novel-2").expect("novel-2");
    assert_eq!(novel.title, "my book");
    assert_eq!(novel.author, "");
    Ok(())
}

#[tokio::test]
async fn source_job_must_fetch_before_creating_chapters() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let source = NovelSource::new(
        USER.to_string(),
        NOVEL.to_string(),
        "https://novels.example.com/book".to_string(),
        "web".to_string(),
        60,
        Utc::now(),
    );
    let job = coordinator.create_source_job(&source).await?;
    assert_eq!(job.status, JobStatus::Queued);

    assert!(!coordinator.begin_chapter_creation(&job.id, 1, Vec::new()).await?);
    assert!(coordinator.begin_source_fetch(&job.id).await?);
    assert!(!coordinator.begin_source_fetch(&job.id).await?);
    let job = coordinator.get_job(&job.id).await?.expect("job");
    assert_eq!(job.status, JobStatus::Parsing);
    assert!(coordinator.begin_chapter_creation(&job.id, 1, Vec::new()).await?);
    Ok(())
}

#[tokio::test]
async fn import_of_vanished_job_reports_the_original_error() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    harness.files.insert("upload.epub", simple_epub(1));
    let request = ImportRequest {
        job_id: "never-submitted".to_string(),
        user_id: USER.to_string(),
        novel_id: NOVEL.to_string(),
        source_file: "upload.epub".to_string(),
        requested_status: None,
        archive_kind: ArchiveKind::Epub,
    };

    let err = coordinator.process_archive_import(&request).await.unwrap_err();
    assert!(format!("{err:#}").contains("job not found: never-submitted"));
    assert!(coordinator.get_job("never-submitted").await?.is_none());
    assert!(harness.novels.numbers(NOVEL).is_empty());
    Ok(())
}

#[tokio::test]
async fn callback_for_foreign_chapter_is_unknown() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let job = import(&harness, &coordinator, simple_epub(1)).await?;

    assert_eq!(
        coordinator.on_audio_complete(&job.id, "someone-elses").await?,
        CallbackOutcome::UnknownChapter
    );
    let job = coordinator.get_job(&job.id).await?.expect("job");
    assert_eq!(job.audio_completed, 0);
    Ok(())
}

#[tokio::test]
async fn stalled_jobs_are_swept_and_fresh_ones_kept() -> anyhow::Result<()> {
    let harness = Harness::new();
    let coordinator = harness
        .coordinator()
        .with_stalled_job_after(std::time::Duration::from_secs(60 * 60));
    let stalled = coordinator
        .submit_archive_import(USER, NOVEL, "a.epub", None, None)
        .await?;
    let finished = import(&harness, &coordinator, b"junk".to_vec()).await?;
    assert_eq!(finished.status, JobStatus::Failed);

    assert!(coordinator.sweep_stalled(Utc::now()).await?.is_empty());

    let swept = coordinator
        .sweep_stalled(Utc::now() + Duration::hours(2))
        .await?;
    assert_eq!(swept, vec![stalled.job_id.clone()]);
    let job = coordinator.get_job(&stalled.job_id).await?.expect("job");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.status_message.contains("stalled in queued"));
    Ok(())
}

struct SnapshotNotifier {
    store: Arc<LocalFsJobStore>,
    seen: Mutex<Vec<(JobStatus, Option<JobStatus>)>>,
}

#[async_trait]
impl Notifier for SnapshotNotifier {
    async fn job_finished(&self, job: &ImportJob) {
        let persisted = self.store.get(&job.id).await.ok().flatten().map(|j| j.status);
        self.seen.lock().unwrap().push((job.status, persisted));
    }
}

#[tokio::test]
async fn terminal_state_is_persisted_before_notification() -> anyhow::Result<()> {
    let harness = Harness::new();
    let notifier = Arc::new(SnapshotNotifier {
        store: harness.job_store(),
        seen: Mutex::new(Vec::new()),
    });
    let coordinator = harness
        .coordinator()
        .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>);

    let job = import(&harness, &coordinator, simple_epub(1)).await?;
    assert!(notifier.seen.lock().unwrap().is_empty());
    let chapter_id = chapter_ids(&job).remove(0);
    coordinator.on_audio_complete(&job.id, &chapter_id).await?;
    coordinator.on_audio_complete(&job.id, &chapter_id).await?;

    let seen = notifier.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(JobStatus::Completed, Some(JobStatus::Completed))]
    );
    Ok(())
}
