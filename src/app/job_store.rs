use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;

use crate::app::model::{ImportJob, NovelSource};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<ImportJob>>;
    async fn put(&self, job: &ImportJob) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<ImportJob>>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn get(&self, source_id: &str) -> anyhow::Result<Option<NovelSource>>;
    async fn put(&self, source: &NovelSource) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<NovelSource>>;
    /// False when there was nothing to delete.
    async fn delete(&self, source_id: &str) -> anyhow::Result<bool>;
}

/// Where uploaded archives live before they are parsed.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, source_file: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct LocalFsJobStore {
    base_dir: PathBuf,
}

impl LocalFsJobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn jobs_dir(&self) -> PathBuf {
        self.base_dir.join("jobs")
    }

    fn job_json_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(job_id).join("job.json")
    }
}

#[async_trait]
impl JobStore for LocalFsJobStore {
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<ImportJob>> {
        let path = self.job_json_path(job_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put(&self, job: &ImportJob) -> anyhow::Result<()> {
        write_json_atomic(&self.job_json_path(&job.id), job)
            .await
            .context("write job.json")
    }

    async fn list(&self) -> anyhow::Result<Vec<ImportJob>> {
        let mut jobs = Vec::new();
        for dir in list_entries(&self.jobs_dir()).await? {
            let path = dir.join("job.json");
            if let Some(job) = read_json(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a: &ImportJob, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

#[derive(Debug, Clone)]
pub struct LocalFsSourceStore {
    base_dir: PathBuf,
}

impl LocalFsSourceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn sources_dir(&self) -> PathBuf {
        self.base_dir.join("sources")
    }

    fn source_json_path(&self, source_id: &str) -> PathBuf {
        self.sources_dir().join(format!("{source_id}.json"))
    }
}

#[async_trait]
impl SourceStore for LocalFsSourceStore {
    async fn get(&self, source_id: &str) -> anyhow::Result<Option<NovelSource>> {
        let path = self.source_json_path(source_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put(&self, source: &NovelSource) -> anyhow::Result<()> {
        write_json_atomic(&self.source_json_path(&source.id), source)
            .await
            .context("write source json")
    }

    async fn list(&self) -> anyhow::Result<Vec<NovelSource>> {
        let mut sources = Vec::new();
        for path in list_entries(&self.sources_dir()).await? {
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(source) = read_json(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            {
                sources.push(source);
            }
        }
        sources.sort_by(|a: &NovelSource, b| a.id.cmp(&b.id));
        Ok(sources)
    }

    async fn delete(&self, source_id: &str) -> anyhow::Result<bool> {
        let path = self.source_json_path(source_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove: {}", path.display())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalFsFileStore {
    base_dir: PathBuf,
}

impl LocalFsFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl FileStore for LocalFsFileStore {
    async fn read(&self, source_file: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.base_dir.join(source_file);
        fs::read(&path)
            .await
            .with_context(|| format!("read source file: {}", path.display()))
    }
}

/// Entries of `dir`, sorted; a missing directory is empty.
async fn list_entries(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read dir: {}", dir.display())),
    };
    let mut paths = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .with_context(|| format!("read dir entry: {}", dir.display()))?
    {
        let path = entry.path();
        let is_tmp = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(".tmp."));
        if !is_tmp {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::app::model::{JobKind, JobStatus};

    #[tokio::test]
    async fn job_round_trips_and_lists() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = LocalFsJobStore::new(temp.path());
        assert!(store.get("missing").await?.is_none());
        assert!(store.list().await?.is_empty());

        let mut job = ImportJob::new(JobKind::ArchiveImport, "u".into(), "n".into(), Utc::now());
        store.put(&job).await?;
        job.status = JobStatus::Parsing;
        store.put(&job).await?;

        let loaded = store.get(&job.id).await?.expect("job exists");
        assert_eq!(loaded.status, JobStatus::Parsing);
        assert_eq!(store.list().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn source_list_ignores_leftover_tmp_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = LocalFsSourceStore::new(temp.path());
        let source = NovelSource::new(
            "u".into(),
            "n".into(),
            "https://example.com".into(),
            "web".into(),
            60,
            Utc::now(),
        );
        store.put(&source).await?;
        std::fs::write(temp.path().join("sources").join("x.tmp.abc"), b"{")?;

        let sources = store.list().await?;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, source.id);

        assert!(store.delete(&source.id).await?);
        assert!(!store.delete(&source.id).await?);
        assert!(store.get(&source.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn file_store_reads_relative_to_base() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("book.epub"), b"bytes")?;
        let store = LocalFsFileStore::new(temp.path());
        assert_eq!(store.read("book.epub").await?, b"bytes");
        assert!(store.read("nope.epub").await.is_err());
        Ok(())
    }
}
