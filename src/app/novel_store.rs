use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::app::job_store::{read_json, write_json_atomic};
use crate::app::model::{ChapterId, new_id};
use crate::error::ChapterWriteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChapter {
    pub novel_id: String,
    pub number: u32,
    pub title: String,
    pub html: String,
    /// Publish status requested by the uploader, if any.
    pub status: Option<String>,
}

/// Book-level metadata taken from an imported archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NovelMetadata {
    pub owner_id: String,
    pub title: String,
    pub author: String,
}

/// The novel/chapter catalogue chapters are written into.
#[async_trait]
pub trait NovelContent: Send + Sync {
    /// Creates the novel from `metadata` unless it already exists. Returns
    /// true when it was created. Existing novels keep their metadata.
    async fn ensure_novel(&self, novel_id: &str, metadata: &NovelMetadata) -> anyhow::Result<bool> {
        let _ = (novel_id, metadata);
        Ok(false)
    }

    async fn create_chapter(&self, chapter: &NewChapter) -> Result<ChapterId, ChapterWriteError>;

    /// 0 when the novel has no chapters yet.
    async fn highest_chapter_number(&self, novel_id: &str) -> anyhow::Result<u32>;

    async fn attach_cover(&self, novel_id: &str, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let _ = (novel_id, name, bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChapter {
    pub id: ChapterId,
    pub novel_id: String,
    pub number: u32,
    pub title: String,
    pub html: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNovel {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

const DEFAULT_CHAPTER_STATUS: &str = "draft";

/// Novels as `novels/<novel_id>/novel.json`, chapters as
/// `novels/<novel_id>/chapters/<number>.json`.
#[derive(Debug, Clone)]
pub struct LocalFsNovelContent {
    base_dir: PathBuf,
}

impl LocalFsNovelContent {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn novel_dir(&self, novel_id: &str) -> PathBuf {
        self.base_dir.join("novels").join(novel_id)
    }

    fn chapters_dir(&self, novel_id: &str) -> PathBuf {
        self.novel_dir(novel_id).join("chapters")
    }

    fn chapter_path(&self, novel_id: &str, number: u32) -> PathBuf {
        self.chapters_dir(novel_id).join(format!("{number}.json"))
    }

    fn novel_path(&self, novel_id: &str) -> PathBuf {
        self.novel_dir(novel_id).join("novel.json")
    }

    pub async fn get_novel(&self, novel_id: &str) -> anyhow::Result<Option<StoredNovel>> {
        let path = self.novel_path(novel_id);
        read_json(&path)
            .await
            .with_context(|| format!("read novel: {}", path.display()))
    }

    pub async fn list_chapters(&self, novel_id: &str) -> anyhow::Result<Vec<StoredChapter>> {
        let mut chapters = Vec::new();
        for number in self.chapter_numbers(novel_id).await? {
            let path = self.chapter_path(novel_id, number);
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?;
            let chapter: StoredChapter = serde_json::from_slice(&bytes)
                .with_context(|| format!("parse: {}", path.display()))?;
            chapters.push(chapter);
        }
        Ok(chapters)
    }

    async fn chapter_numbers(&self, novel_id: &str) -> anyhow::Result<Vec<u32>> {
        let dir = self.chapters_dir(novel_id);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read dir: {}", dir.display())),
        };
        let mut numbers = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("read dir entry: {}", dir.display()))?
        {
            let name = entry.file_name();
            if let Some(number) = name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

#[async_trait]
impl NovelContent for LocalFsNovelContent {
    async fn ensure_novel(&self, novel_id: &str, metadata: &NovelMetadata) -> anyhow::Result<bool> {
        if self.get_novel(novel_id).await?.is_some() {
            return Ok(false);
        }
        let novel = StoredNovel {
            id: novel_id.to_string(),
            owner_id: metadata.owner_id.clone(),
            title: metadata.title.clone(),
            author: metadata.author.clone(),
            created_at: Utc::now(),
        };
        write_json_atomic(&self.novel_path(novel_id), &novel).await?;
        Ok(true)
    }

    async fn create_chapter(&self, chapter: &NewChapter) -> Result<ChapterId, ChapterWriteError> {
        let storage = |err: anyhow::Error| ChapterWriteError::Storage {
            number: chapter.number,
            message: format!("{err:#}"),
        };

        let path = self.chapter_path(&chapter.novel_id, chapter.number);
        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("stat: {}", path.display()))
            .map_err(storage)?;
        if exists {
            return Err(ChapterWriteError::Duplicate {
                novel_id: chapter.novel_id.clone(),
                number: chapter.number,
            });
        }

        let stored = StoredChapter {
            id: new_id(),
            novel_id: chapter.novel_id.clone(),
            number: chapter.number,
            title: chapter.title.clone(),
            html: chapter.html.clone(),
            status: chapter
                .status
                .clone()
                .unwrap_or_else(|| DEFAULT_CHAPTER_STATUS.to_string()),
            created_at: Utc::now(),
        };
        write_json_atomic(&path, &stored).await.map_err(storage)?;
        Ok(stored.id)
    }

    async fn highest_chapter_number(&self, novel_id: &str) -> anyhow::Result<u32> {
        let numbers = self.chapter_numbers(novel_id).await?;
        Ok(numbers.last().copied().unwrap_or(0))
    }

    async fn attach_cover(&self, novel_id: &str, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let dir = self.novel_dir(novel_id).join("cover");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create cover dir: {}", dir.display()))?;
        let path = dir.join(file_name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("write cover: {}", path.display()))?;
        Ok(())
    }
}
