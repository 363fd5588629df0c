use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::{Mutex, mpsc};

use crate::app::model::ChapterAudioRequest;
use crate::config::Settings;
use crate::error::AudioDispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Outbox,
    Worker,
    Channel,
}

impl DispatchMode {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "outbox" => Ok(Self::Outbox),
            "worker" => Ok(Self::Worker),
            "channel" => Ok(Self::Channel),
            other => anyhow::bail!("unsupported dispatch mode: {other}"),
        }
    }
}

/// Hands created chapters to the audio generator.
#[async_trait]
pub trait AudioDispatcher: Send + Sync {
    async fn dispatch(&self, request: &ChapterAudioRequest) -> Result<(), AudioDispatchError>;
}

/// Builds the dispatcher for modes that need nothing but configuration.
pub fn build_audio_dispatcher(settings: &Settings) -> anyhow::Result<Arc<dyn AudioDispatcher>> {
    match settings.dispatch_mode {
        DispatchMode::Outbox => Ok(Arc::new(OutboxAudioDispatcher::new(
            OutboxAudioDispatcher::default_path(&settings.data_dir),
        ))),
        DispatchMode::Worker => {
            let url = settings
                .audio_worker_url
                .as_deref()
                .context("audio_worker_url is required for worker dispatch mode")?;
            Ok(Arc::new(HttpAudioDispatcher::new(
                url,
                settings.audio_worker_token.clone(),
            )?))
        }
        DispatchMode::Channel => {
            anyhow::bail!("channel dispatch mode needs an in-process consumer; use outbox or worker")
        }
    }
}

/// Appends one JSON line per request; an external worker drains the file.
#[derive(Debug)]
pub struct OutboxAudioDispatcher {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OutboxAudioDispatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn default_path(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("outbox").join("audio.jsonl")
    }

    pub async fn pending(&self) -> anyhow::Result<Vec<ChapterAudioRequest>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read outbox: {}", self.path.display()));
            }
        };
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("parse outbox line"))
            .collect()
    }

    async fn append(&self, line: &[u8]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create outbox dir: {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open outbox: {}", self.path.display()))?;
        file.write_all(line).await.context("append outbox line")?;
        file.flush().await.context("flush outbox")?;
        Ok(())
    }
}

#[async_trait]
impl AudioDispatcher for OutboxAudioDispatcher {
    async fn dispatch(&self, request: &ChapterAudioRequest) -> Result<(), AudioDispatchError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|err| AudioDispatchError::Outbox(err.to_string()))?;
        line.push(b'\n');
        self.append(&line)
            .await
            .map_err(|err| AudioDispatchError::Outbox(format!("{err:#}")))
    }
}

#[derive(Clone)]
pub struct HttpAudioDispatcher {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpAudioDispatcher {
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            anyhow::bail!("audio worker url is empty");
        }
        let auth_token = auth_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            auth_token,
        })
    }
}

#[async_trait]
impl AudioDispatcher for HttpAudioDispatcher {
    async fn dispatch(&self, request: &ChapterAudioRequest) -> Result<(), AudioDispatchError> {
        let url = format!("{}/internal/audio/chapters", self.base_url);
        let mut req = self.client.post(url).json(request);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(AudioDispatchError::Rejected { status, body })
    }
}

/// Feeds an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelAudioDispatcher {
    tx: mpsc::Sender<ChapterAudioRequest>,
}

impl ChannelAudioDispatcher {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ChapterAudioRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AudioDispatcher for ChannelAudioDispatcher {
    async fn dispatch(&self, request: &ChapterAudioRequest) -> Result<(), AudioDispatchError> {
        self.tx
            .send(request.clone())
            .await
            .map_err(|_| AudioDispatchError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(number: u32) -> ChapterAudioRequest {
        ChapterAudioRequest {
            chapter_id: format!("ch-{number}"),
            job_id: "job-1".to_string(),
            novel_id: "novel-1".to_string(),
            chapter_number: number,
        }
    }

    #[test]
    fn parse_dispatch_modes() {
        assert_eq!(DispatchMode::parse("").unwrap(), DispatchMode::Outbox);
        assert_eq!(DispatchMode::parse(" Worker ").unwrap(), DispatchMode::Worker);
        assert_eq!(DispatchMode::parse("CHANNEL").unwrap(), DispatchMode::Channel);
        let err = DispatchMode::parse("kafka").unwrap_err().to_string();
        assert!(err.contains("unsupported dispatch mode"));
    }

    #[tokio::test]
    async fn outbox_appends_one_line_per_request() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let outbox = OutboxAudioDispatcher::new(OutboxAudioDispatcher::default_path(temp.path()));
        assert!(outbox.pending().await?.is_empty());

        outbox.dispatch(&request(1)).await?;
        outbox.dispatch(&request(2)).await?;

        let pending = outbox.pending().await?;
        assert_eq!(pending, vec![request(1), request(2)]);
        Ok(())
    }

    #[tokio::test]
    async fn closed_channel_reports_queue_closed() {
        let (dispatcher, rx) = ChannelAudioDispatcher::new(1);
        drop(rx);
        let err = dispatcher.dispatch(&request(1)).await.unwrap_err();
        assert!(matches!(err, AudioDispatchError::QueueClosed));
    }

    #[test]
    fn http_dispatcher_rejects_blank_url() {
        assert!(HttpAudioDispatcher::new("  ", None).is_err());
    }
}
