#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Write as _};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use zip::write::SimpleFileOptions;

use novelingest::app::coordinator::ImportCoordinator;
use novelingest::app::dispatcher::AudioDispatcher;
use novelingest::app::job_store::{FileStore, LocalFsJobStore};
use novelingest::app::model::{ChapterAudioRequest, ChapterRange};
use novelingest::app::novel_store::{NewChapter, NovelContent, NovelMetadata};
use novelingest::error::{AudioDispatchError, ChapterWriteError, FetchError};
use novelingest::fetch::{ChapterFetcher, FetchedChapter};

/// Builds a zip in memory. Names ending in `/` become directory entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, data) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).expect("add directory");
            continue;
        }
        zip.start_file(*name, options).expect("start file");
        zip.write_all(data).expect("write file");
    }
    zip.finish().expect("finish zip").into_inner()
}

pub const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// A package document under `OEBPS/` whose spine lists `chapters` in order.
pub fn package_opf(title: &str, author: &str, chapters: &[&str]) -> String {
    let manifest = chapters
        .iter()
        .enumerate()
        .map(|(i, href)| {
            format!(r#"<item id="item{i}" href="{href}" media-type="application/xhtml+xml"/>"#)
        })
        .collect::<String>();
    let spine = (0..chapters.len())
        .map(|i| format!(r#"<itemref idref="item{i}"/>"#))
        .collect::<String>();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
    <dc:creator>{author}</dc:creator>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
    )
}

/// An EPUB with `count` chapters, each titled by an `h1`.
pub fn simple_epub(count: usize) -> Vec<u8> {
    let hrefs = (1..=count)
        .map(|n| format!("ch{n}.xhtml"))
        .collect::<Vec<_>>();
    let href_refs = hrefs.iter().map(String::as_str).collect::<Vec<_>>();
    let opf = package_opf("Sample", "Author", &href_refs);
    let bodies = (1..=count)
        .map(|n| format!("<html><body><h1>Chapter {n}</h1><p>Body {n}.</p></body></html>"))
        .collect::<Vec<_>>();

    let mut entries: Vec<(String, Vec<u8>)> = vec![
        (
            "META-INF/container.xml".to_string(),
            CONTAINER.as_bytes().to_vec(),
        ),
        ("OEBPS/content.opf".to_string(), opf.into_bytes()),
    ];
    for (href, body) in hrefs.iter().zip(bodies) {
        entries.push((format!("OEBPS/{href}"), body.into_bytes()));
    }
    let borrowed = entries
        .iter()
        .map(|(name, data)| (name.as_str(), data.as_slice()))
        .collect::<Vec<_>>();
    zip_bytes(&borrowed)
}

#[derive(Debug, Clone)]
pub struct WrittenChapter {
    pub id: String,
    pub title: String,
    pub html: String,
    pub status: Option<String>,
}

/// In-memory chapter catalogue with injectable write failures.
#[derive(Debug, Default)]
pub struct MemoryNovels {
    chapters: Mutex<BTreeMap<(String, u32), WrittenChapter>>,
    fail_numbers: Mutex<BTreeSet<u32>>,
    covers: Mutex<Vec<(String, String)>>,
    novels: Mutex<BTreeMap<String, NovelMetadata>>,
    next_id: AtomicUsize,
}

impl MemoryNovels {
    pub fn fail_on(&self, number: u32) {
        self.fail_numbers.lock().unwrap().insert(number);
    }

    pub fn seed(&self, novel_id: &str, number: u32) {
        self.chapters.lock().unwrap().insert(
            (novel_id.to_string(), number),
            WrittenChapter {
                id: format!("seed-{number}"),
                title: format!("Seed {number}"),
                html: String::new(),
                status: None,
            },
        );
    }

    pub fn numbers(&self, novel_id: &str) -> Vec<u32> {
        self.chapters
            .lock()
            .unwrap()
            .keys()
            .filter(|(novel, _)| novel == novel_id)
            .map(|(_, number)| *number)
            .collect()
    }

    pub fn chapter(&self, novel_id: &str, number: u32) -> Option<WrittenChapter> {
        self.chapters
            .lock()
            .unwrap()
            .get(&(novel_id.to_string(), number))
            .cloned()
    }

    pub fn novel(&self, novel_id: &str) -> Option<NovelMetadata> {
        self.novels.lock().unwrap().get(novel_id).cloned()
    }

    pub fn covers(&self) -> Vec<(String, String)> {
        self.covers.lock().unwrap().clone()
    }
}

#[async_trait]
impl NovelContent for MemoryNovels {
    async fn ensure_novel(&self, novel_id: &str, metadata: &NovelMetadata) -> anyhow::Result<bool> {
        let mut novels = self.novels.lock().unwrap();
        if novels.contains_key(novel_id) {
            return Ok(false);
        }
        novels.insert(novel_id.to_string(), metadata.clone());
        Ok(true)
    }

    async fn create_chapter(&self, chapter: &NewChapter) -> Result<String, ChapterWriteError> {
        if self.fail_numbers.lock().unwrap().contains(&chapter.number) {
            return Err(ChapterWriteError::Storage {
                number: chapter.number,
                message: "disk full".to_string(),
            });
        }
        let mut chapters = self.chapters.lock().unwrap();
        let key = (chapter.novel_id.clone(), chapter.number);
        if chapters.contains_key(&key) {
            return Err(ChapterWriteError::Duplicate {
                novel_id: chapter.novel_id.clone(),
                number: chapter.number,
            });
        }
        let id = format!("chapter-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        chapters.insert(
            key,
            WrittenChapter {
                id: id.clone(),
                title: chapter.title.clone(),
                html: chapter.html.clone(),
                status: chapter.status.clone(),
            },
        );
        Ok(id)
    }

    async fn highest_chapter_number(&self, novel_id: &str) -> anyhow::Result<u32> {
        Ok(self.numbers(novel_id).into_iter().max().unwrap_or(0))
    }

    async fn attach_cover(&self, novel_id: &str, name: &str, _bytes: &[u8]) -> anyhow::Result<()> {
        self.covers
            .lock()
            .unwrap()
            .push((novel_id.to_string(), name.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingAudio {
    requests: Mutex<Vec<ChapterAudioRequest>>,
    fail: Mutex<bool>,
}

impl RecordingAudio {
    pub fn failing() -> Self {
        Self {
            requests: Mutex::default(),
            fail: Mutex::new(true),
        }
    }

    pub fn requests(&self) -> Vec<ChapterAudioRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioDispatcher for RecordingAudio {
    async fn dispatch(&self, request: &ChapterAudioRequest) -> Result<(), AudioDispatchError> {
        if *self.fail.lock().unwrap() {
            return Err(AudioDispatchError::QueueClosed);
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFiles {
    pub fn insert(&self, name: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(name.to_string(), bytes);
    }
}

#[async_trait]
impl FileStore for MemoryFiles {
    async fn read(&self, source_file: &str) -> anyhow::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(source_file)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such upload: {source_file}"))
    }
}

/// Serves a fixed chapter list, or a fixed error, and records requested ranges.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    chapters: Mutex<Vec<FetchedChapter>>,
    fail_with_status: Mutex<Option<u16>>,
    ranges: Mutex<Vec<ChapterRange>>,
    delay: Mutex<Option<Duration>>,
}

impl StaticFetcher {
    pub fn with_chapters(count: u32) -> Self {
        let fetcher = Self::default();
        fetcher.set_chapters(count);
        fetcher
    }

    pub fn set_chapters(&self, count: u32) {
        *self.chapters.lock().unwrap() = (1..=count)
            .map(|number| FetchedChapter {
                number,
                title: format!("Web {number}"),
                html: format!("<p>web {number}</p>"),
                url: format!("https://novels.example.com/c/{number}"),
            })
            .collect();
    }

    pub fn fail_with(&self, status: Option<u16>) {
        *self.fail_with_status.lock().unwrap() = status;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn ranges(&self) -> Vec<ChapterRange> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChapterFetcher for StaticFetcher {
    async fn fetch_chapters(
        &self,
        source_url: &str,
        range: ChapterRange,
    ) -> Result<Vec<FetchedChapter>, FetchError> {
        self.ranges.lock().unwrap().push(range);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = *self.fail_with_status.lock().unwrap() {
            return Err(FetchError::Status {
                url: source_url.to_string(),
                status,
            });
        }
        Ok(self
            .chapters
            .lock()
            .unwrap()
            .iter()
            .filter(|chapter| range.contains(chapter.number))
            .cloned()
            .collect())
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub novels: Arc<MemoryNovels>,
    pub audio: Arc<RecordingAudio>,
    pub files: Arc<MemoryFiles>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_audio(RecordingAudio::default())
    }

    pub fn with_audio(audio: RecordingAudio) -> Self {
        Self {
            temp: tempfile::tempdir().expect("create tempdir"),
            novels: Arc::new(MemoryNovels::default()),
            audio: Arc::new(audio),
            files: Arc::new(MemoryFiles::default()),
        }
    }

    pub fn job_store(&self) -> Arc<LocalFsJobStore> {
        Arc::new(LocalFsJobStore::new(self.temp.path()))
    }

    pub fn coordinator(&self) -> ImportCoordinator {
        ImportCoordinator::new(
            self.job_store(),
            Arc::clone(&self.novels) as Arc<dyn NovelContent>,
            Arc::clone(&self.files) as Arc<dyn FileStore>,
            Arc::clone(&self.audio) as Arc<dyn AudioDispatcher>,
        )
    }
}

/// Minimal HTTP server answering GETs from a fixed `path -> (status, body)` map.
pub struct StubServer {
    pub base_url: String,
    hits: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StubServer {
    pub fn spawn(routes: Vec<(&str, u16, String)>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start stub server");
        let base_url = format!("http://{}", server.server_addr());
        let routes = routes
            .into_iter()
            .map(|(path, status, body)| (path.to_string(), (status, body)))
            .collect::<HashMap<_, _>>();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_hits = Arc::clone(&hits);
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let path = request.url().to_string();
                thread_hits.lock().unwrap().push(path.clone());
                let response = match routes.get(&path) {
                    Some((status, body)) => {
                        tiny_http::Response::from_string(body.clone()).with_status_code(*status)
                    }
                    None => tiny_http::Response::from_string("not found").with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
