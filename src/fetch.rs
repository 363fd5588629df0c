//! Chapter retrieval for polled web sources.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::Context as _;
use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use crate::app::coordinator::PendingChapter;
use crate::app::model::ChapterRange;
use crate::config::Settings;
use crate::epub::content::{collapse_whitespace, paragraphs_html};
use crate::error::FetchError;

static LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector is valid"));
static LIST_CONTAINERS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [".chapter-list", "#list", "body"]
        .iter()
        .map(|css| Selector::parse(css).expect("container selector is valid"))
        .collect()
});
static PAGE_HEADINGS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2").expect("heading selector is valid"));
static PAGE_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("title selector is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChapter {
    /// 1-based position on the source's index page.
    pub number: u32,
    pub title: String,
    pub html: String,
    pub url: String,
}

impl From<FetchedChapter> for PendingChapter {
    fn from(chapter: FetchedChapter) -> Self {
        Self {
            number: chapter.number,
            title: chapter.title,
            html: chapter.html,
        }
    }
}

#[async_trait]
pub trait ChapterFetcher: Send + Sync {
    async fn fetch_chapters(
        &self,
        source_url: &str,
        range: ChapterRange,
    ) -> Result<Vec<FetchedChapter>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterLink {
    pub number: u32,
    pub url: String,
    pub text: String,
}

/// Reads an index page of chapter links, then each linked chapter page.
#[derive(Debug, Clone)]
pub struct HttpChapterFetcher {
    client: reqwest::Client,
    link_selector: Option<Selector>,
}

impl HttpChapterFetcher {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.fetch_timeout())
            .build()
            .context("build http client")?;
        let link_selector = settings
            .chapter_link_selector
            .as_deref()
            .map(|css| {
                Selector::parse(css)
                    .map_err(|err| anyhow::anyhow!("invalid chapter_link_selector {css:?}: {err}"))
            })
            .transpose()?;
        Ok(Self {
            client,
            link_selector,
        })
    }

    async fn get_text(&self, url: &Url) -> Result<String, FetchError> {
        let http = |source| FetchError::Http {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url.clone()).send().await.map_err(http)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text().await.map_err(http)
    }
}

#[async_trait]
impl ChapterFetcher for HttpChapterFetcher {
    async fn fetch_chapters(
        &self,
        source_url: &str,
        range: ChapterRange,
    ) -> Result<Vec<FetchedChapter>, FetchError> {
        let index_url = parse_source_url(source_url)?;
        let index = self.get_text(&index_url).await?;
        let links = chapter_links(&index, &index_url, self.link_selector.as_ref());
        if links.is_empty() {
            return Err(FetchError::NoChapters {
                url: index_url.to_string(),
            });
        }
        tracing::debug!(url = %index_url, links = links.len(), "read chapter index");

        let mut chapters = Vec::new();
        for link in links.into_iter().filter(|link| range.contains(link.number)) {
            let url = Url::parse(&link.url).map_err(|err| FetchError::InvalidUrl {
                url: link.url.clone(),
                reason: err.to_string(),
            })?;
            let page = self.get_text(&url).await?;
            let (heading, html) = chapter_body(&page);
            if html.is_empty() {
                return Err(FetchError::Parse {
                    url: link.url,
                    reason: "no paragraphs on chapter page".to_string(),
                });
            }
            let title = [Some(link.text), heading]
                .into_iter()
                .flatten()
                .find(|title| !title.is_empty())
                .unwrap_or_else(|| format!("Chapter {}", link.number));
            chapters.push(FetchedChapter {
                number: link.number,
                title,
                html,
                url: link.url,
            });
        }
        Ok(chapters)
    }
}

pub fn parse_source_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|err| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// Chapter links in document order, numbered from 1. Repeated targets keep
/// their first position; non-http targets are skipped.
pub fn chapter_links(index_html: &str, base: &Url, selector: Option<&Selector>) -> Vec<ChapterLink> {
    let document = Html::parse_document(index_html);
    let anchors = match selector {
        Some(selector) => document.select(selector).collect::<Vec<_>>(),
        None => LIST_CONTAINERS
            .iter()
            .find_map(|container| document.select(container).next())
            .map(|container| container.select(&LINKS).collect())
            .unwrap_or_default(),
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in anchors {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(mut url) = base.join(href.trim()) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        url.set_fragment(None);
        if url == *base || !seen.insert(url.to_string()) {
            continue;
        }
        let number = u32::try_from(links.len() + 1).unwrap_or(u32::MAX);
        links.push(ChapterLink {
            number,
            url: url.to_string(),
            text: collapse_whitespace(&anchor.text().collect::<String>()),
        });
    }
    links
}

fn chapter_body(page_html: &str) -> (Option<String>, String) {
    let document = Html::parse_document(page_html);
    let heading = document
        .select(&PAGE_HEADINGS)
        .chain(document.select(&PAGE_TITLE))
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .find(|text| !text.is_empty());
    (heading, paragraphs_html(&document))
}
