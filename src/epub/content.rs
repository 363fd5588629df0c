use std::sync::LazyLock;

use scraper::{Html, Selector};

static PARAGRAPHS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p").expect("paragraph selector is valid"));
static HEADINGS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2").expect("heading selector is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub html: String,
    /// Text of the first `h1`/`h2`, if present and not blank.
    pub heading: Option<String>,
}

/// Keeps only paragraph markup. A document without paragraphs keeps its
/// raw markup so that no chapter comes out empty.
pub fn extract(raw: &[u8]) -> ExtractedContent {
    let source = String::from_utf8_lossy(raw);
    let document = Html::parse_document(&source);

    let html = paragraphs_html(&document);
    let html = if html.is_empty() {
        source.into_owned()
    } else {
        html
    };

    ExtractedContent {
        html,
        heading: first_heading(&document),
    }
}

pub fn paragraphs_html(document: &Html) -> String {
    document
        .select(&PARAGRAPHS)
        .map(|p| p.html())
        .collect::<String>()
        .trim()
        .to_string()
}

fn first_heading(document: &Html) -> Option<String> {
    let heading = document.select(&HEADINGS).next()?;
    let text = collapse_whitespace(&heading.text().collect::<String>());
    if text.is_empty() { None } else { Some(text) }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
