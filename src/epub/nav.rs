use std::collections::BTreeMap;
use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use scraper::{Html, Selector};

use crate::epub::archive::{Archive, base_name};
use crate::epub::content::collapse_whitespace;
use crate::error::{StructureWarning, WarningKind};

static ANCHORS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector is valid"));

const NAV_SUFFIXES: &[&str] = &[".xhtml", ".html", ".htm"];

pub fn is_nav_like(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.contains("nav") && NAV_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// The navigation document candidate: the lexicographically smallest
/// nav-like entry path.
pub fn find_candidate(archive: &Archive) -> Option<&str> {
    archive.paths().find(|path| is_nav_like(path))
}

/// Cuts the fragment and a leading `./`.
pub fn normalize_href(href: &str) -> &str {
    let href = match href.split_once('#') {
        Some((path, _)) => path,
        None => href,
    };
    let href = href.trim();
    href.strip_prefix("./").unwrap_or(href)
}

#[derive(Debug, Clone, Default)]
pub struct NavTitles {
    by_href: BTreeMap<String, String>,
    by_base_name: BTreeMap<String, String>,
}

impl NavTitles {
    pub fn parse(raw: &[u8], nav_path: &str, warnings: &mut Vec<StructureWarning>) -> Self {
        let source = String::from_utf8_lossy(raw);
        let document = Html::parse_document(&source);
        let mut titles = Self::default();

        for anchor in document.select(&ANCHORS) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let href = normalize_href(href);
            let text = collapse_whitespace(&anchor.text().collect::<String>());
            if href.is_empty() || text.is_empty() {
                continue;
            }
            titles.insert(href, text);
        }

        if titles.is_empty() {
            warnings.push(StructureWarning::new(
                WarningKind::MalformedNavigation,
                format!("{nav_path} has no usable anchors"),
            ));
        }
        titles
    }

    /// Reads an EPUB2 `toc.ncx`: each `navPoint` contributes its
    /// `navLabel/text` under its `content@src`. A malformed file keeps the
    /// points read before the error.
    pub fn parse_ncx(raw: &[u8], ncx_path: &str, warnings: &mut Vec<StructureWarning>) -> Self {
        let mut titles = Self::default();
        let mut reader = Reader::from_reader(raw);
        let mut points: Vec<NavPoint> = Vec::new();
        let mut label: Option<String> = None;
        let mut buf = Vec::new();

        loop {
            let event = match reader.read_event_into(&mut buf) {
                Ok(event) => event,
                Err(err) => {
                    warnings.push(StructureWarning::new(
                        WarningKind::MalformedNavigation,
                        format!("{ncx_path} at byte {}: {err}", reader.buffer_position()),
                    ));
                    break;
                }
            };
            match event {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"navPoint" => points.push(NavPoint::default()),
                    b"text" if !points.is_empty() => label = Some(String::new()),
                    b"content" => set_src(&mut points, &e, &mut titles),
                    _ => {}
                },
                Event::Empty(e) if e.local_name().as_ref() == b"content" => {
                    set_src(&mut points, &e, &mut titles);
                }
                Event::Text(t) => {
                    if let Some(label) = label.as_mut() {
                        match t.unescape() {
                            Ok(text) => label.push_str(&text),
                            Err(_) => label.push_str(&String::from_utf8_lossy(&t)),
                        }
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"text" => {
                        if let (Some(text), Some(point)) = (label.take(), points.last_mut())
                            && point.label.is_none()
                        {
                            point.label = Some(collapse_whitespace(&text));
                            point.flush(&mut titles);
                        }
                    }
                    b"navPoint" => {
                        points.pop();
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if titles.is_empty() {
            warnings.push(StructureWarning::new(
                WarningKind::MalformedNavigation,
                format!("{ncx_path} has no usable navigation points"),
            ));
        }
        titles
    }

    // First anchor for a target wins; later ones usually point at sub-sections.
    fn insert(&mut self, href: &str, text: String) {
        self.by_base_name
            .entry(base_name(href).to_string())
            .or_insert_with(|| text.clone());
        self.by_href.entry(href.to_string()).or_insert(text);
    }

    pub fn is_empty(&self) -> bool {
        self.by_href.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_href.len()
    }

    /// Exact normalized-href match over `hrefs` first, then base-file-name match.
    pub fn lookup(&self, hrefs: &[&str]) -> Option<&str> {
        hrefs
            .iter()
            .find_map(|href| self.by_href.get(normalize_href(href)))
            .or_else(|| {
                hrefs
                    .iter()
                    .find_map(|href| self.by_base_name.get(base_name(normalize_href(href))))
            })
            .map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct NavPoint {
    label: Option<String>,
    src: Option<String>,
    recorded: bool,
}

impl NavPoint {
    fn flush(&mut self, titles: &mut NavTitles) {
        if self.recorded {
            return;
        }
        if let (Some(label), Some(src)) = (&self.label, &self.src) {
            let href = normalize_href(src);
            if !href.is_empty() && !label.is_empty() {
                titles.insert(href, label.clone());
            }
            self.recorded = true;
        }
    }
}

fn set_src(points: &mut [NavPoint], element: &BytesStart<'_>, titles: &mut NavTitles) {
    let Some(point) = points.last_mut() else {
        return;
    };
    if point.src.is_some() {
        return;
    }
    point.src = element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"src")
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()));
    point.flush(titles);
}
