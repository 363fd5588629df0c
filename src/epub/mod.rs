//! Best-effort EPUB reader.
//!
//! Only an archive that cannot be decompressed is an error. Every other
//! problem (missing container, malformed package or navigation document,
//! missing spine entries) degrades the result and is recorded as a
//! [`StructureWarning`] on the returned [`ParsedBook`].

pub mod archive;
pub mod content;
pub mod cover;
pub mod nav;
pub mod package;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, StructureWarning, WarningKind};
use archive::{Archive, base_name};
pub use cover::Cover;
use nav::NavTitles;
use package::Package;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedBook {
    pub title: String,
    pub author: String,
    pub cover: Option<Cover>,
    pub chapters: Vec<ParsedChapter>,
    pub warnings: Vec<StructureWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedChapter {
    /// 1-based, dense over emitted chapters.
    pub sequence: u32,
    pub title: String,
    pub html: String,
    /// Archive entry the chapter was read from.
    pub source_path: String,
}

pub fn parse(bytes: &[u8]) -> Result<ParsedBook, ArchiveError> {
    let mut warnings = Vec::new();
    let archive = Archive::read(bytes, &mut warnings)?;

    let package = package::resolve_root_path(&archive, &mut warnings)
        .and_then(|path| package::parse_package(&archive, &path, &mut warnings));
    let nav_path = nav::find_candidate(&archive);

    let mut book = ParsedBook::default();
    if let Some(package) = &package {
        book.title = package.title.clone();
        book.author = package.author.clone();

        let mut drafts = build_drafts(&archive, package, nav_path, &mut warnings);
        if let Some(nav_path) = nav_path {
            let raw = archive.get(nav_path).unwrap_or_default();
            let titles = NavTitles::parse(raw, nav_path, &mut warnings);
            apply_nav_titles(&mut drafts, &titles);
        } else if let Some(ncx_path) = package
            .ncx
            .as_deref()
            .and_then(|href| package.resolve_entry(&archive, href))
        {
            let raw = archive.get(&ncx_path).unwrap_or_default();
            let titles = NavTitles::parse_ncx(raw, &ncx_path, &mut warnings);
            apply_nav_titles(&mut drafts, &titles);
        }
        book.chapters = drafts.into_iter().map(Draft::into_chapter).collect();
    }
    book.cover = cover::find(&archive, package.as_ref());

    for warning in &warnings {
        tracing::debug!(%warning, "degraded epub parse step");
    }
    tracing::debug!(
        entries = archive.len(),
        chapters = book.chapters.len(),
        warnings = warnings.len(),
        has_cover = book.cover.is_some(),
        "parsed epub"
    );
    book.warnings = warnings;
    Ok(book)
}

#[derive(Debug)]
struct Draft {
    sequence: u32,
    spine_href: String,
    path: String,
    title: String,
    titled_by_heading: bool,
    html: String,
}

impl Draft {
    fn into_chapter(self) -> ParsedChapter {
        ParsedChapter {
            sequence: self.sequence,
            title: self.title,
            html: self.html,
            source_path: self.path,
        }
    }
}

fn is_auxiliary(href: &str, nav_base: Option<&str>) -> bool {
    if nav_base.is_some_and(|nav_base| base_name(href) == nav_base) {
        return true;
    }
    let lower = href.to_ascii_lowercase();
    lower.contains("nav") || lower.contains("toc")
}

fn build_drafts(
    archive: &Archive,
    package: &Package,
    nav_path: Option<&str>,
    warnings: &mut Vec<StructureWarning>,
) -> Vec<Draft> {
    let nav_base = nav_path.map(base_name);
    let mut drafts = Vec::new();
    let mut next_sequence = 1;

    for href in &package.spine {
        if is_auxiliary(href, nav_base) {
            continue;
        }
        let Some(path) = package.resolve_entry(archive, href) else {
            warnings.push(StructureWarning::new(
                WarningKind::MissingSpineEntry,
                format!("{href} is listed in the spine but not in the archive"),
            ));
            continue;
        };
        let raw = archive.get(&path).unwrap_or_default();
        let extracted = content::extract(raw);

        let (title, titled_by_heading) = match extracted.heading {
            Some(heading) => (heading, true),
            None => (path.clone(), false),
        };
        drafts.push(Draft {
            sequence: next_sequence,
            spine_href: href.clone(),
            path,
            title,
            titled_by_heading,
            html: extracted.html,
        });
        next_sequence += 1;
    }

    drafts
}

fn apply_nav_titles(drafts: &mut [Draft], titles: &NavTitles) {
    if titles.is_empty() {
        return;
    }
    for draft in drafts.iter_mut().filter(|draft| !draft.titled_by_heading) {
        let candidates = [draft.spine_href.as_str(), draft.path.as_str()];
        if let Some(title) = titles.lookup(&candidates) {
            draft.title = title.to_string();
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::io::{Cursor, Write as _};

    use zip::write::SimpleFileOptions;

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
}
