use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, BytesText, Event};

use crate::epub::archive::{Archive, join_path, parent_dir};
use crate::error::{StructureWarning, WarningKind};

pub const CONTAINER_PATH: &str = "META-INF/container.xml";
pub const DEFAULT_PACKAGE_PATH: &str = "content.opf";
pub const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

#[derive(Debug, Clone, Default)]
pub struct Package {
    /// Archive path of the package document itself.
    pub path: String,
    pub title: String,
    pub author: String,
    /// Manifest item id -> href (relative to the package directory).
    pub manifest: BTreeMap<String, String>,
    /// Spine hrefs in reading order, unresolved idrefs already dropped.
    pub spine: Vec<String>,
    /// href of the EPUB2 navigation control file: the spine `toc` item, else
    /// the first manifest item with the NCX media type.
    pub ncx: Option<String>,
}

impl Package {
    pub fn base_dir(&self) -> &str {
        parent_dir(&self.path)
    }

    /// Finds the archive entry for a manifest href: relative to the package
    /// directory first, then the raw href.
    pub fn resolve_entry(&self, archive: &Archive, href: &str) -> Option<String> {
        let resolved = join_path(self.base_dir(), href);
        if archive.contains(&resolved) {
            return Some(resolved);
        }
        if archive.contains(href) {
            return Some(href.to_string());
        }
        None
    }
}

/// Locates the package document through the container descriptor, falling
/// back to [`DEFAULT_PACKAGE_PATH`].
pub fn resolve_root_path(archive: &Archive, warnings: &mut Vec<StructureWarning>) -> Option<String> {
    let declared = match archive.get(CONTAINER_PATH) {
        None => {
            warnings.push(StructureWarning::new(
                WarningKind::MissingContainer,
                format!("{CONTAINER_PATH} not found; trying {DEFAULT_PACKAGE_PATH}"),
            ));
            None
        }
        Some(bytes) => match first_rootfile(bytes) {
            Ok(Some(path)) => Some(path),
            Ok(None) => {
                warnings.push(StructureWarning::new(
                    WarningKind::MalformedContainer,
                    "container declares no rootfile",
                ));
                None
            }
            Err(err) => {
                warnings.push(StructureWarning::new(
                    WarningKind::MalformedContainer,
                    err.to_string(),
                ));
                None
            }
        },
    };

    if let Some(path) = declared {
        if archive.contains(&path) {
            return Some(path);
        }
        warnings.push(StructureWarning::new(
            WarningKind::MissingPackage,
            format!("declared package document {path} is not in the archive"),
        ));
    }

    if archive.contains(DEFAULT_PACKAGE_PATH) {
        return Some(DEFAULT_PACKAGE_PATH.to_string());
    }

    warnings.push(StructureWarning::new(
        WarningKind::MissingPackage,
        "no package document found",
    ));
    None
}

fn first_rootfile(xml: &[u8]) -> Result<Option<String>, quick_xml::Error> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attribute(&e, b"full-path") {
                    return Ok(Some(path));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Creator,
}

/// Reads metadata, manifest and spine. A malformed document keeps whatever
/// was read before the error.
pub fn parse_package(
    archive: &Archive,
    path: &str,
    warnings: &mut Vec<StructureWarning>,
) -> Option<Package> {
    let bytes = archive.get(path)?;
    let mut package = Package {
        path: path.to_string(),
        ..Package::default()
    };

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut items = Items::default();
    let mut capture: Option<(Field, String)> = None;
    let mut buf = Vec::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(err) => {
                warnings.push(StructureWarning::new(
                    WarningKind::MalformedPackage,
                    format!("{path} at byte {}: {err}", reader.buffer_position()),
                ));
                break;
            }
        };

        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"title" if package.title.is_empty() && capture.is_none() => {
                    capture = Some((Field::Title, String::new()));
                }
                b"creator" if package.author.is_empty() && capture.is_none() => {
                    capture = Some((Field::Creator, String::new()));
                }
                _ => items.collect(&e, &mut package.manifest),
            },
            Event::Empty(e) => items.collect(&e, &mut package.manifest),
            Event::Text(t) => {
                if let Some((_, text)) = capture.as_mut() {
                    text.push_str(&text_content(&t));
                }
            }
            Event::CData(t) => {
                if let Some((_, text)) = capture.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::End(e) => {
                let name = e.local_name();
                let closes = match capture.as_ref() {
                    Some((Field::Title, _)) => name.as_ref() == b"title",
                    Some((Field::Creator, _)) => name.as_ref() == b"creator",
                    None => false,
                };
                if closes && let Some((field, text)) = capture.take() {
                    let text = text.trim().to_string();
                    match field {
                        Field::Title => package.title = text,
                        Field::Creator => package.author = text,
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    package.spine = items
        .idrefs
        .iter()
        .filter_map(|idref| package.manifest.get(idref).cloned())
        .collect();
    package.ncx = items
        .toc_id
        .and_then(|id| package.manifest.get(&id).cloned())
        .or(items.ncx_href);

    Some(package)
}

#[derive(Debug, Default)]
struct Items {
    idrefs: Vec<String>,
    toc_id: Option<String>,
    ncx_href: Option<String>,
}

impl Items {
    fn collect(&mut self, element: &BytesStart<'_>, manifest: &mut BTreeMap<String, String>) {
        match element.local_name().as_ref() {
            b"item" => {
                let (Some(id), Some(href)) = (attribute(element, b"id"), attribute(element, b"href"))
                else {
                    return;
                };
                if self.ncx_href.is_none()
                    && attribute(element, b"media-type").as_deref() == Some(NCX_MEDIA_TYPE)
                {
                    self.ncx_href = Some(href.clone());
                }
                manifest.insert(id, href);
            }
            b"itemref" => {
                if let Some(idref) = attribute(element, b"idref") {
                    self.idrefs.push(idref);
                }
            }
            b"spine" => self.toc_id = attribute(element, b"toc"),
            _ => {}
        }
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
}

// Unknown entities (e.g. `&nbsp;` in hand-written OPF) keep the raw text.
fn text_content(text: &BytesText<'_>) -> String {
    match text.unescape() {
        Ok(value) => value.into_owned(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}
