use std::collections::BTreeMap;
use std::io::{Cursor, Read as _};

use crate::error::{ArchiveError, StructureWarning, WarningKind};

// Caps the up-front allocation for a single entry; larger entries still read fully.
const MAX_PREALLOC_BYTES: u64 = 4 * 1024 * 1024;

/// Fully decompressed archive, keyed by entry path.
///
/// Keys are kept sorted so that every lookup that scans the archive
/// (navigation candidates, covers) is deterministic.
#[derive(Debug, Default, Clone)]
pub struct Archive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Archive {
    pub fn read(bytes: &[u8], warnings: &mut Vec<StructureWarning>) -> Result<Self, ArchiveError> {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = BTreeMap::new();

        for index in 0..zip.len() {
            let mut file = match zip.by_index(index) {
                Ok(file) => file,
                Err(err) => {
                    warnings.push(StructureWarning::new(
                        WarningKind::UnreadableEntry,
                        format!("entry #{index}: {err}"),
                    ));
                    continue;
                }
            };
            if file.is_dir() {
                continue;
            }

            let name = file.name().to_string();
            let mut buf = Vec::with_capacity(file.size().min(MAX_PREALLOC_BYTES) as usize);
            if let Err(err) = file.read_to_end(&mut buf) {
                warnings.push(StructureWarning::new(
                    WarningKind::UnreadableEntry,
                    format!("{name}: {err}"),
                ));
                continue;
            }
            entries.insert(name, buf);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Entry paths in lexicographic order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Directory part of an archive path, including the trailing slash.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "",
    }
}

pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Joins `href` onto `dir` and collapses `.` and `..` segments.
pub fn join_path(dir: &str, href: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in dir.split('/').chain(href.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}
