use serde::{Deserialize, Serialize};

use crate::epub::archive::Archive;
use crate::epub::package::Package;

/// Checked in order; the first entry present in the archive wins.
pub const COVER_PATHS: &[&str] = &[
    "cover.jpg",
    "cover.jpeg",
    "images/cover.jpg",
    "cover.png",
    "OEBPS/images/cover.jpg",
    "OEBPS/cover.jpg",
];

const IMAGE_SUFFIXES: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cover {
    pub name: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

pub fn find(archive: &Archive, package: Option<&Package>) -> Option<Cover> {
    let name = COVER_PATHS
        .iter()
        .find(|path| archive.contains(path))
        .map(|path| path.to_string())
        .or_else(|| package.and_then(|package| manifest_cover(archive, package)))?;
    let bytes = archive.get(&name)?.to_vec();
    Some(Cover { name, bytes })
}

fn manifest_cover(archive: &Archive, package: &Package) -> Option<String> {
    package
        .manifest
        .iter()
        .filter(|(id, href)| {
            let href = href.to_ascii_lowercase();
            id.to_ascii_lowercase().contains("cover")
                && IMAGE_SUFFIXES.iter().any(|suffix| href.ends_with(suffix))
        })
        .find_map(|(_, href)| package.resolve_entry(archive, href))
}
