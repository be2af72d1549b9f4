use super::{ArchiveError, EntryInfo, Result};
use serde::de::DeserializeOwned;
use std::io::Read;
use tar::Archive;

/// Name of the task manifest inside a snapshot
pub const DEFAULT_MANIFEST_NAME: &str = "codebox.yml";

/// Outcome of a manifest search. A missing manifest is an expected result here and
/// only becomes an error through [`ManifestLookup::require`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLookup<T> {
    Found(T),
    NotFound,
}

impl<T> ManifestLookup<T> {
    pub fn require(self, name: &str) -> Result<T> {
        match self {
            ManifestLookup::Found(manifest) => Ok(manifest),
            ManifestLookup::NotFound => Err(ArchiveError::ManifestNotFound(name.to_string())),
        }
    }

    pub fn found(self) -> Option<T> {
        match self {
            ManifestLookup::Found(manifest) => Some(manifest),
            ManifestLookup::NotFound => None,
        }
    }
}

/// Scan a tar stream for the regular file `name` and parse it as YAML.
///
/// Only the first matching entry is read; the rest of the stream is not consumed.
pub fn locate_manifest<T, R>(reader: R, name: &str) -> Result<ManifestLookup<T>>
where
    T: DeserializeOwned,
    R: Read,
{
    let wanted = super::normalize_entry_name(name);
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let entry = entry?;
        let info = EntryInfo::from_entry(&entry)?;
        if info.is_dir || !entry.header().entry_type().is_file() || info.path != wanted {
            continue;
        }
        let manifest = serde_yaml::from_reader(entry).map_err(|source| {
            ArchiveError::InvalidManifest {
                name: name.to_string(),
                source,
            }
        })?;
        return Ok(ManifestLookup::Found(manifest));
    }
    Ok(ManifestLookup::NotFound)
}

pub fn require_manifest<T, R>(reader: R, name: &str) -> Result<T>
where
    T: DeserializeOwned,
    R: Read,
{
    locate_manifest(reader, name)?.require(name)
}
