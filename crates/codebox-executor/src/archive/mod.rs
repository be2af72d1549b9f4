//! Tar based file transfer between directory trees, containers and uploaded archives
//!
//! Every archive produced here is a *normalized* tar: entry names are relative,
//! `/`-separated and never `.` or `./`-prefixed. The owner-execute bit (`0o100`) and
//! the modification time are carried through every conversion.
//!
//! All functions are synchronous and stream through `std::io`; async callers move
//! them onto the blocking pool.

mod codec;
mod foreign;
mod manifest;
mod patterns;
mod upload;

pub use codec::{
    decode_to_directory, encode_directory, extract_subdirectory, filter_copy, normalize_tar,
    tar_to_zip,
};
pub use foreign::{convert_foreign_archive, wrap_single_file_as_tar};
pub use manifest::{locate_manifest, require_manifest, ManifestLookup, DEFAULT_MANIFEST_NAME};
pub use patterns::{merge_for_evaluation, PathPatterns};
pub use upload::ingest_upload;

use codebox_common::CodeboxError;
use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

/// Default mode of regular files, `0644`
pub const FILE_MODE: u32 = 0o644;
/// Default mode of directories, `0755`
pub const DIR_MODE: u32 = 0o755;
/// Owner-execute bit
pub const OWNER_EXECUTE: u32 = 0o100;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} already exists and is no directory")]
    NotADirectory(PathBuf),
    #[error("Unsafe entry path in archive: {0:?}")]
    UnsafePath(String),
    #[error("Input is not a recognized archive")]
    UnrecognizedArchive,
    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Manifest {0} does not exist")]
    ManifestNotFound(String),
    #[error("Manifest {name} is invalid: {source}")]
    InvalidManifest {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid path pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("Upload could not be processed: {0}")]
    UploadProcessingFailed(String),
}

impl From<ArchiveError> for CodeboxError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(e) => CodeboxError::Io(e),
            ArchiveError::ManifestNotFound(name) => CodeboxError::ManifestNotFound(name),
            ArchiveError::UploadProcessingFailed(msg) => CodeboxError::UploadProcessingFailed(msg),
            other => CodeboxError::Archive(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Normalize a raw archive entry name.
///
/// `.` is the archive root and becomes the empty string, a leading `./` is dropped
/// once, everything else passes through unchanged.
pub fn normalize_entry_name(name: &str) -> &str {
    if name == "." {
        ""
    } else if let Some(stripped) = name.strip_prefix("./") {
        stripped
    } else {
        name
    }
}

/// Target of a link entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// Kept verbatim, resolved relative to the link itself
    Symbolic(String),
    /// Normalized name of an earlier entry of the same archive
    Hard(String),
}

/// Metadata of a single archive entry as seen by predicates and writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Normalized name without trailing `/`. Empty for the archive root.
    pub path: String,
    pub mode: u32,
    /// Seconds since the unix epoch
    pub mtime: u64,
    pub size: u64,
    pub is_dir: bool,
    /// Set for symlinks and hard links, which carry no data
    pub link: Option<Link>,
}

impl EntryInfo {
    pub fn is_executable(&self) -> bool {
        self.mode & OWNER_EXECUTE != 0
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub(crate) fn from_entry<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Self> {
        let raw = entry.path()?.to_string_lossy().into_owned();
        let path = normalize_entry_name(&raw).trim_end_matches('/').to_string();
        let header = entry.header();
        let kind = header.entry_type();
        let is_dir = kind.is_dir();
        let link = if kind.is_symlink() || kind.is_hard_link() {
            let target = entry
                .link_name()?
                .map(|t| t.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some(if kind.is_symlink() {
                Link::Symbolic(target)
            } else {
                Link::Hard(normalize_entry_name(&target).trim_end_matches('/').to_string())
            })
        } else {
            None
        };
        Ok(Self {
            path,
            mode: header.mode().unwrap_or(if is_dir { DIR_MODE } else { FILE_MODE }),
            mtime: header.mtime().unwrap_or(0),
            size: if is_dir || link.is_some() { 0 } else { entry.size() },
            is_dir,
            link,
        })
    }
}
