use super::{convert_foreign_archive, wrap_single_file_as_tar, ArchiveError, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

/// Turn an uploaded file into a normalized tar.
///
/// Archives (optionally gzip or zstd compressed) are converted entry by entry.
/// Anything else is stored as a single file named after the last segment of
/// `filename`, so a plain upload never fails for not being an archive.
pub fn ingest_upload(filename: &str, path: &Path) -> Result<Vec<u8>> {
    let open = || File::open(path).map(BufReader::new).map_err(processing_failed);

    match convert_foreign_archive(open()?, Vec::new()) {
        Ok(tar) => {
            debug!(filename, bytes = tar.len(), "Upload converted from archive");
            Ok(tar)
        }
        Err(ArchiveError::UnrecognizedArchive) => {
            let size = path.metadata().map_err(processing_failed)?.len();
            info!(filename, size, "Upload is no archive, storing as single file");
            wrap_single_file_as_tar(filename, size, open()?, Vec::new()).map_err(processing_failed)
        }
        Err(e) => Err(processing_failed(e)),
    }
}

fn processing_failed(err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::UploadProcessingFailed(err.to_string())
}
