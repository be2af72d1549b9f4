use super::codec::{append_entry, copy_entries};
use super::{normalize_entry_name, ArchiveError, EntryInfo, Result, DIR_MODE, FILE_MODE, OWNER_EXECUTE};
use flate2::read::MultiGzDecoder;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use tar::Builder;
use tracing::debug;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const ZIP_MAGICS: &[&[u8]] = &[b"PK\x03\x04", b"PK\x05\x06"];
const TAR_BLOCK: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Tar,
    Zip,
}

/// Convert an uploaded archive of unknown type into a normalized tar.
///
/// A gzip or zstd layer is peeled off first when present; anything else is read as
/// is. The (decompressed) content must then be a tar or zip archive, otherwise
/// [`ArchiveError::UnrecognizedArchive`] is returned.
pub fn convert_foreign_archive<R: Read, W: Write>(input: R, writer: W) -> Result<W> {
    let (reader, compressed) = decompress(input)?;
    let (head, reader) = match sniff(reader, TAR_BLOCK) {
        Ok(sniffed) => sniffed,
        // magic bytes alone do not make a compressed stream
        Err(e) if compressed => {
            debug!(error = %e, "Upload only looks compressed");
            return Err(ArchiveError::UnrecognizedArchive);
        }
        Err(e) => return Err(e.into()),
    };
    let format = detect_format(&head).ok_or(ArchiveError::UnrecognizedArchive)?;

    let mut builder = Builder::new(writer);
    let entries = match format {
        ArchiveFormat::Tar => copy_entries(reader, &mut builder, Some)?,
        ArchiveFormat::Zip => zip_into_tar(reader, &mut builder)?,
    };
    debug!(?format, entries, "Converted upload to tar");
    Ok(builder.into_inner()?)
}

/// Produce a tar holding exactly one file, for uploads that are not archives.
pub fn wrap_single_file_as_tar<R: Read, W: Write>(
    filename: &str,
    size: u64,
    content: R,
    writer: W,
) -> Result<W> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(ArchiveError::UnsafePath(filename.to_string()));
    }

    let info = EntryInfo {
        path: name.to_string(),
        mode: FILE_MODE,
        mtime: chrono::Utc::now().timestamp().max(0) as u64,
        size,
        is_dir: false,
        link: None,
    };
    let mut builder = Builder::new(writer);
    append_entry(&mut builder, &info, ExactReader::new(content, size))?;
    Ok(builder.into_inner()?)
}

/// Yields exactly `remaining` bytes of the inner reader and fails if it ends early.
struct ExactReader<R> {
    inner: io::Take<R>,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner: inner.take(size),
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let read = self.inner.read(buf)?;
        if read == 0 && self.inner.limit() > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("content ended {} bytes short", self.inner.limit()),
            ));
        }
        Ok(read)
    }
}

/// Wrap `input` in a decoder if it starts with gzip or zstd magic. The flag tells
/// whether a decoder was picked.
fn decompress<'a, R: Read + 'a>(input: R) -> io::Result<(Box<dyn Read + 'a>, bool)> {
    let (head, reader) = sniff(input, ZSTD_MAGIC.len())?;
    if head.starts_with(GZIP_MAGIC) {
        debug!("Upload is gzip compressed");
        Ok((Box::new(MultiGzDecoder::new(reader)), true))
    } else if head.starts_with(ZSTD_MAGIC) {
        debug!("Upload is zstd compressed");
        Ok((Box::new(zstd::stream::read::Decoder::new(reader)?), true))
    } else {
        Ok((Box::new(reader), false))
    }
}

/// Read up to `len` leading bytes and return them together with a reader that still
/// yields the complete stream.
fn sniff<R: Read>(mut reader: R, len: usize) -> io::Result<(Vec<u8>, io::Chain<Cursor<Vec<u8>>, R>)> {
    let mut head = Vec::with_capacity(len);
    (&mut reader).take(len as u64).read_to_end(&mut head)?;
    Ok((head.clone(), Cursor::new(head).chain(reader)))
}

fn detect_format(head: &[u8]) -> Option<ArchiveFormat> {
    if ZIP_MAGICS.iter().any(|magic| head.starts_with(magic)) {
        Some(ArchiveFormat::Zip)
    } else if is_tar_header(head) {
        Some(ArchiveFormat::Tar)
    } else {
        None
    }
}

fn is_tar_header(head: &[u8]) -> bool {
    if head.len() < TAR_BLOCK || head[0] == 0 {
        return false;
    }
    if &head[257..262] == b"ustar" {
        return true;
    }
    // v7 archives have no magic, only the header checksum
    let recorded = std::str::from_utf8(&head[148..156])
        .ok()
        .map(|s| s.trim_matches(|c: char| c == '\0' || c == ' '))
        .and_then(|s| u32::from_str_radix(s, 8).ok());
    let computed: u32 = head[..TAR_BLOCK]
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { b' ' as u32 } else { *b as u32 })
        .sum();
    recorded == Some(computed)
}

/// Zip needs random access, so the stream is spooled to an anonymous temp file.
fn zip_into_tar<R: Read, W: Write>(mut reader: R, builder: &mut Builder<W>) -> Result<usize> {
    let mut spool = tempfile::tempfile()?;
    io::copy(&mut reader, &mut spool)?;
    spool.seek(SeekFrom::Start(0))?;

    let mut zip = zip::ZipArchive::new(spool)?;
    let mut count = 0usize;
    for index in 0..zip.len() {
        let mut file = zip.by_index(index)?;
        let raw = file.name().replace('\\', "/");
        let path = normalize_entry_name(raw.trim_start_matches('/'))
            .trim_end_matches('/')
            .to_string();
        if path.is_empty() {
            continue;
        }

        let is_dir = file.is_dir() || raw.ends_with('/');
        let executable = file.unix_mode().is_some_and(|m| m & OWNER_EXECUTE != 0);
        let info = EntryInfo {
            path,
            mode: match (is_dir, executable) {
                (true, _) => DIR_MODE,
                (false, true) => FILE_MODE | OWNER_EXECUTE,
                (false, false) => FILE_MODE,
            },
            mtime: zip_mtime(file.last_modified()),
            size: if is_dir { 0 } else { file.size() },
            is_dir,
            link: None,
        };
        if is_dir {
            append_entry(builder, &info, io::empty())?;
        } else {
            append_entry(builder, &info, &mut file)?;
        }
        count += 1;
    }
    Ok(count)
}

fn zip_mtime(time: zip::DateTime) -> u64 {
    chrono::NaiveDate::from_ymd_opt(time.year().into(), time.month().into(), time.day().into())
        .and_then(|date| {
            date.and_hms_opt(time.hour().into(), time.minute().into(), time.second().into())
        })
        .map(|t| t.and_utc().timestamp().max(0) as u64)
        .unwrap_or(0)
}
