use super::{
    normalize_entry_name, ArchiveError, EntryInfo, Link, Result, DIR_MODE, FILE_MODE,
    OWNER_EXECUTE,
};
use filetime::FileTime;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Write a directory tree as a normalized tar stream and hand the writer back.
///
/// The root itself is never written. Non-root directories get their own entry so
/// empty directories survive; symlinks and other special files are skipped.
pub fn encode_directory<W: Write>(root: &Path, writer: W) -> Result<W> {
    if !root.is_dir() {
        return Err(ArchiveError::NotADirectory(root.to_path_buf()));
    }

    let mut builder = Builder::new(writer);
    let mut count = 0usize;
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry_name_for(root, entry.path())?;
        let metadata = entry.metadata()?;
        let mtime = FileTime::from_last_modification_time(&metadata)
            .unix_seconds()
            .max(0) as u64;

        if metadata.is_dir() {
            let info = EntryInfo {
                path: relative,
                mode: DIR_MODE,
                mtime,
                size: 0,
                is_dir: true,
                link: None,
            };
            append_entry(&mut builder, &info, io::empty())?;
        } else if metadata.is_file() {
            let mut mode = FILE_MODE;
            if is_owner_executable(&metadata) {
                mode |= OWNER_EXECUTE;
            }
            let info = EntryInfo {
                path: relative,
                mode,
                mtime,
                size: metadata.len(),
                is_dir: false,
                link: None,
            };
            let file = fs::File::open(entry.path())?;
            append_entry(&mut builder, &info, io::BufReader::new(file))?;
        } else {
            trace!(path = %entry.path().display(), "Skipping special file");
            continue;
        }
        count += 1;
    }

    debug!(root = %root.display(), entries = count, "Encoded directory");
    Ok(builder.into_inner()?)
}

/// Unpack a tar stream into `destination`, creating it if needed.
///
/// Directory entries are implied by file paths and skipped. Returns the number of
/// files written.
pub fn decode_to_directory<R: Read>(reader: R, destination: &Path) -> Result<usize> {
    if !destination.exists() {
        fs::create_dir_all(destination)?;
    } else if !destination.is_dir() {
        return Err(ArchiveError::NotADirectory(destination.to_path_buf()));
    }

    let mut archive = Archive::new(reader);
    let mut count = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let info = EntryInfo::from_entry(&entry)?;
        if info.is_dir || info.is_root() {
            continue;
        }
        if !entry.header().entry_type().is_file() {
            debug!(path = %info.path, "Skipping non-regular archive entry");
            continue;
        }

        let target = destination.join(safe_relative_path(&info.path)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = fs::File::create(&target)?;
            io::copy(&mut entry, &mut file)?;
        }
        set_owner_executable(&target, info.is_executable())?;
        filetime::set_file_mtime(&target, FileTime::from_unix_time(info.mtime as i64, 0))?;
        count += 1;
    }

    debug!(destination = %destination.display(), files = count, "Decoded archive");
    Ok(count)
}

/// Stream the entries of `src` into `dst`, keeping only those accepted by `predicate`.
///
/// Names are written normalized and root entries are dropped. Returns the number of
/// entries copied.
pub fn filter_copy<R, W, F>(src: R, dst: &mut Builder<W>, mut predicate: F) -> Result<usize>
where
    R: Read,
    W: Write,
    F: FnMut(&EntryInfo) -> bool,
{
    copy_entries(src, dst, |info| predicate(&info).then_some(info))
}

/// Rewrite a tar stream (e.g. a runtime copy-out with `./` names) in normalized form.
pub fn normalize_tar<R: Read, W: Write>(reader: R, writer: W) -> Result<W> {
    let mut builder = Builder::new(writer);
    filter_copy(reader, &mut builder, |_| true)?;
    Ok(builder.into_inner()?)
}

/// Copy the entries below `path` into `dst`, re-rooted so that `path` becomes the
/// archive root.
pub fn extract_subdirectory<R: Read, W: Write>(
    reader: R,
    dst: &mut Builder<W>,
    path: &str,
) -> Result<usize> {
    let prefix = format!("{}/", normalize_entry_name(path).trim_matches('/'));
    copy_entries(reader, dst, |mut info| {
        info.path = info.path.strip_prefix(prefix.as_str())?.to_string();
        if let Some(Link::Hard(target)) = &mut info.link {
            *target = target.strip_prefix(prefix.as_str())?.to_string();
        }
        Some(info)
    })
}

/// Convert a tar stream into a zip archive, keeping unix modes.
pub fn tar_to_zip<R: Read, W: Write + Seek>(reader: R, writer: W) -> Result<W> {
    let mut zip = zip::ZipWriter::new(writer);
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let info = EntryInfo::from_entry(&entry)?;
        if info.is_root() {
            continue;
        }
        let options = zip::write::FileOptions::default().unix_permissions(info.mode & 0o777);
        if info.is_dir {
            zip.add_directory(info.path.as_str(), options)?;
        } else if entry.header().entry_type().is_file() {
            zip.start_file(info.path.as_str(), options)?;
            io::copy(&mut entry, &mut zip)?;
        }
    }
    Ok(zip.finish()?)
}

/// Shared copy loop. `map` may rename or drop (`None`) each entry.
///
/// Directories, regular files and links are carried over, devices and fifos are
/// not. A hard link is dropped when its target was not copied before it.
pub(super) fn copy_entries<R, W, F>(src: R, dst: &mut Builder<W>, mut map: F) -> Result<usize>
where
    R: Read,
    W: Write,
    F: FnMut(EntryInfo) -> Option<EntryInfo>,
{
    let mut archive = Archive::new(src);
    let mut written = HashSet::new();
    let mut copied = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let info = EntryInfo::from_entry(&entry)?;
        let kind = entry.header().entry_type();
        if !kind.is_dir() && !kind.is_file() && info.link.is_none() {
            debug!(path = %info.path, ?kind, "Skipping special archive entry");
            continue;
        }
        let Some(info) = map(info) else {
            continue;
        };
        if info.is_root() {
            continue;
        }
        if let Some(Link::Hard(target)) = &info.link {
            if !written.contains(target) {
                debug!(path = %info.path, %target, "Skipping hard link to an entry not copied");
                continue;
            }
        }
        append_entry(dst, &info, &mut entry)?;
        written.insert(info.path);
        copied += 1;
    }
    Ok(copied)
}

/// Append one directory, regular file or link entry. Long names are handled by
/// the tar builder through GNU extension headers.
pub(super) fn append_entry<W: Write, R: Read>(
    builder: &mut Builder<W>,
    info: &EntryInfo,
    data: R,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_mode(info.mode);
    header.set_mtime(info.mtime);
    if let Some(link) = &info.link {
        let (kind, target) = match link {
            Link::Symbolic(target) => (EntryType::Symlink, target),
            Link::Hard(target) => (EntryType::Link, target),
        };
        header.set_entry_type(kind);
        header.set_size(0);
        builder.append_link(&mut header, &info.path, target)?;
        return Ok(());
    }
    if info.is_dir {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
    } else {
        header.set_entry_type(EntryType::Regular);
        header.set_size(info.size);
    }
    builder.append_data(&mut header, &info.path, data)?;
    Ok(())
}

fn entry_name_for(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ArchiveError::UnsafePath(path.display().to_string()))?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return Err(ArchiveError::UnsafePath(name.to_string())),
        }
    }
    if path.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafePath(name.to_string()));
    }
    Ok(path)
}

#[cfg(unix)]
fn is_owner_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & OWNER_EXECUTE != 0
}

#[cfg(not(unix))]
fn is_owner_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_owner_executable(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    let mode = if executable {
        mode | OWNER_EXECUTE
    } else {
        mode & !OWNER_EXECUTE
    };
    permissions.set_mode(mode);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn set_owner_executable(_path: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}
