//! Zip packing and unpacking for world backups and content packages

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Structure or checksum problem in the archive itself
    #[error("{0}")]
    Corrupt(String),

    /// Entry would land outside the destination directory
    #[error("entry '{0}' escapes the destination directory")]
    UnsafePath(String),

    /// Source entry that cannot be represented faithfully
    #[error("{path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    /// Local filesystem failure while reading sources or writing output
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Corrupt(e.to_string())
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Streams a zip archive to `writer`
pub struct ArchiveBuilder<W: Write + Seek> {
    zip: ZipWriter<W>,
    entries: usize,
}

impl<W: Write + Seek> ArchiveBuilder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            entries: 0,
        }
    }

    fn options() -> SimpleFileOptions {
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
    }

    /// Add an in-memory file at `name`
    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<(), ArchiveError> {
        self.zip.start_file(name.to_string(), Self::options())?;
        self.zip.write_all(data).map_err(io_at(Path::new(name)))?;
        self.entries += 1;
        Ok(())
    }

    /// Recursively add `dir` under `prefix`, preserving relative paths.
    ///
    /// Symbolic links are stored as links and must point inside `dir`.
    pub fn add_dir(&mut self, dir: &Path, prefix: &str) -> Result<(), ArchiveError> {
        self.add_tree(dir, prefix, Path::new(prefix))
    }

    fn add_tree(&mut self, dir: &Path, prefix: &str, root: &Path) -> Result<(), ArchiveError> {
        self.zip
            .add_directory(format!("{}/", prefix), Self::options())?;
        self.entries += 1;

        let mut children: Vec<_> = fs::read_dir(dir)
            .map_err(io_at(dir))?
            .collect::<io::Result<_>>()
            .map_err(io_at(dir))?;
        children.sort_by_key(|e| e.file_name());

        for entry in children {
            let path = entry.path();
            let name = format!("{}/{}", prefix, entry.file_name().to_string_lossy());
            let file_type = entry.file_type().map_err(io_at(&path))?;

            if file_type.is_symlink() {
                self.add_link(&path, &name, root)?;
            } else if file_type.is_dir() {
                self.add_tree(&path, &name, root)?;
            } else if file_type.is_file() {
                self.add_file(&path, &name)?;
            } else {
                return Err(ArchiveError::Unsupported {
                    path,
                    reason: "only regular files, directories and links can be archived"
                        .to_string(),
                });
            }
        }
        Ok(())
    }

    fn add_file(&mut self, path: &Path, name: &str) -> Result<(), ArchiveError> {
        #[allow(unused_mut)]
        let mut options = Self::options();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path).map_err(io_at(path))?.permissions().mode();
            options = options.unix_permissions(mode);
        }

        let mut source = File::open(path).map_err(io_at(path))?;
        self.zip.start_file(name.to_string(), options)?;
        io::copy(&mut source, &mut self.zip).map_err(io_at(path))?;
        self.entries += 1;
        Ok(())
    }

    fn add_link(&mut self, path: &Path, name: &str, root: &Path) -> Result<(), ArchiveError> {
        let target = fs::read_link(path).map_err(io_at(path))?;
        let unsupported = |reason: &str| ArchiveError::Unsupported {
            path: path.to_path_buf(),
            reason: format!("link to {:?} {}", target, reason),
        };
        let stays_inside = resolve_link(Path::new(name), &target)
            .is_some_and(|resolved| resolved.starts_with(root));
        if !stays_inside {
            return Err(unsupported("points outside the archived directory"));
        }
        let target_str = target
            .to_str()
            .ok_or_else(|| unsupported("is not valid UTF-8"))?;

        self.zip
            .add_symlink(name.to_string(), target_str, Self::options())?;
        self.entries += 1;
        Ok(())
    }

    /// Number of entries written so far, directories included
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn finish(self) -> Result<W, ArchiveError> {
        Ok(self.zip.finish()?)
    }
}

/// Open an archive, treating any structural failure as corruption
pub fn open<R: Read + Seek>(reader: R) -> Result<ZipArchive<R>, ArchiveError> {
    Ok(ZipArchive::new(reader)?)
}

/// Read a small file entry fully; `None` when the archive has no such entry
pub fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| ArchiveError::Corrupt(format!("{}: {}", name, e)))?;
    Ok(Some(buf))
}

/// The single top-level directory every entry lives under, if there is one
pub fn common_root<R: Read + Seek>(archive: &ZipArchive<R>) -> Option<String> {
    let mut root: Option<&str> = None;
    for name in archive.file_names() {
        let mut parts = name.splitn(2, '/');
        let first = parts.next()?;
        let rest = parts.next();
        if rest.is_none() {
            // A file at the top level means there is no wrapping directory
            return None;
        }
        match root {
            None => root = Some(first),
            Some(r) if r == first => {}
            Some(_) => return None,
        }
    }
    root.filter(|r| !r.is_empty()).map(str::to_string)
}

/// Extract every entry below `strip` into `dest`.
///
/// Entries outside `strip` and names listed in `skip` are ignored. Returns the
/// number of entries written. Every entry is CRC-checked while it is read.
pub fn extract<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    dest: &Path,
    strip: Option<&str>,
    skip: &[&str],
) -> Result<usize, ArchiveError> {
    fs::create_dir_all(dest).map_err(io_at(dest))?;
    let mut written = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let raw_name = entry.name().to_string();
        if skip.contains(&raw_name.as_str()) {
            continue;
        }

        let enclosed = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafePath(raw_name.clone()))?;
        let relative = match strip {
            Some(prefix) => match enclosed.strip_prefix(prefix) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => continue,
            },
            None => enclosed,
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ArchiveError::UnsafePath(raw_name));
        }

        let target = dest.join(&relative);
        if entry.is_symlink() {
            let mut link = Vec::new();
            entry
                .read_to_end(&mut link)
                .map_err(|e| ArchiveError::Corrupt(format!("{}: {}", raw_name, e)))?;
            let link = String::from_utf8(link)
                .map_err(|_| ArchiveError::Corrupt(format!("{}: link target is not UTF-8", raw_name)))?;
            if resolve_link(&relative, Path::new(&link)).is_none() {
                return Err(ArchiveError::UnsafePath(raw_name));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_at(parent))?;
            }
            create_link(&link, &target)?;
        } else if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_at(&target))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_at(parent))?;
            }
            let mut out = File::create(&target).map_err(io_at(&target))?;
            copy_entry(&mut entry, &mut out, &raw_name, &target)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                        .map_err(io_at(&target))?;
                }
            }
        }
        written += 1;
    }

    debug!("Extracted {} entries into {:?}", written, dest);
    Ok(written)
}

/// Lexically resolve `target` as a link living at `link`.
///
/// Returns `None` for absolute targets or ones climbing above the top level.
fn resolve_link(link: &Path, target: &Path) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    let parent = link.parent().unwrap_or(Path::new(""));
    for component in parent.components().chain(target.components()) {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

#[cfg(unix)]
fn create_link(link: &str, target: &Path) -> Result<(), ArchiveError> {
    std::os::unix::fs::symlink(link, target).map_err(io_at(target))
}

#[cfg(not(unix))]
fn create_link(link: &str, target: &Path) -> Result<(), ArchiveError> {
    Err(ArchiveError::Unsupported {
        path: target.to_path_buf(),
        reason: format!("cannot create link to '{}' on this platform", link),
    })
}

/// Copy one entry, telling archive read failures apart from local write failures
fn copy_entry(
    reader: &mut impl Read,
    writer: &mut impl Write,
    name: &str,
    target: &Path,
) -> Result<u64, ArchiveError> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArchiveError::Corrupt(format!("{}: {}", name, e))),
        };
        writer.write_all(&buf[..n]).map_err(io_at(target))?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            builder.add_bytes(name, data).unwrap();
        }
        builder.finish().unwrap().into_inner()
    }

    #[test]
    fn directory_round_trip_preserves_relative_paths() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("scenes/maps")).unwrap();
        fs::write(src.path().join("world.json"), b"{}").unwrap();
        fs::write(src.path().join("scenes/maps/a.webp"), b"image").unwrap();

        let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new()));
        builder.add_dir(src.path(), "w1").unwrap();
        assert_eq!(builder.entries(), 5);
        let bytes = builder.finish().unwrap().into_inner();

        let dest = TempDir::new().unwrap();
        let mut archive = open(Cursor::new(bytes)).unwrap();
        assert_eq!(common_root(&archive).as_deref(), Some("w1"));
        extract(&mut archive, dest.path(), Some("w1"), &[]).unwrap();

        assert_eq!(fs::read(dest.path().join("world.json")).unwrap(), b"{}");
        assert_eq!(
            fs::read(dest.path().join("scenes/maps/a.webp")).unwrap(),
            b"image"
        );
    }

    #[cfg(unix)]
    #[test]
    fn links_inside_the_tree_survive_a_round_trip() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("data")).unwrap();
        fs::write(src.path().join("data/actors.db"), b"goblin").unwrap();
        std::os::unix::fs::symlink("actors.db", src.path().join("data/actors-link.db")).unwrap();
        std::os::unix::fs::symlink("data", src.path().join("latest")).unwrap();

        let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new()));
        builder.add_dir(src.path(), "w1").unwrap();
        let bytes = builder.finish().unwrap().into_inner();

        let dest = TempDir::new().unwrap();
        let mut archive = open(Cursor::new(bytes)).unwrap();
        extract(&mut archive, dest.path(), Some("w1"), &[]).unwrap();

        let link = dest.path().join("data/actors-link.db");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("actors.db"));
        assert_eq!(fs::read(&link).unwrap(), b"goblin");
        assert_eq!(fs::read_link(dest.path().join("latest")).unwrap(), PathBuf::from("data"));
    }

    #[cfg(unix)]
    #[test]
    fn links_leaving_the_tree_are_not_archived() {
        let outside = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), src.path().join("escape")).unwrap();

        let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new()));
        let err = builder.add_dir(src.path(), "w1").unwrap_err();
        assert!(matches!(err, ArchiveError::Unsupported { .. }));

        let src = TempDir::new().unwrap();
        std::os::unix::fs::symlink("../../secrets", src.path().join("escape")).unwrap();
        let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new()));
        assert!(builder.add_dir(src.path(), "w1").is_err());
    }

    #[test]
    fn escaping_link_entries_are_rejected() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.add_symlink("w1/escape", "../../outside", SimpleFileOptions::default())
            .unwrap();
        let bytes = zip.finish().unwrap().into_inner();

        let dest = TempDir::new().unwrap();
        let mut archive = open(Cursor::new(bytes)).unwrap();
        let err = extract(&mut archive, dest.path(), Some("w1"), &[]).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(fs::symlink_metadata(dest.path().join("escape")).is_err());
    }

    #[test]
    fn link_resolution_is_lexical() {
        assert_eq!(
            resolve_link(Path::new("w1/data/link"), Path::new("../x")),
            Some(PathBuf::from("w1/x"))
        );
        assert_eq!(resolve_link(Path::new("link"), Path::new("../x")), None);
        assert_eq!(resolve_link(Path::new("w1/link"), Path::new("/etc/passwd")), None);
    }

    #[test]
    fn no_common_root_with_top_level_files() {
        let bytes = zip_of(&[("system.json", b"{}"), ("lang/en.json", b"{}")]);
        let archive = open(Cursor::new(bytes)).unwrap();
        assert_eq!(common_root(&archive), None);
    }

    #[test]
    fn skipped_entries_are_not_written() {
        let bytes = zip_of(&[("meta.json", b"{}"), ("keep.txt", b"k")]);
        let dest = TempDir::new().unwrap();
        let mut archive = open(Cursor::new(bytes)).unwrap();
        let written = extract(&mut archive, dest.path(), None, &["meta.json"]).unwrap();
        assert_eq!(written, 1);
        assert!(!dest.path().join("meta.json").exists());
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let bytes = zip_of(&[("../escape.txt", b"x")]);
        let dest = TempDir::new().unwrap();
        let mut archive = open(Cursor::new(bytes)).unwrap();
        let err = extract(&mut archive, dest.path(), None, &[]).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
    }

    #[test]
    fn truncated_archive_is_corrupt() {
        let bytes = zip_of(&[("a.txt", b"hello world")]);
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            open(Cursor::new(truncated.to_vec())),
            Err(ArchiveError::Corrupt(_))
        ));
    }

    #[test]
    fn read_entry_reports_absence() {
        let bytes = zip_of(&[("a.txt", b"hello")]);
        let mut archive = open(Cursor::new(bytes)).unwrap();
        assert_eq!(read_entry(&mut archive, "a.txt").unwrap().unwrap(), b"hello");
        assert!(read_entry(&mut archive, "b.txt").unwrap().is_none());
    }
}
