//! Gzip tarball packing and unpacking
//!
//! Packing is deterministic (sorted entries, zeroed timestamps and owners) so
//! that packing the same tree twice yields identical bytes and therefore the
//! same integrity hash. Unpacking rejects entries that would escape the
//! destination and drains the gzip stream to its trailer, so a truncated
//! download fails instead of producing a partial tree.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, EntryType, Header};
use tracing::debug;

/// Top-level directory every packed entry lives under
const PACKAGE_PREFIX: &str = "package";

/// Directories never included in a packed tarball
const EXCLUDED_DIRS: [&str; 4] = [".git", "depot_modules", "target", ".depot-cache"];

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsafe path in archive entry: {0}")]
    UnsafePath(String),

    #[error("Archive is truncated or corrupt: {0}")]
    Truncated(String),

    #[error("Archive contains no files")]
    Empty,
}

/// Pack `dir` into a gzip tarball.
///
/// When `include` is given, only those top-level names are packed.
pub fn pack_dir(dir: &Path, include: Option<&[&str]>) -> io::Result<Vec<u8>> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    if let Some(include) = include {
        files.retain(|rel| {
            rel.components()
                .next()
                .and_then(|c| c.as_os_str().to_str())
                .is_some_and(|top| include.contains(&top))
        });
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for rel in &files {
        let data = fs::read(dir.join(rel))?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        let name = Path::new(PACKAGE_PREFIX).join(rel);
        builder.append_data(&mut header, name, data.as_slice())?;
    }

    builder.into_inner()?.finish()
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let name = entry.file_name();
            if EXCLUDED_DIRS.iter().any(|excluded| name == *excluded) {
                continue;
            }
            collect_files(base, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(base)
                .map_err(|e| io::Error::other(e.to_string()))?
                .to_path_buf();
            out.push(rel);
        }
    }
    Ok(())
}

/// Normalize an archive path, rejecting absolute paths and `..`
fn safe_rel_path(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => out.push(segment),
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(ArchiveError::UnsafePath(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

fn open_archive(tarball: &Path) -> io::Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(tarball)?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn truncated(e: io::Error) -> ArchiveError {
    ArchiveError::Truncated(e.to_string())
}

/// Returns the single top-level directory shared by every entry, if any
fn common_root(tarball: &Path) -> Result<Option<PathBuf>, ArchiveError> {
    let mut archive = open_archive(tarball)?;
    let mut common: Option<PathBuf> = None;
    let mut nested = false;

    for entry in archive.entries().map_err(truncated)? {
        let entry = entry.map_err(truncated)?;
        let rel = safe_rel_path(&entry.path().map_err(truncated)?)?;
        let mut components = rel.components();
        let Some(first) = components.next() else {
            continue;
        };
        let has_rest = components.next().is_some();
        if !has_rest && entry.header().entry_type() != EntryType::Directory {
            // A file at the top level means there is no wrapper directory
            return Ok(None);
        }
        nested |= has_rest;

        let first = PathBuf::from(first.as_os_str());
        match &common {
            None => common = Some(first),
            Some(existing) if *existing == first => {}
            Some(_) => return Ok(None),
        }
    }

    Ok(common.filter(|_| nested))
}

/// Extract a gzip tarball into `dest`, stripping a shared top-level directory.
///
/// Returns the number of files written.
pub fn unpack(tarball: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let root = common_root(tarball)?;
    fs::create_dir_all(dest)?;

    let mut archive = open_archive(tarball)?;
    let mut files = 0usize;

    for entry in archive.entries().map_err(truncated)? {
        let mut entry = entry.map_err(truncated)?;
        let rel = safe_rel_path(&entry.path().map_err(truncated)?)?;
        let rel = match &root {
            Some(root) => match rel.strip_prefix(root) {
                Ok(stripped) => stripped.to_path_buf(),
                Err(_) => rel,
            },
            None => rel,
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let out_path = dest.join(&rel);
        match entry.header().entry_type() {
            EntryType::Directory => fs::create_dir_all(&out_path)?,
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&out_path).map_err(truncated)?;
                files += 1;
            }
            other => debug!("Skipping archive entry {:?} of type {:?}", rel, other),
        }
    }

    // Reading to the end verifies the gzip trailer (CRC and length)
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink()).map_err(truncated)?;

    if files == 0 {
        return Err(ArchiveError::Empty);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (path, content) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn pack_is_deterministic() {
        let src = TempDir::new().unwrap();
        write_tree(
            src.path(),
            &[("depot.toml", "[package]\n"), ("src/main.dr", "print 1")],
        );

        let first = pack_dir(src.path(), None).unwrap();
        let second = pack_dir(src.path(), None).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn pack_then_unpack_strips_package_prefix() {
        let src = TempDir::new().unwrap();
        write_tree(
            src.path(),
            &[
                ("depot.toml", "[package]\nname = \"a\"\n"),
                ("src/lib.dr", "fn a() {}"),
                (".git/config", "ignored"),
            ],
        );
        let bytes = pack_dir(src.path(), None).unwrap();

        let work = TempDir::new().unwrap();
        let tarball = work.path().join("a.tgz");
        fs::write(&tarball, bytes).unwrap();
        let dest = work.path().join("out");

        let count = unpack(&tarball, &dest).unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            fs::read_to_string(dest.join("src/lib.dr")).unwrap(),
            "fn a() {}"
        );
        assert!(!dest.join(".git").exists());
        assert!(!dest.join(PACKAGE_PREFIX).exists());
    }

    #[test]
    fn pack_honors_include_list() {
        let src = TempDir::new().unwrap();
        write_tree(
            src.path(),
            &[
                ("depot.toml", "[package]\n"),
                ("src/lib.dr", ""),
                ("notes.txt", "private"),
            ],
        );
        let bytes = pack_dir(src.path(), Some(&["depot.toml", "src"])).unwrap();

        let work = TempDir::new().unwrap();
        let tarball = work.path().join("p.tgz");
        fs::write(&tarball, bytes).unwrap();
        unpack(&tarball, &work.path().join("out")).unwrap();

        assert!(work.path().join("out/depot.toml").exists());
        assert!(!work.path().join("out/notes.txt").exists());
    }

    #[test]
    fn unpack_fails_on_truncated_tarball() {
        let src = TempDir::new().unwrap();
        let big = "x".repeat(64 * 1024);
        write_tree(src.path(), &[("data.bin", big.as_str()), ("b.txt", "b")]);
        let bytes = pack_dir(src.path(), None).unwrap();

        let work = TempDir::new().unwrap();
        let tarball = work.path().join("t.tgz");
        fs::write(&tarball, &bytes[..bytes.len() - 16]).unwrap();

        assert!(unpack(&tarball, &work.path().join("out")).is_err());
    }

    #[test]
    fn unpack_rejects_parent_dir_entries() {
        let work = TempDir::new().unwrap();
        let tarball = work.path().join("evil.tgz");

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        // Bypass set_path validation to simulate a hostile archive
        let name = b"../evil.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        fs::write(&tarball, builder.into_inner().unwrap().finish().unwrap()).unwrap();

        assert!(matches!(
            unpack(&tarball, &work.path().join("out")),
            Err(ArchiveError::UnsafePath(_))
        ));
        assert!(!work.path().join("evil.txt").exists());
    }
}
