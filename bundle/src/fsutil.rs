//! Filesystem helpers shared by the bundle manager (make-bundle assembly)
//! and the workers: symlink-aware removal and copying, lexical path
//! normalization for containment checks, and directory sizing.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Lexically normalizes a path: resolves `.` and `..` components without
/// touching the filesystem, so symlinks are never followed.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Whether `path`, joined onto `base` and normalized, stays inside `base`.
/// Used to keep `child_path` and `parent_path` mounts from escaping their
/// bundle roots via `..`.
pub fn path_is_contained(base: &Path, path: &Path) -> bool {
    normalize_path(&base.join(path)).starts_with(normalize_path(base))
}

/// Removes a file, symlink or directory tree, tolerating absence.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copies a file or directory tree without following symlinks: symlinks are
/// recreated pointing at their original targets.
pub fn copy_path(source: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        copy_symlink(source, dest)
    } else if meta.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_path(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, dest)?;
        Ok(())
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    let target = fs::read_link(source)?;
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot copy symlink {:?} on this platform", source),
    ))
}

/// Total size in bytes of a file or directory tree. Symlinks count as the
/// size of the link itself, not its target.
pub fn path_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = meta.len();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        total += path_size(&entry.path())?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn containment_rejects_escapes() {
        let base = Path::new("/srv/bundles/0x1");
        assert!(path_is_contained(base, Path::new("src/train.py")));
        assert!(path_is_contained(base, Path::new("")));
        assert!(!path_is_contained(base, Path::new("../0x2")));
        assert!(!path_is_contained(base, Path::new("src/../../escape")));
    }

    #[test]
    fn copy_preserves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("data"), b"payload").unwrap();
        std::os::unix::fs::symlink("data", source.join("link")).unwrap();

        let dest = dir.path().join("dest");
        copy_path(&source, &dest).unwrap();

        assert_eq!(fs::read(dest.join("data")).unwrap(), b"payload");
        assert!(fs::symlink_metadata(dest.join("link"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn remove_path_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("never-created")).unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        remove_path(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn sizes_recurse() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert!(path_size(dir.path()).unwrap() >= 150);
    }
}
