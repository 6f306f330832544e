use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// True when a lookup of `path` failed only because nothing can be there:
/// the path is absent or one of its ancestors is a regular file.
pub fn is_missing(err: &io::Error, path: &Path) -> bool {
    err.kind() == io::ErrorKind::NotFound
        || path.ancestors().skip(1).any(|ancestor| ancestor.is_file())
}

/// Removes a file, symlink, or directory tree. Missing paths are fine.
pub fn remove_path_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if is_missing(&err, path) => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Copies a file or a whole tree to `destination`, creating parents.
pub fn copy_path(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(source)?.is_dir() {
        copy_dir_recursive(source, destination)
    } else {
        fs::copy(source, destination).map(|_| ())
    }
}

pub fn copy_dir_recursive(source_root: &Path, destination_root: &Path) -> io::Result<()> {
    fs::create_dir_all(destination_root)?;

    let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    queue.push_back((source_root.to_path_buf(), destination_root.to_path_buf()));

    while let Some((from_dir, to_dir)) = queue.pop_front() {
        for entry in fs::read_dir(&from_dir)? {
            let entry = entry?;
            let from_path = entry.path();
            let to_path = to_dir.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                fs::create_dir_all(&to_path)?;
                queue.push_back((from_path, to_path));
                continue;
            }

            #[cfg(unix)]
            if file_type.is_symlink() {
                let target = fs::read_link(&from_path)?;
                std::os::unix::fs::symlink(&target, &to_path)?;
                continue;
            }

            fs::copy(&from_path, &to_path)?;
        }
    }
    Ok(())
}

/// Topmost ancestor of `path` (or `path` itself) that does not exist yet,
/// i.e. the directory a `create_dir_all` on `path` would start creating at.
pub fn first_missing_ancestor(path: &Path) -> Option<PathBuf> {
    if path_exists(path) {
        return None;
    }
    let mut missing = path.to_path_buf();
    while let Some(parent) = missing.parent() {
        if parent.as_os_str().is_empty() || path_exists(parent) {
            break;
        }
        missing = parent.to_path_buf();
    }
    Some(missing)
}

pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if is_missing(&err, path) => Ok(None),
        Err(err) => Err(err),
    }
}
