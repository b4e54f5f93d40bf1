//! Atomic symlink rotation with rollback.
//!
//! Certificate and key files are published through `cert`/`key` symlinks that
//! point at timestamped backing files. Rotation brings a symlink to a new
//! target; multi-file rotation shares one [`UndoStack`] so a failure in any
//! step rolls every prior step back.
//!
//! Symlink targets are always written relative to the symlink's directory so
//! the whole tree stays relocatable.

use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local};

use crate::kvlist::KvList;
use crate::undo::UndoStack;

/// Errors raised while rotating symlinks.
#[derive(Debug, thiserror::Error)]
pub enum RotateError {
    /// The rotation target does not exist or cannot be inspected.
    #[error("target {path} is not accessible: {source}")]
    MissingTarget { path: PathBuf, source: io::Error },

    /// The symlink path itself could not be inspected.
    #[error("failed to inspect {path}: {source}")]
    Inspect { path: PathBuf, source: io::Error },

    /// Reading an existing symlink failed.
    #[error("failed to read symlink {path}: {source}")]
    ReadLink { path: PathBuf, source: io::Error },

    /// Removing an existing symlink failed.
    #[error("failed to remove symlink {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    /// Renaming a regular file aside failed.
    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Creating the new symlink failed.
    #[error("failed to create symlink {link} -> {target}: {source}")]
    Create {
        link: PathBuf,
        target: PathBuf,
        source: io::Error,
    },

    /// A rotation failed and one or more undo actions failed as well.
    #[error("{original}; rollback errors: {failures}")]
    RollbackFailed {
        original: Box<RotateError>,
        failures: String,
    },
}

/// Reads the target of a symlink and resolves it to an absolute path.
///
/// Relative targets resolve against the symlink's directory; absolute targets
/// are returned normalized.
pub fn readlink_abs(path: &Path) -> Result<PathBuf, RotateError> {
    let link = std::fs::read_link(path).map_err(|source| RotateError::ReadLink {
        path: path.to_path_buf(),
        source,
    })?;

    if link.is_absolute() {
        return Ok(normalize(&link));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    absolute(&dir.join(link)).map_err(|source| RotateError::ReadLink {
        path: path.to_path_buf(),
        source,
    })
}

/// Points `symlink` at `target`, rolling back on failure.
pub fn rotate_symlink(symlink: &Path, target: &Path) -> Result<(), RotateError> {
    let mut undo = UndoStack::new();
    match rotate_symlink_with_undo(symlink, target, &mut undo) {
        Ok(()) => Ok(()),
        Err(err) => Err(rollback_from_error(&mut undo, err)),
    }
}

/// Rotates a list of symlinks to their respective targets.
///
/// Keys are symlink paths, values are target paths. All rotations share one
/// undo stack; the first failure stops iteration and rolls everything back.
pub fn rotate_symlink_list(links: &KvList<PathBuf, PathBuf>) -> Result<(), RotateError> {
    let mut undo = UndoStack::new();

    for (symlink, target) in links.iter() {
        if let Err(err) = rotate_symlink_with_undo(symlink, target, &mut undo) {
            return Err(rollback_from_error(&mut undo, err));
        }
    }
    Ok(())
}

/// Points `symlink` at `target`, pushing compensating actions onto `undo`.
///
/// Cases handled:
/// - `symlink` does not exist: a new symlink is created.
/// - `symlink` is a symlink: no-op if it already resolves to `target`,
///   otherwise it is replaced and the undo recreates the old link verbatim.
/// - `symlink` is a regular file: renamed aside to `<path>.<mtime>` (with
///   `-1`, `-2`, ... on collision) and the undo renames it back.
pub fn rotate_symlink_with_undo(
    symlink: &Path,
    target: &Path,
    undo: &mut UndoStack,
) -> Result<(), RotateError> {
    if let Err(source) = std::fs::symlink_metadata(target) {
        return Err(RotateError::MissingTarget {
            path: target.to_path_buf(),
            source,
        });
    }

    // symlink_metadata is the Lstat equivalent: it must not follow the link.
    match std::fs::symlink_metadata(symlink) {
        Err(source) if source.kind() == io::ErrorKind::NotFound => {
            // Nothing in the way, just create the link below.
        }

        Err(source) => {
            return Err(RotateError::Inspect {
                path: symlink.to_path_buf(),
                source,
            });
        }

        Ok(meta) if meta.file_type().is_symlink() => {
            let current = readlink_abs(symlink)?;
            let abs_target = absolute(target).map_err(|source| RotateError::MissingTarget {
                path: target.to_path_buf(),
                source,
            })?;
            if current == abs_target {
                return Ok(());
            }

            // Keep the exact link value for rollback, not the resolved path.
            let rollback_value =
                std::fs::read_link(symlink).map_err(|source| RotateError::ReadLink {
                    path: symlink.to_path_buf(),
                    source,
                })?;

            std::fs::remove_file(symlink).map_err(|source| RotateError::Remove {
                path: symlink.to_path_buf(),
                source,
            })?;
            let link = symlink.to_path_buf();
            undo.push(move || std::os::unix::fs::symlink(&rollback_value, &link));
        }

        Ok(meta) => {
            // A regular file occupies the path. Move it aside under a
            // timestamp derived from its mtime.
            let mtime: DateTime<Local> = meta
                .modified()
                .map_err(|source| RotateError::Inspect {
                    path: symlink.to_path_buf(),
                    source,
                })?
                .into();
            let suffix = mtime.format("%Y%m%d%H%M%S").to_string();

            let mut backup = PathBuf::from(format!("{}.{}", symlink.display(), suffix));
            let mut counter = 1;
            while backup.exists() {
                backup = PathBuf::from(format!("{}.{}-{}", symlink.display(), suffix, counter));
                counter += 1;
            }

            std::fs::rename(symlink, &backup).map_err(|source| RotateError::Rename {
                from: symlink.to_path_buf(),
                to: backup.clone(),
                source,
            })?;
            let link = symlink.to_path_buf();
            undo.push(move || std::fs::rename(&backup, &link));
        }
    }

    let dir = symlink.parent().unwrap_or_else(|| Path::new("."));
    let relative = relative_to(dir, target).map_err(|source| RotateError::MissingTarget {
        path: target.to_path_buf(),
        source,
    })?;

    std::os::unix::fs::symlink(&relative, symlink).map_err(|source| RotateError::Create {
        link: symlink.to_path_buf(),
        target: target.to_path_buf(),
        source,
    })?;

    let link = symlink.to_path_buf();
    undo.push(move || std::fs::remove_file(&link));

    Ok(())
}

/// Runs the undo stack and joins any rollback failures onto the error.
fn rollback_from_error(undo: &mut UndoStack, err: RotateError) -> RotateError {
    let failures = undo.rollback();
    if failures.is_empty() {
        return err;
    }
    RotateError::RollbackFailed {
        original: Box::new(err),
        failures: failures
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    }
}

/// Makes a path absolute against the current directory and normalizes it.
fn absolute(path: &Path) -> io::Result<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize(&abs))
}

/// Lexically normalizes a path, resolving `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Computes the path of `target` relative to `dir`.
fn relative_to(dir: &Path, target: &Path) -> io::Result<PathBuf> {
    let dir = absolute(dir)?;
    let target = absolute(target)?;

    let dir_parts: Vec<_> = dir.components().collect();
    let target_parts: Vec<_> = target.components().collect();

    let common = dir_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..dir_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part);
    }
    Ok(relative)
}
