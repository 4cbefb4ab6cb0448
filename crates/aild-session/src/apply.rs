//! Materialize a tar archive onto a local directory.
//!
//! Entries are applied in archive order. Any entry whose target would land
//! outside the destination root, lexically or through an existing symlink,
//! is skipped without error.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use tar::{Archive, EntryType};
use thiserror::Error;

/// Mode for parent directories created on behalf of a file entry.
const PARENT_DIR_MODE: u32 = 0o755;

/// Archive application error.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to read archive: {0}")]
    Archive(#[source] io::Error),
    #[error("failed to prepare destination {}: {source}", path.display())]
    Root { path: PathBuf, source: io::Error },
    #[error("failed to apply {}: {source}", path.display())]
    Entry { path: PathBuf, source: io::Error },
}

/// Counts of what happened to the entries of one archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Entries written to disk.
    pub applied: usize,
    /// Unsafe or unsupported entries that were left alone.
    pub skipped: usize,
}

/// Lexically normalize `path`: drop `.`, fold `..` into its parent.
///
/// `..` never climbs above a root; on a relative path a leading `..` is kept.
#[must_use]
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                Some(Component::ParentDir | Component::CurDir) | None => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Where `name` lands under `root`, or `None` if it escapes.
///
/// `root` must already be clean. A leading `/` in `name` is ignored.
#[must_use]
pub fn resolve_entry(root: &Path, name: &Path) -> Option<PathBuf> {
    let relative: PathBuf = name
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    let target = clean_path(&root.join(relative));
    target.starts_with(root).then_some(target)
}

/// Whether the nearest existing ancestor of `target` resolves outside
/// `canonical_root`.
fn escapes_through_link(canonical_root: &Path, target: &Path) -> io::Result<bool> {
    let mut probe = target.parent();
    while let Some(dir) = probe {
        match fs::symlink_metadata(dir) {
            Ok(_) => return Ok(!fs::canonicalize(dir)?.starts_with(canonical_root)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => probe = dir.parent(),
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

/// Apply `archive` onto `root`.
///
/// Stops at the first entry that cannot be written; entries applied before
/// it stay on disk.
///
/// # Errors
/// Returns error if the archive cannot be decoded or an entry cannot be
/// written. The error names the offending path.
pub fn apply_archive(archive: &[u8], root: &Path) -> Result<ApplyReport, ApplyError> {
    let root_error = |source| ApplyError::Root {
        path: root.to_path_buf(),
        source,
    };
    let root = clean_path(root);
    fs::create_dir_all(&root).map_err(root_error)?;
    let canonical_root = fs::canonicalize(&root).map_err(root_error)?;

    let mut report = ApplyReport::default();
    let mut archive = Archive::new(archive);
    for entry in archive.entries().map_err(ApplyError::Archive)? {
        let mut entry = entry.map_err(ApplyError::Archive)?;
        let name = entry.path().map_err(ApplyError::Archive)?.into_owned();

        let Some(target) = resolve_entry(&root, &name) else {
            tracing::debug!(name = %name.display(), "skipping entry outside destination");
            report.skipped += 1;
            continue;
        };
        let entry_error = |source| ApplyError::Entry {
            path: target.clone(),
            source,
        };
        if target != root && escapes_through_link(&canonical_root, &target).map_err(entry_error)? {
            tracing::debug!(name = %name.display(), "skipping entry behind a symlink");
            report.skipped += 1;
            continue;
        }

        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        match entry.header().entry_type() {
            EntryType::Directory => {
                create_dir(&target, mode).map_err(entry_error)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                write_file(&mut entry, &target, mode).map_err(entry_error)?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(entry_error)?
                    .ok_or_else(|| entry_error(io::Error::other("symlink without a target")))?
                    .into_owned();
                replace_with_symlink(&link, &target).map_err(entry_error)?;
            }
            other => {
                tracing::debug!(name = %name.display(), kind = ?other, "ignoring unsupported entry");
                report.skipped += 1;
                continue;
            }
        }
        report.applied += 1;
    }

    tracing::debug!(
        applied = report.applied,
        skipped = report.skipped,
        root = %root.display(),
        "archive applied"
    );
    Ok(report)
}

fn write_file(payload: &mut impl io::Read, target: &Path, mode: u32) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        create_dir(parent, PARENT_DIR_MODE)?;
    }
    // Never write through a link left at the target.
    if fs::symlink_metadata(target).is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(target)?;
    }
    let mut file = open_truncated(target, mode)?;
    io::copy(payload, &mut file)?;
    Ok(())
}

fn replace_with_symlink(link: &Path, target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    if let Some(parent) = target.parent() {
        create_dir(parent, PARENT_DIR_MODE)?;
    }
    symlink(link, target)
}

#[cfg(unix)]
fn create_dir(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(mode).create(path)
}

#[cfg(not(unix))]
fn create_dir(path: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn open_truncated(path: &Path, mode: u32) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn open_truncated(path: &Path, _mode: u32) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(link, target)
}
