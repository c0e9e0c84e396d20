/// Installer: puts the worker bundle (one script plus its support package)
/// into the application-data directory.
///
/// Both items are staged into a fresh temporary directory first, so a
/// failure while reading the source never touches the installed copy.
use std::path::{Path, PathBuf};

/// Entries never copied into a bundle.
const IGNORED_NAMES: &[&str] = &["__pycache__", ".DS_Store"];

/// What an install did.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub script: PathBuf,
    pub package_dir: PathBuf,
    pub files_copied: usize,
    /// Previous install moved aside and then deleted.
    pub replaced_previous: bool,
}

/// Errors from installing the bundle.
#[derive(Debug)]
pub enum InstallError {
    /// A source item does not exist. Nothing was touched.
    SourceMissing { path: PathBuf },
    /// Staging failed. The destination is untouched and staging is cleaned up.
    StageFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Copying into the destination failed. Backups are kept for recovery.
    CopyFailed {
        path: PathBuf,
        source: std::io::Error,
        backups: Vec<PathBuf>,
    },
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::SourceMissing { path } => {
                write!(f, "bundle source not found: {}", path.display())
            }
            InstallError::StageFailed { path, source } => {
                write!(f, "failed to stage {}: {source}", path.display())
            }
            InstallError::CopyFailed {
                path,
                source,
                backups,
            } => {
                write!(f, "failed to install {}: {source}", path.display())?;
                if !backups.is_empty() {
                    let list: Vec<String> =
                        backups.iter().map(|b| b.display().to_string()).collect();
                    write!(f, " (previous install kept at {})", list.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstallError::SourceMissing { .. } => None,
            InstallError::StageFailed { source, .. } => Some(source),
            InstallError::CopyFailed { source, .. } => Some(source),
        }
    }
}

/// Install `source_script` and `source_dir` as `dest_script` and `dest_dir`.
pub fn install_bundle(
    source_script: &Path,
    source_dir: &Path,
    dest_script: &Path,
    dest_dir: &Path,
) -> Result<InstallReport, InstallError> {
    if !source_script.is_file() {
        return Err(InstallError::SourceMissing {
            path: source_script.to_path_buf(),
        });
    }
    if !source_dir.is_dir() {
        return Err(InstallError::SourceMissing {
            path: source_dir.to_path_buf(),
        });
    }

    let stage_parent = dest_dir.parent().unwrap_or(Path::new("."));
    let stage_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| InstallError::StageFailed { path, source }
    };
    std::fs::create_dir_all(stage_parent).map_err(stage_err(stage_parent))?;
    if let Some(parent) = dest_script.parent() {
        std::fs::create_dir_all(parent).map_err(stage_err(parent))?;
    }

    // Dropping the TempDir on any early return removes the staging area.
    let stage = tempfile::Builder::new()
        .prefix(".bundle-stage-")
        .tempdir_in(stage_parent)
        .map_err(stage_err(stage_parent))?;
    let staged_script = stage.path().join("script");
    let staged_dir = stage.path().join("package");
    std::fs::copy(source_script, &staged_script).map_err(stage_err(source_script))?;
    copy_tree(source_dir, &staged_dir).map_err(stage_err(source_dir))?;
    tracing::debug!(stage = %stage.path().display(), "bundle staged");

    let backup_suffix = format!(
        "bak-{}-{}",
        chrono::Local::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    );
    let backups: Vec<PathBuf> = [dest_script, dest_dir]
        .into_iter()
        .filter_map(|dest| move_aside(dest, &backup_suffix))
        .collect();

    let mut files_copied = 0usize;
    let copy_result = std::fs::copy(&staged_script, dest_script)
        .map(|_| files_copied += 1)
        .map_err(|e| (dest_script.to_path_buf(), e))
        .and_then(|()| {
            copy_tree(&staged_dir, dest_dir)
                .map(|n| files_copied += n)
                .map_err(|e| (dest_dir.to_path_buf(), e))
        });

    if let Err(e) = stage.close() {
        tracing::warn!(error = %e, "failed to remove bundle staging directory");
    }

    if let Err((path, source)) = copy_result {
        tracing::error!(
            path = %path.display(),
            error = %source,
            backups = ?backups,
            "bundle install failed, previous install left in backups"
        );
        return Err(InstallError::CopyFailed {
            path,
            source,
            backups,
        });
    }

    for backup in &backups {
        if let Err(e) = remove_path(backup) {
            tracing::warn!(error = %e, path = %backup.display(), "failed to remove backup");
        }
    }

    tracing::info!(
        script = %dest_script.display(),
        package = %dest_dir.display(),
        files_copied,
        "bundle installed"
    );
    Ok(InstallReport {
        script: dest_script.to_path_buf(),
        package_dir: dest_dir.to_path_buf(),
        files_copied,
        replaced_previous: !backups.is_empty(),
    })
}

/// Rename `dest` to a sibling backup. Falls back to deleting it.
/// Returns the backup path when one was made.
fn move_aside(dest: &Path, suffix: &str) -> Option<PathBuf> {
    if std::fs::symlink_metadata(dest).is_err() {
        return None;
    }
    let name = dest.file_name()?.to_string_lossy();
    let backup = dest.with_file_name(format!("{name}.{suffix}"));
    match std::fs::rename(dest, &backup) {
        Ok(()) => Some(backup),
        Err(e) => {
            tracing::warn!(error = %e, path = %dest.display(), "could not move previous install aside, removing it");
            if let Err(e) = remove_path(dest) {
                tracing::warn!(error = %e, path = %dest.display(), "could not remove previous install");
            }
            None
        }
    }
}

/// Depth-first copy of a directory tree. Returns the number of files copied.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if IGNORED_NAMES.iter().any(|n| name == *n) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if std::fs::symlink_metadata(path)?.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
