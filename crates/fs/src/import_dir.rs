use derive_more::{Display, Error};
use miette::Diagnostic;
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// How files are brought from the store into a package directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMethod {
    /// Hard link every file. Fails with `EXDEV` across filesystems.
    Hardlink,
    /// Reflink when the filesystem supports it, copy otherwise.
    Copy,
}

/// Error type of [`import_dir`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum ImportDirError {
    #[display("Failed to read directory entry in {dir:?}: {error}")]
    #[diagnostic(code(knit_fs::walk_dir))]
    WalkDir {
        dir: PathBuf,
        #[error(source)]
        error: walkdir::Error,
    },

    #[display("Failed to create directory at {dir:?}: {error}")]
    #[diagnostic(code(knit_fs::create_dir))]
    CreateDir {
        dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to import {from:?} to {to:?}: {error}")]
    #[diagnostic(code(knit_fs::import_file))]
    ImportFile {
        from: PathBuf,
        to: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

impl ImportDirError {
    /// Whether the import failed because source and target live on different filesystems.
    pub fn is_cross_device(&self) -> bool {
        match self {
            ImportDirError::ImportFile { error, .. } => crate::is_cross_device_error(error),
            ImportDirError::WalkDir { .. } | ImportDirError::CreateDir { .. } => false,
        }
    }
}

/// Import every file of `source_dir` into `target_dir`, keeping the relative layout.
///
/// * Missing directories under `target_dir` are created.
/// * Existing files at a target location are replaced.
pub fn import_dir(
    method: ImportMethod,
    source_dir: &Path,
    target_dir: &Path,
) -> Result<(), ImportDirError> {
    fs::create_dir_all(target_dir)
        .map_err(|error| ImportDirError::CreateDir { dir: target_dir.to_path_buf(), error })?;

    for entry in WalkDir::new(source_dir).min_depth(1) {
        let entry = entry
            .map_err(|error| ImportDirError::WalkDir { dir: source_dir.to_path_buf(), error })?;
        let Ok(suffix) = entry.path().strip_prefix(source_dir) else { continue };
        let target = target_dir.join(suffix);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|error| ImportDirError::CreateDir { dir: target.clone(), error })?;
            continue;
        }

        import_file(method, entry.path(), &target).map_err(|error| {
            ImportDirError::ImportFile { from: entry.path().to_path_buf(), to: target, error }
        })?;
    }

    Ok(())
}

fn import_file(method: ImportMethod, source: &Path, target: &Path) -> io::Result<()> {
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    match method {
        ImportMethod::Hardlink => fs::hard_link(source, target),
        ImportMethod::Copy => reflink_copy::reflink_or_copy(source, target).map(drop),
    }
}
