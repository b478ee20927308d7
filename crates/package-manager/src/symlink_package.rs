use derive_more::{Display, Error};
use knit_fs::symlink_dir;
use miette::Diagnostic;
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

/// Error type for [`symlink_package`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum SymlinkPackageError {
    #[display("Failed to create directory at {dir:?}: {error}")]
    #[diagnostic(code(knit_package_manager::create_parent_dir))]
    CreateParentDir {
        dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to remove outdated link at {symlink_path:?}: {error}")]
    #[diagnostic(code(knit_package_manager::remove_outdated_link))]
    RemoveOutdatedLink {
        symlink_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to create symlink at {symlink_path:?} to {symlink_target:?}: {error}")]
    #[diagnostic(code(knit_package_manager::symlink_dir))]
    SymlinkDir {
        symlink_target: PathBuf,
        symlink_path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

/// What to do when something already exists at the link location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingLink {
    /// Leave it alone.
    Keep,
    /// Replace it if it is a link pointing elsewhere.
    ReplaceOutdated,
}

/// Create symlink for a package.
///
/// * If ancestors of `symlink_path` don't exist, they will be created recursively.
/// * If `symlink_path` already exists, it is handled according to `existing`.
/// * Returns whether a new link was created.
pub fn symlink_package(
    symlink_target: &Path,
    symlink_path: &Path,
    existing: ExistingLink,
) -> Result<bool, SymlinkPackageError> {
    if let Some(parent) = symlink_path.parent() {
        fs::create_dir_all(parent).map_err(|error| SymlinkPackageError::CreateParentDir {
            dir: parent.to_path_buf(),
            error,
        })?;
    }

    if existing == ExistingLink::ReplaceOutdated {
        if let Ok(current_target) = fs::read_link(symlink_path) {
            if current_target == symlink_target {
                return Ok(false);
            }
            remove_link(symlink_path).map_err(|error| SymlinkPackageError::RemoveOutdatedLink {
                symlink_path: symlink_path.to_path_buf(),
                error,
            })?;
        }
    }

    match symlink_dir(symlink_target, symlink_path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(error) => Err(SymlinkPackageError::SymlinkDir {
            symlink_target: symlink_target.to_path_buf(),
            symlink_path: symlink_path.to_path_buf(),
            error,
        }),
    }
}

/// Remove a directory link without touching what it points to.
pub fn remove_link(path: &Path) -> io::Result<()> {
    // Junctions are directories to the Windows API.
    fs::remove_file(path).or_else(|_| fs::remove_dir(path))
}
