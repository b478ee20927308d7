use derive_more::{Display, Error};
use knit_fs::make_file_executable;
use knit_package_manifest::{PackageManifest, PackageManifestError};
use miette::Diagnostic;
use rayon::prelude::*;
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

/// Error type of [`link_bins`] and [`link_package_bins`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum LinkBinsError {
    #[display("Failed to read directory at {dir:?}: {error}")]
    #[diagnostic(code(knit_package_manager::read_modules_dir))]
    ReadDir {
        dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[diagnostic(transparent)]
    ReadManifest(#[error(source)] PackageManifestError),

    #[display("Failed to create directory at {dir:?}: {error}")]
    #[diagnostic(code(knit_package_manager::create_bin_dir))]
    CreateBinDir {
        dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to make {path:?} executable: {error}")]
    #[diagnostic(code(knit_package_manager::make_executable))]
    MakeExecutable {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to link command {command} at {link:?}: {error}")]
    #[diagnostic(code(knit_package_manager::link_bin))]
    LinkBin {
        command: String,
        link: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

/// Link the commands of every package in `modules_dir` into `bin_dir`.
///
/// Scoped packages are looked up one level deeper, in their `@scope` directory.
pub fn link_bins(modules_dir: &Path, bin_dir: &Path) -> Result<(), LinkBinsError> {
    package_dirs(modules_dir)?
        .par_iter()
        .try_for_each(|package_dir| link_package_bins(package_dir, bin_dir))
}

fn read_dir_names(dir: &Path) -> Result<Vec<String>, LinkBinsError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(LinkBinsError::ReadDir { dir: dir.to_path_buf(), error }),
    };
    entries
        .map(|entry| {
            entry
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .map_err(|error| LinkBinsError::ReadDir { dir: dir.to_path_buf(), error })
        })
        .collect()
}

fn package_dirs(modules_dir: &Path) -> Result<Vec<PathBuf>, LinkBinsError> {
    let mut package_dirs = Vec::new();
    for name in read_dir_names(modules_dir)? {
        if name.starts_with('.') {
            continue;
        }
        let path = modules_dir.join(&name);
        if name.starts_with('@') {
            package_dirs.extend(read_dir_names(&path)?.into_iter().map(|name| path.join(name)));
        } else {
            package_dirs.push(path);
        }
    }
    Ok(package_dirs)
}

/// Link the commands declared in the `bin` field of the package at `package_dir` into `bin_dir`.
pub fn link_package_bins(package_dir: &Path, bin_dir: &Path) -> Result<(), LinkBinsError> {
    let manifest_path = package_dir.join("package.json");
    if !manifest_path.exists() {
        return Ok(());
    }
    let bins = PackageManifest::from_path(&manifest_path).map_err(LinkBinsError::ReadManifest)?.bins();
    if bins.is_empty() {
        return Ok(());
    }

    fs::create_dir_all(bin_dir)
        .map_err(|error| LinkBinsError::CreateBinDir { dir: bin_dir.to_path_buf(), error })?;

    for (command, relative_path) in bins {
        if command.contains(['/', '\\']) || command.starts_with('.') {
            tracing::warn!(target: "knit::link", ?package_dir, %command, "Ignoring command with an invalid name");
            continue;
        }
        let target = package_dir.join(&relative_path);
        if !target.is_file() {
            tracing::debug!(target: "knit::link", ?target, %command, "Command target is missing");
            continue;
        }
        make_file_executable(&target)
            .map_err(|error| LinkBinsError::MakeExecutable { path: target.clone(), error })?;
        let link = bin_dir.join(&command);
        link_bin(&target, &link).map_err(|error| LinkBinsError::LinkBin { command, link, error })?;
    }

    Ok(())
}

#[cfg(unix)]
fn link_bin(target: &Path, link: &Path) -> io::Result<()> {
    match fs::remove_file(link) {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn link_bin(target: &Path, link: &Path) -> io::Result<()> {
    let shim = format!("@node \"{}\" %*\r\n", target.display());
    fs::write(link.with_extension("cmd"), shim)
}
