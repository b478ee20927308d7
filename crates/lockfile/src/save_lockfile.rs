use crate::Lockfile;
use derive_more::{Display, Error};
use miette::Diagnostic;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Error when writing a lockfile to the filesystem.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum SaveLockfileError {
    #[display("Failed to serialize lockfile: {_0}")]
    #[diagnostic(code(knit_lockfile::serialize_yaml))]
    SerializeYaml(#[error(source)] serde_yaml::Error),

    #[display("Failed to create directory at {dir:?}: {error}")]
    #[diagnostic(code(knit_lockfile::create_dir))]
    CreateDir {
        dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to write lockfile to {path:?}: {error}")]
    #[diagnostic(code(knit_lockfile::write_file))]
    WriteFile {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

impl Lockfile {
    /// Write the lockfile as YAML, creating the parent directory if needed.
    pub fn save_to_path(&self, path: &Path) -> Result<(), SaveLockfileError> {
        let yaml = serde_yaml::to_string(self).map_err(SaveLockfileError::SerializeYaml)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|error| SaveLockfileError::CreateDir { dir: dir.to_path_buf(), error })?;
        }
        fs::write(path, yaml)
            .map_err(|error| SaveLockfileError::WriteFile { path: path.to_path_buf(), error })
    }

    pub fn save_wanted(&self, project_dir: &Path) -> Result<(), SaveLockfileError> {
        self.save_to_path(&project_dir.join(Lockfile::FILE_NAME))
    }

    pub fn save_current(&self, modules_dir: &Path) -> Result<(), SaveLockfileError> {
        self.save_to_path(&modules_dir.join(Lockfile::CURRENT_FILE_NAME))
    }
}
