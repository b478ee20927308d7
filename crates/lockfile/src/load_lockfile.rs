use crate::Lockfile;
use derive_more::{Display, Error};
use miette::Diagnostic;
use pipe_trait::Pipe;
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

/// Error when reading lockfile the filesystem.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum LoadLockfileError {
    #[display("Failed to read lockfile content from {path:?}: {error}")]
    #[diagnostic(code(knit_lockfile::read_file))]
    ReadFile {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to parse lockfile content of {path:?} as YAML: {error}")]
    #[diagnostic(code(knit_lockfile::parse_yaml))]
    ParseYaml {
        path: PathBuf,
        #[error(source)]
        error: serde_yaml::Error,
    },
}

impl Lockfile {
    /// Load a lockfile from a file. `None` if the file doesn't exist.
    pub fn load_from_path(path: &Path) -> Result<Option<Self>, LoadLockfileError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return LoadLockfileError::ReadFile { path: path.to_path_buf(), error }.pipe(Err)
            }
        };
        content
            .pipe_as_ref(serde_yaml::from_str)
            .map(Some)
            .map_err(|error| LoadLockfileError::ParseYaml { path: path.to_path_buf(), error })
    }

    /// Load the wanted lockfile of a project.
    pub fn load_wanted(project_dir: &Path) -> Result<Option<Self>, LoadLockfileError> {
        project_dir.join(Lockfile::FILE_NAME).pipe_ref(|path| Lockfile::load_from_path(path))
    }

    /// Load the lockfile that describes the content of `modules_dir`.
    pub fn load_current(modules_dir: &Path) -> Result<Option<Self>, LoadLockfileError> {
        modules_dir.join(Lockfile::CURRENT_FILE_NAME).pipe_ref(|path| Lockfile::load_from_path(path))
    }
}
