mod check_compatibility;

pub use check_compatibility::{CompatibilityError, CompatibilityOptions};

use derive_more::{Display, Error};
use miette::Diagnostic;
use pipe_trait::Pipe;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

/// Version of the `node_modules` layout created by this crate's consumers.
pub const LAYOUT_VERSION: u32 = 1;

/// State of a `node_modules` directory, stored in `node_modules/.modules.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Modules {
    pub layout_version: u32,
    /// Store the packages were linked from.
    pub store: String,
    #[serde(default)]
    pub independent_leaves: bool,
    #[serde(default)]
    pub shamefully_flatten: bool,
    /// Ids of the packages that were resolved but not installed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_builds: Vec<String>,
    /// Alias each flattened package got in the root modules directory.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flattened_aliases_by_id: BTreeMap<String, String>,
}

/// Error when reading `.modules.yaml`.
#[derive(Debug, Display, Error, Diagnostic)]
pub enum ReadModulesError {
    #[display("Failed to read {path:?}: {error}")]
    #[diagnostic(code(knit_modules_yaml::read_file))]
    ReadFile {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to parse {path:?} as YAML: {error}")]
    #[diagnostic(code(knit_modules_yaml::parse_yaml))]
    ParseYaml {
        path: PathBuf,
        #[error(source)]
        error: serde_yaml::Error,
    },
}

/// Error when writing `.modules.yaml`.
#[derive(Debug, Display, Error, Diagnostic)]
pub enum WriteModulesError {
    #[display("Failed to serialize modules state: {_0}")]
    #[diagnostic(code(knit_modules_yaml::serialize_yaml))]
    SerializeYaml(#[error(source)] serde_yaml::Error),

    #[display("Failed to create directory at {dir:?}: {error}")]
    #[diagnostic(code(knit_modules_yaml::create_dir))]
    CreateDir {
        dir: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to write {path:?}: {error}")]
    #[diagnostic(code(knit_modules_yaml::write_file))]
    WriteFile {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

impl Modules {
    pub const FILE_NAME: &str = ".modules.yaml";

    /// State of a freshly created `node_modules`.
    pub fn new(store: impl Into<String>, independent_leaves: bool, shamefully_flatten: bool) -> Self {
        Modules {
            layout_version: LAYOUT_VERSION,
            store: store.into(),
            independent_leaves,
            shamefully_flatten,
            skipped: Vec::new(),
            pending_builds: Vec::new(),
            flattened_aliases_by_id: BTreeMap::new(),
        }
    }

    /// Read the state of `modules_dir`. `None` if it was never written.
    pub fn read(modules_dir: &Path) -> Result<Option<Self>, ReadModulesError> {
        let path = modules_dir.join(Modules::FILE_NAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return ReadModulesError::ReadFile { path, error }.pipe(Err),
        };
        content
            .pipe_as_ref(serde_yaml::from_str)
            .map(Some)
            .map_err(|error| ReadModulesError::ParseYaml { path, error })
    }

    pub fn write(&self, modules_dir: &Path) -> Result<(), WriteModulesError> {
        let yaml = serde_yaml::to_string(self).map_err(WriteModulesError::SerializeYaml)?;
        fs::create_dir_all(modules_dir).map_err(|error| WriteModulesError::CreateDir {
            dir: modules_dir.to_path_buf(),
            error,
        })?;
        let path = modules_dir.join(Modules::FILE_NAME);
        fs::write(&path, yaml).map_err(|error| WriteModulesError::WriteFile { path, error })
    }
}
