mod pkg_name;
mod wanted_dependency;

pub use pkg_name::{pkg_scope, unscoped_pkg_name};
pub use wanted_dependency::WantedDependency;

use derive_more::{Display, Error};
use miette::Diagnostic;
use pipe_trait::Pipe;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use strum::IntoStaticStr;

/// Map of dependency names to version specifiers.
pub type Dependencies = BTreeMap<String, String>;

#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum PackageManifestError {
    #[display("No package.json was found at {_0:?}")]
    #[diagnostic(code(knit_package_manifest::no_importer_manifest_found))]
    NoImporterManifestFound(#[error(not(source))] PathBuf),

    #[display("Failed to read {path:?}: {error}")]
    #[diagnostic(code(knit_package_manifest::read_file))]
    ReadFile {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[display("Failed to parse {path:?}: {error}")]
    #[diagnostic(code(knit_package_manifest::parse_json))]
    ParseJson {
        path: PathBuf,
        #[error(source)]
        error: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum DependencyGroup {
    #[strum(serialize = "dependencies")]
    Prod,
    #[strum(serialize = "devDependencies")]
    Dev,
    #[strum(serialize = "optionalDependencies")]
    Optional,
    #[strum(serialize = "peerDependencies")]
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BundleDependencies {
    Boolean(bool),
    List(Vec<String>),
}

/// Content of the `engines` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Engines {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npm: Option<String>,
}

/// Content of the `bin` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Bin {
    Single(String),
    Map(BTreeMap<String, String>),
}

/// Typed content of a `package.json` file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_dependencies: Option<BundleDependencies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundled_dependencies: Option<BundleDependencies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engines: Option<Engines>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Bin>,
}

impl PackageManifest {
    /// Read and parse a `package.json` file.
    pub fn from_path(path: &Path) -> Result<Self, PackageManifestError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return path.to_path_buf().pipe(PackageManifestError::NoImporterManifestFound).pipe(Err)
            }
            Err(error) => {
                return Err(PackageManifestError::ReadFile { path: path.to_path_buf(), error })
            }
        };
        serde_json::from_str(&content)
            .map_err(|error| PackageManifestError::ParseJson { path: path.to_path_buf(), error })
    }

    fn group(&self, group: DependencyGroup) -> &'_ Dependencies {
        match group {
            DependencyGroup::Prod => &self.dependencies,
            DependencyGroup::Dev => &self.dev_dependencies,
            DependencyGroup::Optional => &self.optional_dependencies,
            DependencyGroup::Peer => &self.peer_dependencies,
        }
    }

    /// Iterate `(name, specifier)` pairs of the chosen groups, in group order.
    pub fn dependencies<'a>(
        &'a self,
        groups: impl IntoIterator<Item = DependencyGroup> + 'a,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        groups
            .into_iter()
            .flat_map(|group| self.group(group))
            .map(|(name, spec)| (name.as_str(), spec.as_str()))
    }

    /// Dependencies requested by a project root.
    ///
    /// Later groups override earlier ones for the same name: `devDependencies`,
    /// then `dependencies`, then `optionalDependencies`.
    pub fn root_wanted_dependencies(&self) -> Vec<WantedDependency> {
        let mut merged = BTreeMap::<&str, &str>::new();
        merged.extend(self.dependencies([
            DependencyGroup::Dev,
            DependencyGroup::Prod,
            DependencyGroup::Optional,
        ]));
        merged
            .into_iter()
            .map(|(alias, pref)| {
                WantedDependency::new(
                    alias,
                    pref,
                    self.dev_dependencies.contains_key(alias),
                    self.optional_dependencies.contains_key(alias),
                )
            })
            .collect()
    }

    /// Dependencies of an installed package: regular and optional ones, minus the bundled ones.
    pub fn package_wanted_dependencies(&self) -> Vec<WantedDependency> {
        let bundled = self.bundled_dependencies();
        let mut merged = BTreeMap::<&str, &str>::new();
        merged.extend(self.dependencies([DependencyGroup::Optional, DependencyGroup::Prod]));
        merged
            .into_iter()
            .filter(|(alias, _)| !bundled.contains(alias))
            .map(|(alias, pref)| {
                WantedDependency::new(
                    alias,
                    pref,
                    false,
                    self.optional_dependencies.contains_key(alias),
                )
            })
            .collect()
    }

    /// Names of dependencies shipped inside the package tarball.
    ///
    /// `bundleDependencies: true` bundles every regular dependency.
    pub fn bundled_dependencies(&self) -> Vec<&'_ str> {
        match self.bundle_dependencies.as_ref().or(self.bundled_dependencies.as_ref()) {
            Some(BundleDependencies::List(list)) => list.iter().map(String::as_str).collect(),
            Some(BundleDependencies::Boolean(true)) => {
                self.dependencies.keys().map(String::as_str).collect()
            }
            Some(BundleDependencies::Boolean(false)) | None => Vec::new(),
        }
    }

    pub fn has_bundled_dependencies(&self) -> bool {
        !matches!(
            self.bundle_dependencies.as_ref().or(self.bundled_dependencies.as_ref()),
            None | Some(BundleDependencies::Boolean(false))
        )
    }

    /// Peer dependencies that the package doesn't also list as a regular or optional dependency.
    pub fn peer_dependencies_without_own(&self) -> Dependencies {
        self.peer_dependencies
            .iter()
            .filter(|(name, _)| {
                !self.dependencies.contains_key(*name)
                    && !self.optional_dependencies.contains_key(*name)
            })
            .map(|(name, range)| (name.clone(), range.clone()))
            .collect()
    }

    /// `(command, relative path)` pairs of the executables the package provides.
    pub fn bins(&self) -> Vec<(String, String)> {
        match &self.bin {
            None => Vec::new(),
            Some(Bin::Single(path)) => vec![(unscoped_pkg_name(&self.name).to_string(), path.clone())],
            Some(Bin::Map(map)) => {
                map.iter().map(|(command, path)| (command.clone(), path.clone())).collect()
            }
        }
    }
}
