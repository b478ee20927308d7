pub mod dependency_path;

mod filter;
mod load_lockfile;
mod package_snapshot;
mod prune;
mod resolution;
mod save_lockfile;
mod uri_component;

pub use filter::LockfileFilter;
pub use load_lockfile::LoadLockfileError;
pub use package_snapshot::PackageSnapshot;
pub use resolution::{
    registry_tarball_url, DirectoryResolution, GitResolution, LockfileResolution,
    RegistryResolution, TarballResolution, TarballUrlError,
};
pub use save_lockfile::SaveLockfileError;
pub use uri_component::{decode_uri_component, encode_uri_component};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Map of package name to lockfile reference.
pub type ResolvedDependencies = BTreeMap<String, String>;

/// Content of a lockfile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub lockfile_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile_minor_version: Option<u32>,
    /// Registry that relative dependency paths are relative to.
    pub registry: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub specifiers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: ResolvedDependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: ResolvedDependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: ResolvedDependencies,
    /// Keyed by relative dependency path (or absolute one for foreign packages).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, PackageSnapshot>,
}

impl Lockfile {
    /// Base file name of a wanted lockfile.
    pub const FILE_NAME: &str = "knit-lock.yaml";
    /// Base file name of the lockfile describing `node_modules`, stored inside the modules dir.
    pub const CURRENT_FILE_NAME: &str = ".knit-lock.yaml";
    /// Lockfile version written by this crate.
    pub const VERSION: u32 = 3;
    pub const MINOR_VERSION: u32 = 1;

    /// An empty lockfile for `registry`.
    pub fn new(registry: impl Into<String>) -> Self {
        Lockfile {
            lockfile_version: Lockfile::VERSION,
            lockfile_minor_version: Some(Lockfile::MINOR_VERSION),
            registry: registry.into(),
            specifiers: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            packages: BTreeMap::new(),
        }
    }

    /// Whether the snapshots carry enough manifest fields to resolve dependencies without fetching manifests.
    pub fn has_manifest_info(&self) -> bool {
        (self.lockfile_version, self.lockfile_minor_version.unwrap_or(0))
            >= (Lockfile::VERSION, Lockfile::MINOR_VERSION)
    }

    /// Union of the three root dependency maps. Later groups win.
    pub fn root_dependencies(&self) -> ResolvedDependencies {
        self.dev_dependencies
            .iter()
            .chain(&self.dependencies)
            .chain(&self.optional_dependencies)
            .map(|(name, reference)| (name.clone(), reference.clone()))
            .collect()
    }

    /// Snapshot of the package a root dependency or snapshot dependency refers to.
    pub fn snapshot_by_ref(&self, reference: &str, pkg_name: &str) -> Option<(String, &'_ PackageSnapshot)> {
        let relative_path = dependency_path::ref_to_relative(reference, pkg_name)?;
        let snapshot = self.packages.get(&relative_path)?;
        Some((relative_path, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use text_block_macros::text_block;

    #[test]
    fn new_lockfile_serialization() {
        let lockfile = Lockfile::new("https://registry.npmjs.org/");
        let received = serde_yaml::to_string(&lockfile).unwrap();
        assert_snapshot!(received, @r###"
        lockfileVersion: 3
        lockfileMinorVersion: 1
        registry: https://registry.npmjs.org/
        "###);
    }

    #[test]
    fn manifest_info_depends_on_version() {
        let mut lockfile = Lockfile::new("https://registry.npmjs.org/");
        assert!(lockfile.has_manifest_info());
        lockfile.lockfile_minor_version = None;
        assert!(!lockfile.has_manifest_info());
        lockfile.lockfile_version = 4;
        assert!(lockfile.has_manifest_info());
    }

    #[test]
    fn root_dependencies_and_lookup() {
        let yaml = text_block! {
            "lockfileVersion: 3"
            "registry: https://registry.npmjs.org/"
            "dependencies:"
            "  foo: 1.0.0"
            "devDependencies:"
            "  bar: /qar/2.0.0"
            "optionalDependencies:"
            "  foo: 1.1.0"
            "packages:"
            "  /foo/1.1.0:"
            "    resolution:"
            "      tarball: file:foo-1.1.0.tgz"
            "  /qar/2.0.0:"
            "    resolution:"
            "      tarball: file:qar-2.0.0.tgz"
        };
        let lockfile: Lockfile = serde_yaml::from_str(yaml).unwrap();
        let roots = lockfile.root_dependencies();
        assert_eq!(roots.get("foo").map(String::as_str), Some("1.1.0"));
        assert_eq!(roots.get("bar").map(String::as_str), Some("/qar/2.0.0"));

        let (path, _) = lockfile.snapshot_by_ref("/qar/2.0.0", "bar").unwrap();
        assert_eq!(path, "/qar/2.0.0");
        assert!(lockfile.snapshot_by_ref("1.0.0", "foo").is_none());
        assert!(lockfile.snapshot_by_ref("link:../foo", "foo").is_none());
    }
}
