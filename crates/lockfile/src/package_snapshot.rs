use crate::{dependency_path, LockfileResolution};
use knit_package_manifest::{BundleDependencies, Dependencies, Engines, PackageManifest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entry of the `packages` map.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSnapshot {
    pub resolution: LockfileResolution,
    /// Package id, present only when it differs from the absolute dependency path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_dependencies: Option<Dependencies>,
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

    /// `Some(true)` for packages only reachable from dev dependencies,
    /// `Some(false)` for packages only reachable from production dependencies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

impl PackageSnapshot {
    /// A snapshot with only a resolution.
    pub fn new(resolution: LockfileResolution) -> Self {
        PackageSnapshot {
            resolution,
            id: None,
            name: None,
            version: None,
            dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            peer_dependencies: None,
            bundled_dependencies: None,
            engines: None,
            os: None,
            cpu: None,
            deprecated: None,
            dev: None,
            optional: None,
        }
    }

    /// Whether the package is installed only as an optional dependency.
    pub fn is_optional(&self) -> bool {
        self.optional == Some(true)
    }

    /// Union of regular and optional dependencies, optional ones taking precedence.
    pub fn resolved_dependencies(&self) -> BTreeMap<String, String> {
        self.dependencies
            .iter()
            .chain(&self.optional_dependencies)
            .map(|(name, reference)| (name.clone(), reference.clone()))
            .collect()
    }

    /// Reconstruct the manifest fields the lockfile keeps, so the package doesn't have to be fetched
    /// to learn about its dependencies.
    ///
    /// Name and version come from the snapshot itself when present, from `relative_path` otherwise.
    pub fn to_manifest(&self, relative_path: &str) -> PackageManifest {
        let (name, version) = match (&self.name, &self.version) {
            (Some(name), Some(version)) => (name.clone(), version.clone()),
            _ => match dependency_path::parse(relative_path) {
                Ok(parsed) => (
                    parsed.name.unwrap_or_default().to_string(),
                    parsed.version.unwrap_or_default().to_string(),
                ),
                Err(_) => Default::default(),
            },
        };
        PackageManifest {
            name,
            version,
            dependencies: self.dependencies.clone(),
            optional_dependencies: self.optional_dependencies.clone(),
            peer_dependencies: self.peer_dependencies.clone().unwrap_or_default(),
            bundled_dependencies: self.bundled_dependencies.clone(),
            engines: self.engines.clone(),
            os: self.os.clone(),
            cpu: self.cpu.clone(),
            deprecated: self.deprecated.clone(),
            ..PackageManifest::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DirectoryResolution, RegistryResolution};
    use pretty_assertions::assert_eq;
    use text_block_macros::text_block;

    fn integrity() -> ssri::Integrity {
        "sha512-gf6ZldcfCDyNXPRiW3lQjEP1Z9rrUM/4Cn7BZbv3SdTA82zxWRP8OmLwvGR974uuENhGCFgFdN11z3n1Ofpprg=="
            .parse()
            .unwrap()
    }

    #[test]
    fn deserialize_minimal_and_full() {
        eprintln!("CASE: minimal");
        let yaml = text_block! {
            "resolution:"
            "  integrity: sha512-gf6ZldcfCDyNXPRiW3lQjEP1Z9rrUM/4Cn7BZbv3SdTA82zxWRP8OmLwvGR974uuENhGCFgFdN11z3n1Ofpprg=="
        };
        let received: PackageSnapshot = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(received, PackageSnapshot::new(RegistryResolution { integrity: integrity() }.into()));

        eprintln!("CASE: with dependencies and flags");
        let yaml = text_block! {
            "resolution:"
            "  integrity: sha512-gf6ZldcfCDyNXPRiW3lQjEP1Z9rrUM/4Cn7BZbv3SdTA82zxWRP8OmLwvGR974uuENhGCFgFdN11z3n1Ofpprg=="
            "dependencies:"
            "  bar: 1.0.0"
            "optionalDependencies:"
            "  baz: 2.0.0"
            "peerDependencies:"
            "  react: ^16.0.0"
            "os:"
            "  - darwin"
            "dev: true"
            "optional: true"
        };
        let received: PackageSnapshot = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(received.dependencies.get("bar").map(String::as_str), Some("1.0.0"));
        assert_eq!(received.os, Some(vec!["darwin".to_string()]));
        assert_eq!(received.dev, Some(true));
        assert!(received.is_optional());
        assert_eq!(
            received.resolved_dependencies().into_iter().collect::<Vec<_>>(),
            [("bar".to_string(), "1.0.0".to_string()), ("baz".to_string(), "2.0.0".to_string())],
        );
    }

    #[test]
    fn serialize_skips_empty_fields() {
        let mut snapshot = PackageSnapshot::new(DirectoryResolution { directory: "../foo".to_string() }.into());
        snapshot.name = Some("foo".to_string());
        snapshot.version = Some("1.0.0".to_string());
        snapshot.optional = Some(true);
        let received = serde_yaml::to_string(&snapshot).unwrap();
        let expected = text_block! {
            "resolution:"
            "  type: directory"
            "  directory: ../foo"
            "name: foo"
            "version: 1.0.0"
            "optional: true"
        };
        assert_eq!(received.trim(), expected);
    }

    #[test]
    fn manifest_from_relative_path() {
        let mut snapshot = PackageSnapshot::new(RegistryResolution { integrity: integrity() }.into());
        snapshot.dependencies.insert("bar".to_string(), "1.0.0".to_string());
        snapshot.peer_dependencies =
            Some([("react".to_string(), "^16.0.0".to_string())].into_iter().collect());

        let manifest = snapshot.to_manifest("/@knit/foo/1.2.3");
        assert_eq!((manifest.name.as_str(), manifest.version.as_str()), ("@knit/foo", "1.2.3"));
        assert_eq!(manifest.dependencies, snapshot.dependencies);
        assert_eq!(manifest.peer_dependencies.get("react").map(String::as_str), Some("^16.0.0"));
    }

    #[test]
    fn manifest_prefers_snapshot_name() {
        let mut snapshot = PackageSnapshot::new(DirectoryResolution { directory: "../foo".to_string() }.into());
        snapshot.name = Some("foo".to_string());
        snapshot.version = Some("0.1.0".to_string());
        let manifest = snapshot.to_manifest("file:../foo");
        assert_eq!((manifest.name.as_str(), manifest.version.as_str()), ("foo", "0.1.0"));
    }
}
