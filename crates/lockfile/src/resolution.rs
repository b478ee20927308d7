use crate::dependency_path;
use derive_more::{Display, Error, From, TryInto};
use knit_package_manifest::unscoped_pkg_name;
use miette::Diagnostic;
use pipe_trait::Pipe;
use serde::{Deserialize, Serialize};
use ssri::Integrity;

/// For tarball hosted remotely or locally.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TarballResolution {
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
    /// Registry the tarball was resolved from, when it is not the default one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

/// For a package of the lockfile's registry, whose tarball URL can be derived from the dependency path.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RegistryResolution {
    pub integrity: Integrity,
}

/// For local directory on a filesystem.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DirectoryResolution {
    pub directory: String,
}

/// For git repository.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GitResolution {
    pub repo: String,
    pub commit: String,
}

/// Where the content of a package comes from.
///
/// The store hands out [`LockfileResolution::Tarball`], [`LockfileResolution::Directory`],
/// or [`LockfileResolution::Git`]. The lockfile additionally uses the shorter
/// [`LockfileResolution::Registry`] form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From, TryInto)]
#[serde(from = "ResolutionSerde", into = "ResolutionSerde")]
pub enum LockfileResolution {
    Tarball(TarballResolution),
    Registry(RegistryResolution),
    Directory(DirectoryResolution),
    Git(GitResolution),
}

/// Error when a lockfile resolution can't be turned back into something the store can fetch.
#[derive(Debug, Display, Error, Diagnostic)]
#[display("Couldn't get tarball URL from dependency path {dependency_path}")]
#[diagnostic(code(knit_lockfile::tarball_url))]
pub struct TarballUrlError {
    #[error(not(source))]
    pub dependency_path: String,
}

impl LockfileResolution {
    /// Get the integrity field if available.
    pub fn integrity(&self) -> Option<&'_ Integrity> {
        match self {
            LockfileResolution::Tarball(resolution) => resolution.integrity.as_ref(),
            LockfileResolution::Registry(resolution) => resolution.integrity.pipe_ref(Some),
            LockfileResolution::Directory(_) | LockfileResolution::Git(_) => None,
        }
    }

    /// Whether the resolution carries a `type` tag in the lockfile.
    pub fn is_typed(&self) -> bool {
        matches!(self, LockfileResolution::Directory(_) | LockfileResolution::Git(_))
    }

    /// Shorten a resolution for storage in the lockfile.
    ///
    /// Tarballs served from the standard `/-/` location collapse to their integrity alone.
    /// Other tarballs keep a registry-relative URL.
    pub fn to_lockfile(&self, dependency_path: &str, registry: &str) -> LockfileResolution {
        if dependency_path::is_absolute(dependency_path) || self.is_typed() {
            return self.clone();
        }
        let LockfileResolution::Tarball(TarballResolution { tarball, integrity: Some(integrity), .. }) =
            self
        else {
            return self.clone();
        };
        if tarball.contains("/-/") {
            return RegistryResolution { integrity: integrity.clone() }.into();
        }
        TarballResolution {
            tarball: relative_tarball(tarball, registry).to_string(),
            integrity: Some(integrity.clone()),
            registry: None,
        }
        .into()
    }

    /// Expand a lockfile resolution back into a fetchable one.
    pub fn to_fetchable(
        &self,
        relative_path: &str,
        registry: &str,
    ) -> Result<LockfileResolution, TarballUrlError> {
        match self {
            LockfileResolution::Directory(_) | LockfileResolution::Git(_) => Ok(self.clone()),
            LockfileResolution::Registry(RegistryResolution { integrity }) => {
                let parsed = dependency_path::parse(relative_path).ok();
                let (Some(name), Some(version)) = parsed
                    .map(|parsed| (parsed.name, parsed.version))
                    .unwrap_or_default()
                else {
                    return Err(TarballUrlError { dependency_path: relative_path.to_string() });
                };
                Ok(TarballResolution {
                    tarball: registry_tarball_url(registry, name, version),
                    integrity: Some(integrity.clone()),
                    registry: Some(registry.to_string()),
                }
                .into())
            }
            LockfileResolution::Tarball(resolution) if resolution.tarball.starts_with("file:") => {
                Ok(self.clone())
            }
            LockfileResolution::Tarball(resolution) => Ok(TarballResolution {
                tarball: resolve_url(registry, &resolution.tarball),
                ..resolution.clone()
            }
            .into()),
        }
    }
}

/// URL of a package tarball in a npm-compatible registry.
pub fn registry_tarball_url(registry: &str, name: &str, version: &str) -> String {
    let registry = registry.trim_end_matches('/');
    let unscoped = unscoped_pkg_name(name);
    format!("{registry}/{name}/-/{unscoped}-{version}.tgz")
}

fn relative_tarball<'a>(tarball: &'a str, registry: &str) -> &'a str {
    match tarball.strip_prefix(registry) {
        Some(_) if !registry.is_empty() => &tarball[registry.len() - 1..],
        _ => tarball,
    }
}

fn resolve_url(base: &str, reference: &str) -> String {
    url::Url::parse(base)
        .and_then(|base| base.join(reference))
        .map(String::from)
        .unwrap_or_else(|_| reference.to_string())
}

/// Intermediate helper type for serde.
#[derive(Deserialize, Serialize, From, TryInto)]
#[serde(tag = "type", rename_all = "camelCase")]
enum TaggedResolution {
    Directory(DirectoryResolution),
    Git(GitResolution),
}

/// Intermediate helper type for serde.
#[derive(Deserialize, Serialize, From, TryInto)]
#[serde(untagged)]
enum ResolutionSerde {
    Tarball(TarballResolution),
    Registry(RegistryResolution),
    Tagged(TaggedResolution),
}

impl From<ResolutionSerde> for LockfileResolution {
    fn from(value: ResolutionSerde) -> Self {
        match value {
            ResolutionSerde::Tarball(resolution) => resolution.into(),
            ResolutionSerde::Registry(resolution) => resolution.into(),
            ResolutionSerde::Tagged(TaggedResolution::Directory(resolution)) => resolution.into(),
            ResolutionSerde::Tagged(TaggedResolution::Git(resolution)) => resolution.into(),
        }
    }
}

impl From<LockfileResolution> for ResolutionSerde {
    fn from(value: LockfileResolution) -> Self {
        match value {
            LockfileResolution::Tarball(resolution) => resolution.into(),
            LockfileResolution::Registry(resolution) => resolution.into(),
            LockfileResolution::Directory(resolution) => {
                resolution.pipe(TaggedResolution::from).into()
            }
            LockfileResolution::Git(resolution) => resolution.pipe(TaggedResolution::from).into(),
        }
    }
}
