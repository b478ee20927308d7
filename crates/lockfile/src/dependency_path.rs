//! Codec between registry-relative dependency paths (`/foo/1.0.0`) and absolute package ids
//! (`registry.npmjs.org/foo/1.0.0`).

use crate::{uri_component::encode_uri_component, LockfileResolution};
use derive_more::{Display, Error};
use miette::Diagnostic;
use node_semver::Version;

/// Whether `path` is an absolute dependency path, i.e. one that carries its own host.
pub fn is_absolute(path: &str) -> bool {
    !path.starts_with('/')
}

/// Host of a registry URL as used in absolute dependency paths, e.g. `localhost+4873`.
pub fn encode_registry(registry: &str) -> String {
    let Ok(url) = url::Url::parse(registry) else { return registry.to_string() };
    let Some(host) = url.host_str() else { return registry.to_string() };
    match url.port() {
        Some(port) => format!("{host}+{port}"),
        None => host.to_string(),
    }
}

/// Turn a relative dependency path into an absolute one.
pub fn resolve(registry: &str, path: &str) -> String {
    if is_absolute(path) {
        return path.to_string();
    }
    format!("{}{path}", encode_registry(registry))
}

/// Turn an absolute dependency path into a relative one when it belongs to `registry`.
pub fn relative<'a>(registry: &str, absolute_path: &'a str) -> &'a str {
    let registry_name = encode_registry(registry);
    let belongs_to_registry = absolute_path
        .strip_prefix(registry_name.as_str())
        .is_some_and(|rest| rest.starts_with('/'));
    if belongs_to_registry && !absolute_path.contains("/-/") {
        return &absolute_path[registry_name.len()..];
    }
    absolute_path
}

/// Whether `reference` is a version, optionally followed by a peers folder: `1.0.0/p@2.1.0`.
fn is_version_reference(reference: &str) -> bool {
    let version = reference.split('/').next().unwrap_or(reference);
    !reference.starts_with("file:") && Version::parse(version).is_ok()
}

/// Relative dependency path of a lockfile reference. `None` for linked packages.
pub fn ref_to_relative(reference: &str, pkg_name: &str) -> Option<String> {
    if reference.starts_with("link:") {
        return None;
    }
    if reference.starts_with("file:") || (reference.contains('/') && !is_version_reference(reference)) {
        return Some(reference.to_string());
    }
    Some(format!("/{pkg_name}/{reference}"))
}

/// Absolute dependency path of a lockfile reference. `None` for linked packages.
pub fn ref_to_absolute(reference: &str, pkg_name: &str, registry: &str) -> Option<String> {
    if reference.starts_with("link:") {
        return None;
    }
    if !reference.contains('/') || is_version_reference(reference) {
        return Some(resolve(registry, &format!("/{pkg_name}/{reference}")));
    }
    if reference.starts_with('/') {
        return Some(resolve(registry, reference));
    }
    Some(reference.to_string())
}

/// Shortest reference of a resolved package for the root maps and the `dependencies` of snapshots.
///
/// Registry packages are written as their version (with a peer suffix, if any). Everything else
/// keeps its relative path, or the absolute path if it can't be made relative.
pub fn absolute_path_to_ref(
    absolute_path: &str,
    pkg_name: &str,
    resolution: &LockfileResolution,
    registry: &str,
) -> String {
    if resolution.is_typed() {
        return absolute_path.to_string();
    }
    let registry = match resolution {
        LockfileResolution::Tarball(tarball) => tarball.registry.as_deref().unwrap_or(registry),
        _ => registry,
    };
    let relative_path = relative(registry, absolute_path);
    if is_absolute(relative_path) {
        return absolute_path.to_string();
    }
    relative_path
        .strip_prefix('/')
        .and_then(|rest| rest.strip_prefix(pkg_name))
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(relative_path)
        .to_string()
}

/// Directory name of a package inside the modules dir, without the leading `.`.
pub fn pkg_id_to_filename(pkg_id: &str) -> String {
    match pkg_id.strip_prefix("file:") {
        Some(local) => format!("local/{}", encode_uri_component(local)),
        None => pkg_id.replace(':', "+"),
    }
}

/// Components of a dependency path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDependencyPath<'a> {
    pub is_absolute: bool,
    pub host: Option<&'a str>,
    pub name: Option<&'a str>,
    /// Only set when the version segment is valid semver.
    pub version: Option<&'a str>,
}

/// Error when parsing a relative dependency path.
#[derive(Debug, Display, Error, Diagnostic)]
#[display("{path} is an invalid relative dependency path")]
#[diagnostic(code(knit_lockfile::invalid_dependency_path))]
pub struct ParseDependencyPathError {
    #[error(not(source))]
    pub path: String,
}

/// Split a dependency path into host, package name and version.
pub fn parse(path: &str) -> Result<ParsedDependencyPath<'_>, ParseDependencyPathError> {
    let is_absolute = is_absolute(path);
    let (host, rest) = if is_absolute {
        match path.split_once('/') {
            Some((host, rest)) => (Some(host), rest),
            None => (Some(path), ""),
        }
    } else {
        (None, &path[1..])
    };

    let name_end = if rest.starts_with('@') {
        rest.match_indices('/').nth(1).map(|(index, _)| index)
    } else {
        rest.find('/')
    };
    let (name, after_name) = match name_end {
        Some(index) => (&rest[..index], &rest[index + 1..]),
        None => (rest, ""),
    };
    let version = after_name.split('/').next().filter(|version| !version.is_empty());

    if let Some(version) = version.filter(|version| Version::parse(version).is_ok()) {
        return Ok(ParsedDependencyPath { is_absolute, host, name: Some(name), version: Some(version) });
    }
    if !is_absolute {
        return Err(ParseDependencyPathError { path: path.to_string() });
    }
    Ok(ParsedDependencyPath { is_absolute, host, name: None, version: None })
}
