use derive_more::{Display, Error};
use knit_package_manifest::PackageManifest;
use miette::Diagnostic;
use node_semver::{Range, Version};
use std::env;

/// Operating system and CPU architecture, in the names `package.json` uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub cpu: String,
}

impl Platform {
    /// The platform this process runs on.
    pub fn current() -> Self {
        let os = match env::consts::OS {
            "macos" => "darwin",
            "windows" => "win32",
            os => os,
        };
        let cpu = match env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            "x86" => "ia32",
            arch => arch,
        };
        Platform { os: os.to_string(), cpu: cpu.to_string() }
    }

    /// Key of engine-specific side effects caches, e.g. `linux-x64-node-v18`.
    pub fn engine_name(&self, node_version: &str) -> Option<String> {
        let major = node_version.trim_start_matches('v').split('.').next()?;
        (!major.is_empty()).then(|| format!("{}-{}-node-v{major}", self.os, self.cpu))
    }
}

/// Why a package can't be installed here.
#[derive(Debug, Display, Error, Diagnostic)]
pub enum InstallabilityError {
    #[display("Unsupported platform for {pkg_id}: wanted {{\"os\":{wanted_os:?},\"cpu\":{wanted_cpu:?}}} (current: {{\"os\":{current_os:?},\"cpu\":{current_cpu:?}}})")]
    #[diagnostic(code(knit_package_manager::unsupported_platform))]
    UnsupportedPlatform {
        pkg_id: String,
        wanted_os: Vec<String>,
        wanted_cpu: Vec<String>,
        current_os: String,
        current_cpu: String,
    },

    #[display("Unsupported engine for {pkg_id}: wanted node {wanted} (current: {current})")]
    #[diagnostic(code(knit_package_manager::unsupported_engine))]
    UnsupportedEngine { pkg_id: String, wanted: String, current: String },
}

/// Whether `current` is accepted by a `package.json` `os` or `cpu` list.
///
/// Entries starting with `!` exclude a value. An empty list or `any` accepts everything.
fn is_allowed(list: &[String], current: &str) -> bool {
    if list.is_empty() || list.iter().any(|entry| entry == "any") {
        return true;
    }
    let mut has_positive = false;
    for entry in list {
        match entry.strip_prefix('!') {
            Some(excluded) if excluded == current => return false,
            Some(_) => {}
            None if entry == current => return true,
            None => has_positive = true,
        }
    }
    !has_positive
}

/// Check the `os` and `cpu` fields of a package against a platform.
pub fn check_platform(
    pkg_id: &str,
    manifest: &PackageManifest,
    platform: &Platform,
) -> Result<(), InstallabilityError> {
    let wanted_os = manifest.os.clone().unwrap_or_default();
    let wanted_cpu = manifest.cpu.clone().unwrap_or_default();
    if is_allowed(&wanted_os, &platform.os) && is_allowed(&wanted_cpu, &platform.cpu) {
        return Ok(());
    }
    Err(InstallabilityError::UnsupportedPlatform {
        pkg_id: pkg_id.to_string(),
        wanted_os,
        wanted_cpu,
        current_os: platform.os.clone(),
        current_cpu: platform.cpu.clone(),
    })
}

/// Check `engines.node` of a package against a Node.js version.
///
/// Unparsable versions or ranges are not reported.
pub fn check_engine(
    pkg_id: &str,
    manifest: &PackageManifest,
    node_version: Option<&str>,
) -> Result<(), InstallabilityError> {
    let Some(wanted) = manifest.engines.as_ref().and_then(|engines| engines.node.as_deref()) else {
        return Ok(());
    };
    let Some(current) = node_version else { return Ok(()) };
    let (Ok(version), Ok(range)) =
        (current.trim_start_matches('v').parse::<Version>(), wanted.parse::<Range>())
    else {
        return Ok(());
    };
    if version.satisfies(&range) {
        return Ok(());
    }
    Err(InstallabilityError::UnsupportedEngine {
        pkg_id: pkg_id.to_string(),
        wanted: wanted.to_string(),
        current: current.to_string(),
    })
}

/// Options of [`is_installable`].
#[derive(Debug, Clone, Copy)]
pub struct InstallabilityOptions<'a> {
    pub platform: &'a Platform,
    pub node_version: Option<&'a str>,
    pub engine_strict: bool,
    /// The package is requested as an optional dependency.
    pub optional: bool,
}

/// Decide whether a package should be installed on this machine.
///
/// Incompatible optional packages are skipped. Incompatible required packages are installed anyway
/// with a warning, unless `engine_strict` is set.
pub fn is_installable(
    pkg_id: &str,
    manifest: &PackageManifest,
    options: InstallabilityOptions<'_>,
) -> Result<bool, InstallabilityError> {
    let InstallabilityOptions { platform, node_version, engine_strict, optional } = options;
    let Err(error) = check_platform(pkg_id, manifest, platform)
        .and_then(|()| check_engine(pkg_id, manifest, node_version))
    else {
        return Ok(true);
    };
    tracing::warn!(target: "knit::resolve", %error, "Incompatible package");
    if optional {
        tracing::info!(target: "knit::resolve", pkg_id, "Skipping incompatible optional dependency");
        return Ok(false);
    }
    if engine_strict {
        return Err(error);
    }
    Ok(true)
}
