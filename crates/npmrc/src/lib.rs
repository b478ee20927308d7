mod custom_deserializer;

use knit_package_manifest::pkg_scope;
use pipe_trait::Pipe;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
};

use crate::custom_deserializer::{
    bool_true, default_child_concurrency, default_link_concurrency, default_modules_dir,
    default_network_concurrency, default_registry, default_store_dir, deserialize_bool,
    deserialize_pathbuf, deserialize_registry, deserialize_u64, normalize_registry,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Npmrc {
    /// The base URL of the npm package registry (trailing slash included).
    #[serde(default = "default_registry", deserialize_with = "deserialize_registry")]
    pub registry: String,

    /// Registries of scoped packages, keyed by scope (e.g. `@babel`), read from `@scope:registry` keys.
    #[serde(skip)]
    pub scoped_registries: BTreeMap<String, String>,

    /// The location where all the packages are saved on the disk.
    #[serde(default = "default_store_dir", deserialize_with = "deserialize_pathbuf")]
    pub store_dir: PathBuf,

    /// The directory in which dependencies will be installed (instead of node_modules).
    #[serde(default = "default_modules_dir", deserialize_with = "deserialize_pathbuf")]
    pub modules_dir: PathBuf,

    /// How deep in the dependency tree packages are re-resolved instead of taken from the lockfile.
    #[serde(default, deserialize_with = "deserialize_u64")]
    pub depth: u64,

    /// Re-resolve and relink everything, ignoring what is already installed.
    #[serde(default, deserialize_with = "deserialize_bool")]
    pub force: bool,

    /// Resolve to the newest versions satisfying the specifiers, down to `depth`.
    #[serde(default, deserialize_with = "deserialize_bool")]
    pub update: bool,

    /// Install `dependencies`.
    #[serde(default = "bool_true", deserialize_with = "deserialize_bool")]
    pub production: bool,

    /// Install `devDependencies`.
    #[serde(default = "bool_true", deserialize_with = "deserialize_bool")]
    pub development: bool,

    /// Install `optionalDependencies`.
    #[serde(default = "bool_true", deserialize_with = "deserialize_bool")]
    pub optional: bool,

    /// Packages without dependencies are used in place from the store instead of being linked
    /// into the modules directory.
    #[serde(default, deserialize_with = "deserialize_bool")]
    pub independent_leaves: bool,

    /// Symlink every package of the graph into the root modules directory, creating a flat
    /// `node_modules` like npm's.
    #[serde(default, deserialize_with = "deserialize_bool")]
    pub shamefully_flatten: bool,

    /// Fail instead of warning when a required package doesn't support the current engine.
    #[serde(default, deserialize_with = "deserialize_bool")]
    pub engine_strict: bool,

    /// Use and save the results of build scripts in the store.
    #[serde(default, deserialize_with = "deserialize_bool")]
    pub side_effects_cache: bool,

    /// When set to false, knit won't read or generate a knit-lock.yaml file.
    #[serde(default = "bool_true", deserialize_with = "deserialize_bool")]
    pub lockfile: bool,

    #[serde(default = "default_child_concurrency", deserialize_with = "deserialize_u64")]
    pub child_concurrency: u64,

    #[serde(default = "default_network_concurrency", deserialize_with = "deserialize_u64")]
    pub network_concurrency: u64,

    /// Maximum number of packages linked at the same time.
    #[serde(default = "default_link_concurrency", deserialize_with = "deserialize_u64")]
    pub link_concurrency: u64,

    /// Compute what would change without touching `node_modules` or the store.
    #[serde(default, deserialize_with = "deserialize_bool")]
    pub dry_run: bool,

    /// Version of Node.js that installability checks and engine-specific caches are evaluated against.
    #[serde(default)]
    pub node_version: Option<String>,
}

impl Npmrc {
    pub fn new() -> Self {
        Npmrc::from_ini("").unwrap_or_else(|_| unreachable!("empty config always deserializes"))
    }

    /// Parse the content of a `.npmrc` file.
    pub fn from_ini(content: &str) -> Result<Self, serde_ini::de::Error> {
        let mut npmrc: Npmrc = serde_ini::from_str(content)?;
        npmrc.scoped_registries = serde_ini::from_str::<HashMap<String, String>>(content)?
            .into_iter()
            .filter_map(|(key, value)| {
                let scope = key.strip_suffix(":registry")?;
                scope.starts_with('@').then(|| (scope.to_string(), normalize_registry(&value)))
            })
            .collect();
        Ok(npmrc)
    }

    /// Registry to resolve a dependency from, given the alias it is imported as.
    pub fn registry_for(&self, alias: &str) -> &'_ str {
        pkg_scope(alias)
            .and_then(|scope| self.scoped_registries.get(scope))
            .map_or(self.registry.as_str(), String::as_str)
    }
}

impl Default for Npmrc {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the `.npmrc` of `project_dir`, or of the home directory when the project has none.
///
/// Missing or invalid files fall back to the defaults.
pub fn load_npmrc(project_dir: &Path) -> Npmrc {
    let candidates = [Some(project_dir.join(".npmrc")), home::home_dir().map(|dir| dir.join(".npmrc"))];
    for path in candidates.into_iter().flatten() {
        let Ok(content) = fs::read_to_string(&path) else { continue };
        match Npmrc::from_ini(&content) {
            Ok(npmrc) => return npmrc,
            Err(error) => {
                tracing::warn!(target: "knit::config", ?path, %error, "Ignoring invalid .npmrc");
            }
        }
    }

    Npmrc::new()
}

/// Load the `.npmrc` of the current directory.
pub fn get_current_npmrc() -> Npmrc {
    env::current_dir().unwrap_or_default().pipe_ref(|dir| load_npmrc(dir))
}
