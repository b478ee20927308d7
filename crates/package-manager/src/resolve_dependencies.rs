use crate::{
    is_installable, DependencyFlags, InstallabilityError, InstallabilityOptions, NodeId, Platform,
};
use async_recursion::async_recursion;
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use derive_more::{Display, Error};
use futures_util::future;
use knit_lockfile::{
    dependency_path, Lockfile, LockfileResolution, PackageSnapshot, ResolvedDependencies,
    TarballUrlError,
};
use knit_npmrc::Npmrc;
use knit_package_manifest::{
    BundleDependencies, Dependencies, Engines, PackageManifest, WantedDependency,
};
use knit_store_controller::{
    PackageFilesResponse, PackageResponse, RequestPackageOptions, SharedStoreError,
    StoreController, StoreError, StoreFuture,
};
use miette::Diagnostic;
use node_semver::{Range, Version};
use pipe_trait::Pipe;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
};

/// A package resolved during this run, one per package id.
#[derive(Clone)]
pub struct InstalledPackage {
    pub id: String,
    pub resolution: LockfileResolution,
    pub name: String,
    pub version: String,
    /// Merged over every dependency edge that resolved to this package.
    pub flags: DependencyFlags,
    /// Peer dependencies the package doesn't also depend on directly.
    pub peer_dependencies: Dependencies,
    pub optional_dependencies: BTreeSet<String>,
    pub bundled_dependencies: Option<BundleDependencies>,
    pub has_bundled_dependencies: bool,
    pub engines: Option<Engines>,
    pub os: Option<Vec<String>>,
    pub cpu: Option<Vec<String>>,
    pub deprecated: Option<String>,
    /// Unpacked content in the store.
    pub path: PathBuf,
    pub fetching_files: StoreFuture<PackageFilesResponse>,
    pub finishing: StoreFuture<()>,
    /// Build outputs of the current engine, if the store has them.
    pub engine_cache: Option<PathBuf>,
    /// Specifier as written in the manifest of the root project, for root dependencies.
    pub spec_raw: String,
}

/// One position in the dependency tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub node_id: NodeId,
    pub pkg_id: String,
    /// Child positions by alias.
    pub children: BTreeMap<String, NodeId>,
    pub depth: usize,
    pub installable: bool,
}

/// Where a wanted dependency landed in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgAddress {
    pub alias: String,
    pub node_id: NodeId,
    pub pkg_id: String,
    /// Only for root dependencies.
    pub normalized_pref: Option<String>,
}

/// A repeated occurrence of a package whose children are filled in by
/// [`ResolveContext::build_pending_trees`].
#[derive(Debug, Clone)]
pub struct PendingNode {
    pub alias: String,
    pub node_id: NodeId,
    pub pkg_id: String,
    pub depth: usize,
    pub installable: bool,
}

/// A root dependency on a local directory. Linked as is, never resolved further.
#[derive(Debug, Clone)]
pub struct LocalPackage {
    pub alias: String,
    pub id: String,
    pub spec_raw: String,
    pub name: String,
    pub version: String,
    pub dev: bool,
    pub optional: bool,
    pub resolution: LockfileResolution,
    pub directory: PathBuf,
    pub normalized_pref: Option<String>,
}

/// Options of one level of [`ResolveContext::resolve_dependencies`].
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub parent_node_id: NodeId,
    pub depth: usize,
    /// References pinned by the lockfile, by alias.
    pub resolved_dependencies: Option<ResolvedDependencies>,
    /// References the previous version of the dependent used, by alias.
    pub prefered_dependencies: Option<ResolvedDependencies>,
    pub optional_dependency_names: Vec<String>,
    pub parent_is_installable: bool,
    pub update: bool,
}

impl ResolveOptions {
    /// Options of the root level.
    pub fn root(resolved_dependencies: ResolvedDependencies, update: bool) -> Self {
        ResolveOptions {
            parent_node_id: NodeId::root(),
            depth: 0,
            resolved_dependencies: Some(resolved_dependencies),
            prefered_dependencies: None,
            optional_dependency_names: Vec::new(),
            parent_is_installable: true,
            update,
        }
    }
}

/// Error type of [`ResolveContext::resolve_dependencies`].
#[derive(Debug, Display, Error, Diagnostic)]
pub enum ResolveDependenciesError {
    #[display("Failed to resolve {raw}: {error}")]
    #[diagnostic(code(knit_package_manager::request_package))]
    RequestPackage {
        raw: String,
        #[error(source)]
        error: StoreError,
    },

    #[display("Failed to read the manifest of {raw}: {error}")]
    #[diagnostic(code(knit_package_manager::fetch_manifest))]
    FetchManifest {
        raw: String,
        #[error(source)]
        error: SharedStoreError,
    },

    #[diagnostic(transparent)]
    Installability(#[error(source)] InstallabilityError),

    #[diagnostic(transparent)]
    TarballUrl(#[error(source)] TarballUrlError),
}

/// What the wanted lockfile knows about a reference.
struct LockfileInfo {
    relative_path: String,
    pkg_id: String,
    locked: Option<LockedPackage>,
}

/// Snapshot of a reference found in the wanted lockfile.
struct LockedPackage {
    absolute_path: String,
    snapshot: PackageSnapshot,
    resolution: LockfileResolution,
    resolved_dependencies: ResolvedDependencies,
    optional_dependency_names: Vec<String>,
}

fn lockfile_info(
    lockfile: &Lockfile,
    reference: &str,
    alias: &str,
) -> Result<Option<LockfileInfo>, TarballUrlError> {
    let Some(relative_path) = dependency_path::ref_to_relative(reference, alias) else {
        return Ok(None);
    };
    let absolute_path = dependency_path::resolve(&lockfile.registry, &relative_path);
    let Some(snapshot) = lockfile.packages.get(&relative_path) else {
        return Ok(Some(LockfileInfo { relative_path, pkg_id: absolute_path, locked: None }));
    };
    let resolution = snapshot.resolution.to_fetchable(&relative_path, &lockfile.registry)?;
    let locked = LockedPackage {
        absolute_path: absolute_path.clone(),
        snapshot: snapshot.clone(),
        resolution,
        resolved_dependencies: snapshot.resolved_dependencies(),
        optional_dependency_names: snapshot.optional_dependencies.keys().cloned().collect(),
    };
    Ok(Some(LockfileInfo {
        relative_path,
        pkg_id: snapshot.id.clone().unwrap_or(absolute_path),
        locked: Some(locked),
    }))
}

/// Whether a lockfile reference is a version within `range`.
fn ref_satisfies(reference: &str, range: &str) -> bool {
    match (reference.parse::<Version>(), range.parse::<Range>()) {
        (Ok(version), Ok(range)) => version.satisfies(&range),
        _ => false,
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Options of a single wanted dependency.
struct DependencyOptions<'a> {
    parent_node_id: &'a NodeId,
    depth: usize,
    update: bool,
    proceed: bool,
    parent_is_installable: bool,
    lockfile_info: Option<LockfileInfo>,
}

/// State shared by every branch of a resolution.
pub struct ResolveContext<'a> {
    pub config: &'a Npmrc,
    pub store: &'a dyn StoreController,
    /// Root of the project.
    pub prefix: &'a Path,
    pub modules_dir: &'a Path,
    pub wanted_lockfile: &'a Lockfile,
    /// Lockfile describing what is currently in the modules dir.
    pub current_lockfile: &'a Lockfile,
    pub platform: Platform,
    pub installs: DashMap<String, InstalledPackage>,
    pub tree: DashMap<NodeId, TreeNode>,
    /// Ids of packages resolved but not installable here.
    pub skipped: DashSet<String>,
    /// Latest versions of outdated root dependencies, by package id.
    pub outdated: DashMap<String, String>,
    /// Children of the first occurrence of each package as `(alias, pkg_id)`.
    pub children_by_parent_id: DashMap<String, Vec<(String, String)>>,
    pub pending_nodes: DashMap<NodeId, PendingNode>,
    pub local_packages: DashMap<String, LocalPackage>,
}

/// Everything a resolution produced.
pub struct ResolvedGraph {
    pub installs: HashMap<String, InstalledPackage>,
    pub tree: HashMap<NodeId, TreeNode>,
    pub skipped: HashSet<String>,
    pub outdated: HashMap<String, String>,
    pub local_packages: Vec<LocalPackage>,
}

impl<'a> ResolveContext<'a> {
    pub fn new(
        config: &'a Npmrc,
        store: &'a dyn StoreController,
        prefix: &'a Path,
        wanted_lockfile: &'a Lockfile,
        current_lockfile: &'a Lockfile,
    ) -> Self {
        ResolveContext {
            config,
            store,
            prefix,
            modules_dir: &config.modules_dir,
            wanted_lockfile,
            current_lockfile,
            platform: Platform::current(),
            installs: DashMap::new(),
            tree: DashMap::new(),
            skipped: DashSet::new(),
            outdated: DashMap::new(),
            children_by_parent_id: DashMap::new(),
            pending_nodes: DashMap::new(),
            local_packages: DashMap::new(),
        }
    }

    /// Resolve a level of wanted dependencies and, recursively, their own dependencies.
    ///
    /// Siblings are resolved concurrently. Dependencies that resolve to nothing (skipped optional
    /// dependencies, local packages, cycles, packages already installed) have no address.
    #[async_recursion]
    pub async fn resolve_dependencies(
        &self,
        wanted_dependencies: Vec<WantedDependency>,
        options: ResolveOptions,
    ) -> Result<Vec<PkgAddress>, ResolveDependenciesError> {
        let update = options.update && options.depth as u64 <= self.config.depth;
        let options = &options;

        wanted_dependencies
            .into_iter()
            .map(|wanted_dependency| async move {
                let alias = wanted_dependency.alias.as_deref();
                let mut reference = alias
                    .zip(options.resolved_dependencies.as_ref())
                    .and_then(|(alias, resolved)| resolved.get(alias))
                    .cloned();
                let mut proceed = false;

                // A dependency of the previous version of the dependent is kept when it still fits.
                if reference.is_none() && wanted_dependency.pref.parse::<Range>().is_ok() {
                    let prefered = alias
                        .zip(options.prefered_dependencies.as_ref())
                        .and_then(|(alias, prefered)| prefered.get(alias))
                        .filter(|prefered| ref_satisfies(prefered, &wanted_dependency.pref));
                    if let Some(prefered) = prefered {
                        proceed = true;
                        reference = Some(prefered.clone());
                    }
                }

                let lockfile_info = match (reference, alias) {
                    (Some(reference), Some(alias)) => {
                        lockfile_info(self.wanted_lockfile, &reference, alias)
                            .map_err(ResolveDependenciesError::TarballUrl)?
                    }
                    _ => None,
                };

                let dependency_options = DependencyOptions {
                    parent_node_id: &options.parent_node_id,
                    depth: options.depth,
                    update,
                    proceed,
                    parent_is_installable: options.parent_is_installable,
                    lockfile_info,
                };
                self.resolve_dependency(wanted_dependency, dependency_options).await
            })
            .pipe(future::join_all)
            .await
            .into_iter()
            .filter_map(Result::transpose)
            .collect()
    }

    /// Whether a locked dependency is already in place and needs no resolution at all.
    ///
    /// Only reached below the configured `depth`, so root dependencies never take this path.
    async fn is_already_installed(&self, info: &LockfileInfo) -> bool {
        let Some(locked) = &info.locked else { return false };
        if !self.current_lockfile.packages.contains_key(&info.relative_path) {
            return false;
        }
        let location = self
            .modules_dir
            .join(format!(".{}", dependency_path::pkg_id_to_filename(&locked.absolute_path)));
        exists(&location).await
    }

    async fn resolve_dependency(
        &self,
        wanted_dependency: WantedDependency,
        options: DependencyOptions<'_>,
    ) -> Result<Option<PkgAddress>, ResolveDependenciesError> {
        let DependencyOptions {
            parent_node_id,
            depth,
            update,
            proceed,
            parent_is_installable,
            lockfile_info,
        } = options;
        let config = self.config;
        let locked = lockfile_info.as_ref().and_then(|info| info.locked.as_ref());
        let proceed = proceed
            || locked.is_none()
            || config.force
            || parent_node_id.depth() as u64 <= config.depth;

        if !proceed && !config.shamefully_flatten {
            if let Some(info) = &lockfile_info {
                if self.is_already_installed(info).await {
                    tracing::debug!(target: "knit::resolve", raw = %wanted_dependency.raw, "Already installed");
                    return Ok(None);
                }
            }
        }

        let alias = wanted_dependency.alias.as_deref().unwrap_or_default();
        let request_options = RequestPackageOptions {
            registry: config.registry_for(alias),
            lockfile_resolution: locked.map(|locked| &locked.resolution),
            current_pkg_id: lockfile_info.as_ref().map(|info| info.pkg_id.as_str()),
            update,
            download_priority: -(depth as i32),
            prefix: self.prefix,
            side_effects_cache: config.side_effects_cache,
            skip_fetch: config.dry_run,
        };
        let response = match self.store.request_package(&wanted_dependency, request_options).await {
            Ok(response) => response,
            Err(error) if wanted_dependency.optional => {
                tracing::warn!(target: "knit::resolve", "Skipping optional dependency {}. {error}", wanted_dependency.raw);
                return Ok(None);
            }
            Err(error) => {
                return Err(ResolveDependenciesError::RequestPackage {
                    raw: wanted_dependency.raw.clone(),
                    error,
                })
            }
        };

        if response.is_local {
            self.add_local_package(&wanted_dependency, &response, depth).await?;
            return Ok(None);
        }

        if let Some(dependent_id) = parent_node_id.pkg_id() {
            if parent_node_id.contains_sequence(dependent_id, &response.id) {
                return Ok(None);
            }
        }

        let use_manifest_from_lockfile = self.wanted_lockfile.has_manifest_info() && !update;
        let (manifest, resolved_dependencies, manifest_from_lockfile) =
            match (lockfile_info.as_ref(), locked) {
                (Some(info), Some(locked)) if use_manifest_from_lockfile => {
                    let mut manifest = locked.snapshot.to_manifest(&info.relative_path);
                    let mut resolved_dependencies = locked.resolved_dependencies.clone();
                    for peer in manifest.peer_dependencies.keys() {
                        manifest.dependencies.remove(peer);
                        resolved_dependencies.remove(peer);
                    }
                    (manifest, Some(resolved_dependencies), true)
                }
                _ => {
                    let manifest = response.manifest().await.map_err(|error| {
                        ResolveDependenciesError::FetchManifest {
                            raw: wanted_dependency.raw.clone(),
                            error,
                        }
                    })?;
                    (manifest, locked.map(|locked| locked.resolved_dependencies.clone()), false)
                }
            };

        if depth == 0 {
            if let Some(latest) = response.latest.as_ref().filter(|latest| **latest != manifest.version) {
                self.outdated.insert(response.id.clone(), latest.clone());
            }
        }
        if let Some(deprecated) = &manifest.deprecated {
            tracing::warn!(
                target: "knit::resolve",
                pkg_name = %manifest.name,
                pkg_version = %manifest.version,
                pkg_id = %response.id,
                %deprecated,
                depth,
                "Deprecated package"
            );
        }

        let node_id = parent_node_id.child(&response.id);
        let current_is_installable = config.force
            || is_installable(
                &response.id,
                &manifest,
                InstallabilityOptions {
                    platform: &self.platform,
                    node_version: config.node_version.as_deref(),
                    engine_strict: config.engine_strict,
                    optional: wanted_dependency.optional,
                },
            )
            .map_err(ResolveDependenciesError::Installability)?;
        let installable = parent_is_installable && current_is_installable;
        if installable {
            self.skipped.remove(&response.id);
        }

        let flags = DependencyFlags::from_wanted(&wanted_dependency);
        let is_new = match self.installs.entry(response.id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(self.installed_package(&wanted_dependency, &response, &manifest, flags));
                true
            }
            Entry::Occupied(mut entry) => {
                let package = entry.get_mut();
                package.flags = package.flags.merge(flags);
                false
            }
        };
        let pkg_alias = wanted_dependency.alias.clone().unwrap_or_else(|| manifest.name.clone());

        if is_new {
            if !installable {
                self.skipped.insert(response.id.clone());
            }

            let (child_resolved, child_prefered) =
                match lockfile_info.as_ref().is_some_and(|info| info.pkg_id == response.id) {
                    true => (resolved_dependencies, None),
                    false => (None, resolved_dependencies),
                };
            let optional_dependency_names =
                locked.map(|locked| locked.optional_dependency_names.clone()).unwrap_or_default();
            let mut children_wanted = manifest.package_wanted_dependencies();
            if manifest_from_lockfile && children_wanted.is_empty() {
                if let Some(resolved) = &child_resolved {
                    children_wanted = resolved
                        .keys()
                        .map(|name| {
                            WantedDependency::from_alias(name, optional_dependency_names.contains(name))
                        })
                        .collect();
                }
            }

            let children = self
                .resolve_dependencies(
                    children_wanted,
                    ResolveOptions {
                        parent_node_id: node_id.clone(),
                        depth: depth + 1,
                        resolved_dependencies: child_resolved,
                        prefered_dependencies: child_prefered,
                        optional_dependency_names,
                        parent_is_installable: installable,
                        update,
                    },
                )
                .await?;

            self.children_by_parent_id.insert(
                response.id.clone(),
                children.iter().map(|child| (child.alias.clone(), child.pkg_id.clone())).collect(),
            );
            self.tree.insert(
                node_id.clone(),
                TreeNode {
                    node_id: node_id.clone(),
                    pkg_id: response.id.clone(),
                    children: children
                        .into_iter()
                        .map(|child| (child.alias, child.node_id))
                        .collect(),
                    depth,
                    installable,
                },
            );
        } else {
            self.pending_nodes.insert(
                node_id.clone(),
                PendingNode {
                    alias: pkg_alias.clone(),
                    node_id: node_id.clone(),
                    pkg_id: response.id.clone(),
                    depth,
                    installable,
                },
            );
        }

        if depth == 0 {
            if let Some(mut package) = self.installs.get_mut(&response.id) {
                package.spec_raw = wanted_dependency.raw.clone();
            }
        }

        Ok(Some(PkgAddress {
            alias: pkg_alias,
            node_id,
            pkg_id: response.id,
            normalized_pref: if depth == 0 { response.normalized_pref } else { None },
        }))
    }

    fn installed_package(
        &self,
        wanted_dependency: &WantedDependency,
        response: &PackageResponse,
        manifest: &PackageManifest,
        flags: DependencyFlags,
    ) -> InstalledPackage {
        let engine_cache = match self.config.force {
            true => None,
            false => self
                .config
                .node_version
                .as_deref()
                .and_then(|node_version| self.platform.engine_name(node_version))
                .and_then(|engine_name| response.cache_by_engine.get(&engine_name).cloned()),
        };
        InstalledPackage {
            id: response.id.clone(),
            resolution: response.resolution.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            flags,
            peer_dependencies: manifest.peer_dependencies_without_own(),
            optional_dependencies: manifest.optional_dependencies.keys().cloned().collect(),
            bundled_dependencies: manifest
                .bundle_dependencies
                .clone()
                .or_else(|| manifest.bundled_dependencies.clone()),
            has_bundled_dependencies: manifest.has_bundled_dependencies(),
            engines: manifest.engines.clone(),
            os: manifest.os.clone(),
            cpu: manifest.cpu.clone(),
            deprecated: manifest.deprecated.clone(),
            path: response.in_store_location.clone(),
            fetching_files: response.fetching_files.clone(),
            finishing: response.finishing.clone(),
            engine_cache,
            spec_raw: wanted_dependency.raw.clone(),
        }
    }

    async fn add_local_package(
        &self,
        wanted_dependency: &WantedDependency,
        response: &PackageResponse,
        depth: usize,
    ) -> Result<(), ResolveDependenciesError> {
        let manifest = response.manifest().await.map_err(|error| {
            ResolveDependenciesError::FetchManifest { raw: wanted_dependency.raw.clone(), error }
        })?;
        if depth > 0 {
            tracing::warn!(target: "knit::resolve", "Ignoring file dependency because it is not a root dependency {}", wanted_dependency.raw);
            return Ok(());
        }
        let alias = wanted_dependency.alias.clone().unwrap_or_else(|| manifest.name.clone());
        let local_package = LocalPackage {
            alias: alias.clone(),
            id: response.id.clone(),
            spec_raw: wanted_dependency.raw.clone(),
            name: manifest.name,
            version: manifest.version,
            dev: wanted_dependency.dev,
            optional: wanted_dependency.optional,
            resolution: response.resolution.clone(),
            directory: response.in_store_location.clone(),
            normalized_pref: response.normalized_pref.clone(),
        };
        self.local_packages.insert(alias, local_package);
        Ok(())
    }

    /// Give every repeated occurrence of a package the children of its first occurrence.
    pub fn build_pending_trees(&self) {
        let pending_nodes: Vec<PendingNode> =
            self.pending_nodes.iter().map(|entry| entry.value().clone()).collect();
        for pending in pending_nodes {
            let children =
                self.build_tree(&pending.node_id, &pending.pkg_id, pending.depth + 1, pending.installable);
            self.tree.insert(
                pending.node_id.clone(),
                TreeNode {
                    node_id: pending.node_id,
                    pkg_id: pending.pkg_id,
                    children,
                    depth: pending.depth,
                    installable: pending.installable,
                },
            );
        }
    }

    fn build_tree(
        &self,
        parent_node_id: &NodeId,
        parent_id: &str,
        depth: usize,
        installable: bool,
    ) -> BTreeMap<String, NodeId> {
        let children = self
            .children_by_parent_id
            .get(parent_id)
            .map(|children| children.clone())
            .unwrap_or_default();
        let mut result = BTreeMap::new();
        for (alias, pkg_id) in children {
            if parent_node_id.contains_sequence(parent_id, &pkg_id) {
                continue;
            }
            let node_id = parent_node_id.child(&pkg_id);
            let installable = installable && !self.skipped.contains(&pkg_id);
            let grandchildren = self.build_tree(&node_id, &pkg_id, depth + 1, installable);
            self.tree.insert(
                node_id.clone(),
                TreeNode { node_id: node_id.clone(), pkg_id, children: grandchildren, depth, installable },
            );
            result.insert(alias, node_id);
        }
        result
    }

    /// Take the results out of the context.
    pub fn into_graph(self) -> ResolvedGraph {
        ResolvedGraph {
            installs: self.installs.into_iter().collect(),
            tree: self.tree.into_iter().collect(),
            skipped: self.skipped.into_iter().collect(),
            outdated: self.outdated.into_iter().collect(),
            local_packages: self.local_packages.into_iter().map(|(_, local)| local).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knit_testing_utils::MockStore;
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};
    use text_block_macros::text_block;

    const REGISTRY: &str = "https://registry.npmjs.org/";

    fn config(dir: &TempDir) -> Npmrc {
        let mut config = Npmrc::new();
        config.modules_dir = dir.path().join("node_modules");
        config.store_dir = dir.path().join("store");
        config
    }

    fn context<'a>(
        config: &'a Npmrc,
        store: &'a MockStore,
        dir: &'a TempDir,
        lockfile: &'a Lockfile,
    ) -> ResolveContext<'a> {
        let mut ctx = ResolveContext::new(config, store, dir.path(), lockfile, lockfile);
        ctx.platform = Platform { os: "linux".to_string(), cpu: "x64".to_string() };
        ctx
    }

    fn wanted(alias: &str, pref: &str) -> WantedDependency {
        WantedDependency::new(alias, pref, false, false)
    }

    fn sorted_ids(ctx: &ResolveContext) -> Vec<String> {
        let mut ids: Vec<_> = ctx.installs.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn single_dependency() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_package(r#"{ "name": "a", "version": "1.0.0" }"#)
            .add_package(r#"{ "name": "a", "version": "1.2.0" }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        let addresses = ctx
            .resolve_dependencies(vec![wanted("a", "^1.0.0")], ResolveOptions::root(Default::default(), false))
            .await
            .unwrap();

        assert_eq!(
            addresses,
            [PkgAddress {
                alias: "a".to_string(),
                node_id: NodeId::root().child("registry.npmjs.org/a/1.2.0"),
                pkg_id: "registry.npmjs.org/a/1.2.0".to_string(),
                normalized_pref: Some("^1.2.0".to_string()),
            }]
        );
        let package = ctx.installs.get("registry.npmjs.org/a/1.2.0").unwrap();
        assert_eq!(package.flags, DependencyFlags { prod: true, dev: false, optional: false });
        assert!(ctx.skipped.is_empty());
        let node = ctx.tree.get(&addresses[0].node_id).unwrap();
        assert_eq!((node.depth, node.installable, node.children.len()), (0, true, 0));
    }

    #[tokio::test]
    async fn deprecated_package_is_resolved_with_its_message() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store.add_package(r#"{ "name": "old", "version": "1.0.0", "deprecated": "use new instead" }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        let addresses = ctx
            .resolve_dependencies(vec![wanted("old", "^1.0.0")], ResolveOptions::root(Default::default(), false))
            .await
            .unwrap();

        assert_eq!(addresses.len(), 1);
        let package = ctx.installs.get("registry.npmjs.org/old/1.0.0").unwrap();
        assert_eq!(package.deprecated.as_deref(), Some("use new instead"));
        assert!(ctx.skipped.is_empty());
    }

    #[tokio::test]
    async fn optional_failure_is_skipped() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store.add_package(r#"{ "name": "a", "version": "1.0.0" }"#).fail_package("a");
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        eprintln!("CASE: optional");
        let optional = WantedDependency::new("a", "^1.0.0", false, true);
        let addresses = ctx
            .resolve_dependencies(vec![optional], ResolveOptions::root(Default::default(), false))
            .await
            .unwrap();
        assert!(addresses.is_empty());
        assert!(ctx.installs.is_empty());

        eprintln!("CASE: required");
        let error = ctx
            .resolve_dependencies(vec![wanted("a", "^1.0.0")], ResolveOptions::root(Default::default(), false))
            .await
            .unwrap_err();
        assert!(matches!(error, ResolveDependenciesError::RequestPackage { .. }));
    }

    #[tokio::test]
    async fn flags_are_merged_across_edges() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_package(r#"{ "name": "a", "version": "1.0.0" }"#)
            .add_package(r#"{ "name": "b", "version": "1.0.0", "dependencies": { "a": "^1.0.0" } }"#)
            .add_package(r#"{ "name": "c", "version": "1.0.0", "optionalDependencies": { "a": "^1.0.0" } }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        let wanted_dependencies = vec![
            WantedDependency::new("b", "^1.0.0", true, false),
            WantedDependency::new("c", "^1.0.0", false, true),
        ];
        ctx.resolve_dependencies(wanted_dependencies, ResolveOptions::root(Default::default(), false))
            .await
            .unwrap();

        let a = ctx.installs.get("registry.npmjs.org/a/1.0.0").unwrap();
        assert_eq!(a.flags, DependencyFlags { prod: true, dev: false, optional: false });
        assert_eq!(ctx.pending_nodes.len(), 1);
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_package(r#"{ "name": "a", "version": "1.0.0", "dependencies": { "b": "1.0.0" } }"#)
            .add_package(r#"{ "name": "b", "version": "1.0.0", "dependencies": { "a": "1.0.0" } }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        ctx.resolve_dependencies(vec![wanted("a", "1.0.0")], ResolveOptions::root(Default::default(), false))
            .await
            .unwrap();
        ctx.build_pending_trees();

        assert_eq!(sorted_ids(&ctx), ["registry.npmjs.org/a/1.0.0", "registry.npmjs.org/b/1.0.0"]);
        let a = NodeId::root().child("registry.npmjs.org/a/1.0.0");
        let b = a.child("registry.npmjs.org/b/1.0.0");
        let repeated_a = b.child("registry.npmjs.org/a/1.0.0");
        assert!(ctx.tree.get(&repeated_a).unwrap().children.is_empty());
        assert_eq!(ctx.tree.len(), 3);
    }

    #[tokio::test]
    async fn lockfile_pins_versions() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_package(r#"{ "name": "a", "version": "1.0.0", "dependencies": { "b": "^1.0.0" } }"#)
            .add_package(r#"{ "name": "a", "version": "1.2.0" }"#)
            .add_package(r#"{ "name": "b", "version": "1.0.0" }"#)
            .add_package(r#"{ "name": "b", "version": "1.5.0" }"#);
        let lockfile: Lockfile = serde_yaml::from_str(text_block! {
            "lockfileVersion: 3"
            "lockfileMinorVersion: 1"
            "registry: https://registry.npmjs.org/"
            "dependencies:"
            "  a: 1.0.0"
            "packages:"
            "  /a/1.0.0:"
            "    resolution:"
            "      integrity: sha512-gf6ZldcfCDyNXPRiW3lQjEP1Z9rrUM/4Cn7BZbv3SdTA82zxWRP8OmLwvGR974uuENhGCFgFdN11z3n1Ofpprg=="
            "    dependencies:"
            "      b: 1.0.0"
            "  /b/1.0.0:"
            "    resolution:"
            "      integrity: sha512-gf6ZldcfCDyNXPRiW3lQjEP1Z9rrUM/4Cn7BZbv3SdTA82zxWRP8OmLwvGR974uuENhGCFgFdN11z3n1Ofpprg=="
        })
        .unwrap();
        let ctx = context(&config, &store, &dir, &lockfile);

        eprintln!("CASE: locked");
        ctx.resolve_dependencies(
            vec![wanted("a", "^1.0.0")],
            ResolveOptions::root(lockfile.root_dependencies(), false),
        )
        .await
        .unwrap();
        assert_eq!(sorted_ids(&ctx), ["registry.npmjs.org/a/1.0.0", "registry.npmjs.org/b/1.0.0"]);

        eprintln!("CASE: updating");
        let ctx = context(&config, &store, &dir, &lockfile);
        ctx.resolve_dependencies(
            vec![wanted("a", "^1.0.0")],
            ResolveOptions::root(lockfile.root_dependencies(), true),
        )
        .await
        .unwrap();
        assert_eq!(sorted_ids(&ctx), ["registry.npmjs.org/a/1.2.0"]);
    }

    #[tokio::test]
    async fn prefered_dependencies_are_reused() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_package(r#"{ "name": "a", "version": "1.1.0", "dependencies": { "b": "^1.0.0" } }"#)
            .add_package(r#"{ "name": "b", "version": "1.0.0" }"#)
            .add_package(r#"{ "name": "b", "version": "1.5.0" }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        let options = ResolveOptions {
            prefered_dependencies: Some([("b".to_string(), "1.0.0".to_string())].into()),
            ..ResolveOptions::root(Default::default(), false)
        };
        let addresses = ctx.resolve_dependencies(vec![wanted("b", "^1.0.0")], options).await.unwrap();
        assert_eq!(addresses[0].pkg_id, "registry.npmjs.org/b/1.0.0");
    }

    #[tokio::test]
    async fn incompatible_optional_dependency_is_skipped() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_package(r#"{ "name": "native", "version": "1.0.0", "os": ["darwin"], "dependencies": { "b": "1.0.0" } }"#)
            .add_package(r#"{ "name": "b", "version": "1.0.0" }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        let addresses = ctx
            .resolve_dependencies(
                vec![WantedDependency::new("native", "1.0.0", false, true)],
                ResolveOptions::root(Default::default(), false),
            )
            .await
            .unwrap();

        let native = ctx.tree.get(&addresses[0].node_id).unwrap();
        assert!(!native.installable);
        let b = ctx.tree.get(&native.children["b"]).unwrap();
        assert!(!b.installable);
        let mut skipped: Vec<_> = ctx.skipped.iter().map(|id| id.clone()).collect();
        skipped.sort();
        assert_eq!(skipped, ["registry.npmjs.org/b/1.0.0", "registry.npmjs.org/native/1.0.0"]);
    }

    #[tokio::test]
    async fn local_packages_only_at_the_root() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_local_package("file:../local", r#"{ "name": "local", "version": "0.1.0" }"#)
            .add_package(r#"{ "name": "a", "version": "1.0.0", "dependencies": { "nested": "file:../local" } }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        let addresses = ctx
            .resolve_dependencies(
                vec![wanted("local", "file:../local"), wanted("a", "1.0.0")],
                ResolveOptions::root(Default::default(), false),
            )
            .await
            .unwrap();

        assert_eq!(addresses.len(), 1);
        let local_aliases: Vec<_> = ctx.local_packages.iter().map(|entry| entry.key().clone()).collect();
        assert_eq!(local_aliases, ["local"]);
        assert_eq!(ctx.local_packages.get("local").unwrap().id, "file:../local");
    }

    #[tokio::test]
    async fn outdated_root_dependencies() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let mut store = MockStore::new(&config.store_dir);
        store
            .add_package(r#"{ "name": "a", "version": "1.0.0" }"#)
            .add_package(r#"{ "name": "a", "version": "2.0.0" }"#);
        let lockfile = Lockfile::new(REGISTRY);
        let ctx = context(&config, &store, &dir, &lockfile);

        ctx.resolve_dependencies(vec![wanted("a", "^1.0.0")], ResolveOptions::root(Default::default(), false))
            .await
            .unwrap();
        assert_eq!(ctx.outdated.get("registry.npmjs.org/a/1.0.0").map(|latest| latest.clone()), Some("2.0.0".to_string()));
    }
}
