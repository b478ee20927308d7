use crate::{
    link_bins, link_package_bins, symlink_package, sync_root_dependencies, update_lockfile,
    ExistingLink, FlattenDependencies, FlattenError, LinkBinsError, PkgAddress, RemoveOrphans,
    RemoveOrphansError, ResolvePeers, ResolvedGraph, ResolvedNode, ResolvedPeers, SnapshotUpdate,
    SymlinkPackageError, TopParent,
};
use derive_more::{Display, Error};
use futures_util::future;
use knit_fs::{import_dir, is_same_file, ImportDirError, ImportMethod};
use knit_lockfile::{dependency_path, Lockfile, LockfileFilter, ResolvedDependencies};
use knit_npmrc::Npmrc;
use knit_package_manifest::PackageManifest;
use knit_store_controller::{SharedStoreError, StoreController};
use miette::Diagnostic;
use pipe_trait::Pipe;
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Semaphore;

/// Error type of [`Link`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum LinkError {
    #[display("Failed to fetch the files of {pkg_id}: {error}")]
    #[diagnostic(code(knit_package_manager::fetch_files))]
    FetchFiles {
        pkg_id: String,
        #[error(source)]
        error: SharedStoreError,
    },

    #[diagnostic(transparent)]
    ImportPackage(#[error(source)] ImportDirError),

    #[display("Importing {pkg_id} did not complete: {error}")]
    #[diagnostic(code(knit_package_manager::import_task))]
    ImportTask {
        pkg_id: String,
        #[error(source)]
        error: tokio::task::JoinError,
    },

    #[diagnostic(transparent)]
    SymlinkPackage(#[error(source)] SymlinkPackageError),

    #[diagnostic(transparent)]
    LinkBins(#[error(source)] LinkBinsError),

    #[diagnostic(transparent)]
    RemoveOrphans(#[error(source)] RemoveOrphansError),

    #[diagnostic(transparent)]
    Flatten(#[error(source)] FlattenError),
}

/// Output of [`Link`].
pub struct LinkResult {
    /// Every resolved node, by absolute path.
    pub resolved_nodes: BTreeMap<String, ResolvedNode>,
    pub wanted_lockfile: Lockfile,
    /// What the modules dir holds after linking.
    pub current_lockfile: Lockfile,
    /// Absolute paths of the nodes that were (re)linked.
    pub updated_paths: Vec<String>,
    pub removed_ids: BTreeSet<String>,
    pub flattened_aliases_by_id: BTreeMap<String, String>,
}

/// Bind peers, write the resolved graph into the modules dir and compute the new lockfiles.
#[must_use]
pub struct Link<'a> {
    pub config: &'a Npmrc,
    pub store: &'a dyn StoreController,
    /// Root of the project.
    pub prefix: &'a Path,
    pub manifest: &'a PackageManifest,
    pub graph: &'a ResolvedGraph,
    pub root_addresses: &'a [PkgAddress],
    /// Root dependencies that were already installed and not resolved again.
    pub top_parents: &'a [TopParent],
    pub non_dev_ids: &'a HashSet<String>,
    pub non_optional_ids: &'a HashSet<String>,
    pub wanted_lockfile: Lockfile,
    pub current_lockfile: &'a Lockfile,
    pub flattened_aliases_by_id: BTreeMap<String, String>,
}

impl<'a> Link<'a> {
    /// Execute the subroutine.
    pub async fn run(self) -> Result<LinkResult, LinkError> {
        let Link {
            config,
            store,
            prefix,
            manifest,
            graph,
            root_addresses,
            top_parents,
            non_dev_ids,
            non_optional_ids,
            mut wanted_lockfile,
            current_lockfile,
            mut flattened_aliases_by_id,
        } = self;
        let modules_dir = config.modules_dir.as_path();
        let bin_dir = modules_dir.join(".bin");

        let root_node_ids: Vec<_> = root_addresses
            .iter()
            .map(|address| (address.alias.clone(), address.node_id.clone()))
            .collect();
        let ResolvedPeers { nodes, root_nodes } = ResolvePeers {
            tree: &graph.tree,
            installs: &graph.installs,
            root_nodes: &root_node_ids,
            top_parents,
            independent_leaves: config.independent_leaves,
            modules_dir,
            non_dev_ids,
            non_optional_ids,
        }
        .run();
        tracing::debug!(target: "knit::link", nodes = nodes.len(), "Resolution done");

        let updates = update_lockfile(&nodes, &wanted_lockfile);
        let filter = LockfileFilter {
            skipped: &graph.skipped,
            production: config.production,
            development: config.development,
            optional: config.optional,
        };
        let previous = current_lockfile.filter(&filter);
        let out_of_date: Vec<&SnapshotUpdate> = updates
            .iter()
            .filter(|update| needs_linking(update, &previous, config, &graph.skipped))
            .collect();
        let updated_paths: Vec<String> =
            out_of_date.iter().map(|update| update.node.absolute_path.clone()).collect();

        if !config.dry_run {
            let semaphore = Semaphore::new(config.link_concurrency.max(1) as usize);
            let copy = Arc::new(AtomicBool::new(false));
            out_of_date
                .iter()
                .map(|update| import_package(update.node, config.force, &semaphore, &copy))
                .pipe(future::try_join_all)
                .await?;

            out_of_date
                .iter()
                .filter(|update| !update.node.independent)
                .flat_map(|update| module_links(update, config.optional))
                .collect::<Vec<_>>()
                .par_iter()
                .try_for_each(ModuleLink::create)?;
        }

        for update in &updates {
            wanted_lockfile.packages.insert(update.dependency_path.clone(), update.snapshot.clone());
        }
        let registry = wanted_lockfile.registry.clone();
        let mut references: ResolvedDependencies = root_nodes
            .iter()
            .filter_map(|(alias, absolute_path)| {
                let node = nodes.get(absolute_path)?;
                let reference = dependency_path::absolute_path_to_ref(
                    absolute_path,
                    node.name(),
                    &node.package.resolution,
                    &registry,
                );
                Some((alias.clone(), reference))
            })
            .collect();
        references.extend(graph.local_packages.iter().map(|local| (local.alias.clone(), local.id.clone())));
        sync_root_dependencies(&mut wanted_lockfile, manifest, references);
        let wanted_lockfile = wanted_lockfile.prune(manifest);

        let removed_ids = RemoveOrphans {
            old_lockfile: current_lockfile,
            new_lockfile: &wanted_lockfile,
            prefix,
            modules_dir,
            bin_dir: &bin_dir,
            store,
            flattened_aliases_by_id: &mut flattened_aliases_by_id,
            dry_run: config.dry_run,
        }
        .run()
        .await
        .map_err(LinkError::RemoveOrphans)?;

        if !config.dry_run {
            link_root_dependencies(config, manifest, graph, &nodes, &root_nodes)?;

            if config.shamefully_flatten {
                let root_aliases: BTreeSet<String> = root_nodes
                    .keys()
                    .cloned()
                    .chain(graph.local_packages.iter().map(|local| local.alias.clone()))
                    .collect();
                flattened_aliases_by_id = FlattenDependencies {
                    nodes: &nodes,
                    modules_dir,
                    root_aliases: &root_aliases,
                    skipped: &graph.skipped,
                    previous_aliases_by_id: &flattened_aliases_by_id,
                }
                .run()
                .await
                .map_err(LinkError::Flatten)?;
            }

            link_bins(modules_dir, &bin_dir).map_err(LinkError::LinkBins)?;
        }

        let current_lockfile = match filter.is_complete() {
            true => wanted_lockfile.clone(),
            false => wanted_lockfile.filter(&filter),
        };

        Ok(LinkResult {
            resolved_nodes: nodes,
            wanted_lockfile,
            current_lockfile,
            updated_paths,
            removed_ids,
            flattened_aliases_by_id,
        })
    }
}

/// Whether a node is wanted here and differs from what the modules dir holds.
fn needs_linking(update: &SnapshotUpdate, previous: &Lockfile, config: &Npmrc, skipped: &HashSet<String>) -> bool {
    let node = update.node;
    if (node.dev && !config.development)
        || (node.optional && !config.optional)
        || skipped.contains(node.pkg_id())
        || !node.installable
    {
        return false;
    }
    if config.force {
        return true;
    }
    match previous.packages.get(&update.dependency_path) {
        None => true,
        Some(snapshot) => {
            snapshot.dependencies != update.snapshot.dependencies
                || snapshot.optional_dependencies != update.snapshot.optional_dependencies
        }
    }
}

/// Bring the content of a package from the store to its location in the modules dir.
async fn import_package(
    node: &ResolvedNode,
    force: bool,
    semaphore: &Semaphore,
    copy: &Arc<AtomicBool>,
) -> Result<(), LinkError> {
    let files = node
        .package
        .fetching_files
        .clone()
        .await
        .map_err(|error| LinkError::FetchFiles { pkg_id: node.pkg_id().to_string(), error })?;
    if node.independent {
        return Ok(());
    }

    let permit = semaphore.acquire().await.expect("semaphore shouldn't have been closed this soon");
    let placement = PackagePlacement {
        source: node.package.engine_cache.clone().unwrap_or_else(|| node.package.path.clone()),
        target: node.hardlinked_location.clone(),
        always_import: !files.from_store || force,
        has_bundled_dependencies: node.package.has_bundled_dependencies,
    };
    let copy = Arc::clone(copy);
    tokio::task::spawn_blocking(move || placement.run(&copy))
        .await
        .map_err(|error| LinkError::ImportTask { pkg_id: node.pkg_id().to_string(), error })??;
    drop(permit);
    Ok(())
}

/// Filesystem work of [`import_package`], run off the async workers.
struct PackagePlacement {
    source: PathBuf,
    target: PathBuf,
    always_import: bool,
    has_bundled_dependencies: bool,
}

impl PackagePlacement {
    fn run(self, copy: &AtomicBool) -> Result<(), LinkError> {
        let PackagePlacement { source, target, always_import, has_bundled_dependencies } = self;
        let manifest_path = target.join("package.json");
        let needs_import = always_import
            || !manifest_path.exists()
            || (!copy.load(Ordering::Relaxed) && !is_linked_to_store(&manifest_path, &source, &target));
        if needs_import {
            import_content(&source, &target, copy)?;
        }
        if has_bundled_dependencies {
            let bundled_modules = target.join("node_modules");
            link_bins(&bundled_modules, &bundled_modules.join(".bin")).map_err(LinkError::LinkBins)?;
        }
        Ok(())
    }
}

fn is_linked_to_store(manifest_path: &Path, source: &Path, target: &Path) -> bool {
    match is_same_file(manifest_path, &source.join("package.json")) {
        Ok(true) => true,
        Ok(false) => {
            tracing::info!(target: "knit::link", "Relinking {} from the store", target.display());
            false
        }
        Err(error) => {
            tracing::debug!(target: "knit::link", ?target, %error, "Failed to compare with the store");
            false
        }
    }
}

/// Hardlink the files of `source` into `target`, or copy them once hardlinking crossed a device.
fn import_content(source: &Path, target: &Path, copy: &AtomicBool) -> Result<(), LinkError> {
    if !copy.load(Ordering::Relaxed) {
        match import_dir(ImportMethod::Hardlink, source, target) {
            Ok(()) => return Ok(()),
            Err(error) if error.is_cross_device() => {
                tracing::warn!(target: "knit::link", "{error}");
                if !copy.swap(true, Ordering::Relaxed) {
                    tracing::info!(target: "knit::link", "Falling back to copying packages from store");
                }
            }
            Err(error) => return Err(LinkError::ImportPackage(error)),
        }
    }
    import_dir(ImportMethod::Copy, source, target).map_err(LinkError::ImportPackage)
}

/// A child of a node, linked into the node's modules dir.
struct ModuleLink {
    target: PathBuf,
    link: PathBuf,
    /// Where the commands of the child go.
    bin_dir: PathBuf,
}

impl ModuleLink {
    fn create(&self) -> Result<(), LinkError> {
        symlink_package(&self.target, &self.link, ExistingLink::ReplaceOutdated)
            .map_err(LinkError::SymlinkPackage)?;
        link_package_bins(&self.link, &self.bin_dir).map_err(LinkError::LinkBins)
    }
}

fn module_links(update: &SnapshotUpdate, include_optional: bool) -> Vec<ModuleLink> {
    let node = update.node;
    let bin_dir = node.hardlinked_location.join("node_modules").join(".bin");
    let optional_dependencies = match include_optional {
        true => update.optional_dependencies.as_slice(),
        false => &[],
    };
    update
        .dependencies
        .iter()
        .chain(optional_dependencies)
        .filter(|child| child.installable)
        .map(|child| ModuleLink {
            target: child.hardlinked_location.clone(),
            link: node.modules.join(child.name()),
            bin_dir: bin_dir.clone(),
        })
        .collect()
}

/// Symlink the wanted root dependencies into the modules dir.
fn link_root_dependencies(
    config: &Npmrc,
    manifest: &PackageManifest,
    graph: &ResolvedGraph,
    nodes: &BTreeMap<String, ResolvedNode>,
    root_nodes: &BTreeMap<String, String>,
) -> Result<(), LinkError> {
    let is_wanted = |dev: bool, optional: bool| {
        (config.production || dev || optional)
            && (config.development || !dev)
            && (config.optional || !optional)
    };
    let dependency_type = |name: &str| {
        if manifest.dev_dependencies.contains_key(name) {
            "dev"
        } else if manifest.optional_dependencies.contains_key(name) {
            "optional"
        } else {
            "prod"
        }
    };

    let root_links = root_nodes
        .iter()
        .filter_map(|(alias, absolute_path)| Some((alias, nodes.get(absolute_path)?)))
        .filter(|(_, node)| !graph.skipped.contains(node.pkg_id()))
        .filter(|(_, node)| is_wanted(node.dev, node.optional));
    for (alias, node) in root_links {
        let created = symlink_package(
            &node.hardlinked_location,
            &config.modules_dir.join(alias),
            ExistingLink::ReplaceOutdated,
        )
        .map_err(LinkError::SymlinkPackage)?;
        if created {
            tracing::info!(
                target: "knit::link",
                id = %node.pkg_id(),
                name = %node.name(),
                version = %node.version(),
                dependency_type = dependency_type(node.name()),
                latest = ?graph.outdated.get(node.pkg_id()),
                "added"
            );
        }
    }

    let local_packages =
        graph.local_packages.iter().filter(|local| is_wanted(local.dev, local.optional));
    for local in local_packages {
        let created = symlink_package(
            &local.directory,
            &config.modules_dir.join(&local.alias),
            ExistingLink::ReplaceOutdated,
        )
        .map_err(LinkError::SymlinkPackage)?;
        if created {
            tracing::info!(
                target: "knit::link",
                id = %local.id,
                name = %local.name,
                version = %local.version,
                dependency_type = dependency_type(&local.alias),
                "added"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{pkg_id, TreeFixture, REGISTRY};
    use knit_testing_utils::{fs::read_link_target, manifest_from_json, MockStore};
    use pretty_assertions::assert_eq;
    use std::{collections::HashMap, fs};
    use tempfile::{tempdir, TempDir};

    struct Project {
        dir: TempDir,
        config: Npmrc,
        graph: ResolvedGraph,
        root_addresses: Vec<PkgAddress>,
        manifest: PackageManifest,
    }

    /// `a@1.0.0 -> b@1.0.0`, with `b` providing a command.
    fn project() -> Project {
        let dir = tempdir().unwrap();
        let mut config = Npmrc::new();
        config.modules_dir = dir.path().join("node_modules");
        config.store_dir = dir.path().join("store");

        let mut fixture = TreeFixture::default();
        let a = fixture.root("a", "1.0.0");
        fixture.child(&a, "b", "1.0.0");
        for package in fixture.installs.values_mut() {
            package.path = config.store_dir.join(&package.name);
            fs::create_dir_all(&package.path).unwrap();
            let manifest = match package.name.as_str() {
                "b" => r#"{ "name": "b", "version": "1.0.0", "bin": "cli.js" }"#.to_string(),
                name => format!(r#"{{ "name": "{name}", "version": "1.0.0" }}"#),
            };
            fs::write(package.path.join("package.json"), manifest).unwrap();
            fs::write(package.path.join("cli.js"), "#!/usr/bin/env node").unwrap();
        }

        let root_addresses = fixture
            .roots
            .iter()
            .map(|(alias, node_id)| PkgAddress {
                alias: alias.clone(),
                node_id: node_id.clone(),
                pkg_id: pkg_id(alias, "1.0.0"),
                normalized_pref: Some("^1.0.0".to_string()),
            })
            .collect();
        let graph = ResolvedGraph {
            installs: fixture.installs,
            tree: fixture.tree,
            skipped: HashSet::new(),
            outdated: HashMap::new(),
            local_packages: Vec::new(),
        };
        let manifest = manifest_from_json(r#"{ "dependencies": { "a": "^1.0.0" } }"#);
        Project { dir, config, graph, root_addresses, manifest }
    }

    async fn link(project: &Project, store: &MockStore, current_lockfile: &Lockfile) -> LinkResult {
        let non_dev_ids = project.graph.installs.keys().cloned().collect();
        let non_optional_ids = project.graph.installs.keys().cloned().collect();
        Link {
            config: &project.config,
            store,
            prefix: project.dir.path(),
            manifest: &project.manifest,
            graph: &project.graph,
            root_addresses: &project.root_addresses,
            top_parents: &[],
            non_dev_ids: &non_dev_ids,
            non_optional_ids: &non_optional_ids,
            wanted_lockfile: Lockfile::new(REGISTRY),
            current_lockfile,
            flattened_aliases_by_id: BTreeMap::new(),
        }
        .run()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn links_the_graph() {
        let project = project();
        let store = MockStore::new(&project.config.store_dir);
        let modules_dir = &project.config.modules_dir;

        let result = link(&project, &store, &Lockfile::new(REGISTRY)).await;

        assert_eq!(result.updated_paths, [pkg_id("a", "1.0.0"), pkg_id("b", "1.0.0")]);
        let a_location = modules_dir.join(".registry.npmjs.org/a/1.0.0/node_modules/a");
        let b_location = modules_dir.join(".registry.npmjs.org/b/1.0.0/node_modules/b");
        assert_eq!(read_link_target(&modules_dir.join("a")).unwrap(), a_location);
        assert!(a_location.join("package.json").is_file());
        assert!(is_same_file(&a_location.join("package.json"), &project.config.store_dir.join("a/package.json")).unwrap());
        assert_eq!(
            read_link_target(&modules_dir.join(".registry.npmjs.org/a/1.0.0/node_modules/b")).unwrap(),
            b_location,
        );
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(a_location.join("node_modules/.bin/b")).unwrap(),
            modules_dir.join(".registry.npmjs.org/a/1.0.0/node_modules/b/cli.js"),
        );

        assert_eq!(result.wanted_lockfile.dependencies.get("a").map(String::as_str), Some("1.0.0"));
        assert_eq!(
            result.wanted_lockfile.packages.keys().collect::<Vec<_>>(),
            ["/a/1.0.0", "/b/1.0.0"],
        );
        assert_eq!(result.current_lockfile, result.wanted_lockfile);
        assert!(result.removed_ids.is_empty());
        assert_eq!(store.saved_states(), 1);

        eprintln!("CASE: nothing changed since the last link");
        let again = link(&project, &store, &result.current_lockfile).await;
        assert_eq!(again.updated_paths, Vec::<String>::new());
        assert_eq!(again.wanted_lockfile, result.wanted_lockfile);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn imports_one_package_at_a_time() {
        let mut project = project();
        project.config.link_concurrency = 1;
        let store = MockStore::new(&project.config.store_dir);

        let result = link(&project, &store, &Lockfile::new(REGISTRY)).await;

        assert_eq!(result.updated_paths, [pkg_id("a", "1.0.0"), pkg_id("b", "1.0.0")]);
        for name in ["a", "b"] {
            let location = project
                .config
                .modules_dir
                .join(format!(".registry.npmjs.org/{name}/1.0.0/node_modules/{name}"));
            eprintln!("CASE: {name} is imported from the store");
            assert!(is_same_file(
                &location.join("package.json"),
                &project.config.store_dir.join(name).join("package.json"),
            )
            .unwrap());
        }
    }

    #[test]
    fn placement_replaces_content_not_linked_to_the_store() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store/a");
        let target = dir.path().join("node_modules/a");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("package.json"), r#"{ "name": "a" }"#).unwrap();
        fs::write(target.join("package.json"), r#"{ "name": "stale" }"#).unwrap();

        PackagePlacement {
            source: source.clone(),
            target: target.clone(),
            always_import: false,
            has_bundled_dependencies: false,
        }
        .run(&AtomicBool::new(false))
        .unwrap();

        assert!(is_same_file(&target.join("package.json"), &source.join("package.json")).unwrap());
    }

    #[tokio::test]
    async fn dry_run_only_computes() {
        let mut project = project();
        project.config.dry_run = true;
        let store = MockStore::new(&project.config.store_dir);

        let result = link(&project, &store, &Lockfile::new(REGISTRY)).await;

        assert_eq!(result.updated_paths.len(), 2);
        assert_eq!(result.wanted_lockfile.packages.len(), 2);
        assert!(!project.config.modules_dir.exists());
        assert_eq!(store.saved_states(), 0);
    }

    #[tokio::test]
    async fn dev_dependencies_are_left_out_of_production_installs() {
        let mut project = project();
        project.config.development = false;
        let store = MockStore::new(&project.config.store_dir);
        let non_dev_ids = HashSet::new();
        let non_optional_ids = project.graph.installs.keys().cloned().collect();
        let manifest = manifest_from_json(r#"{ "devDependencies": { "a": "^1.0.0" } }"#);

        let result = Link {
            config: &project.config,
            store: &store,
            prefix: project.dir.path(),
            manifest: &manifest,
            graph: &project.graph,
            root_addresses: &project.root_addresses,
            top_parents: &[],
            non_dev_ids: &non_dev_ids,
            non_optional_ids: &non_optional_ids,
            wanted_lockfile: Lockfile::new(REGISTRY),
            current_lockfile: &Lockfile::new(REGISTRY),
            flattened_aliases_by_id: BTreeMap::new(),
        }
        .run()
        .await
        .unwrap();

        assert_eq!(result.updated_paths, Vec::<String>::new());
        assert!(project.config.modules_dir.join("a").symlink_metadata().is_err());
        assert_eq!(result.wanted_lockfile.dev_dependencies.len(), 1);
        assert_eq!(result.current_lockfile.packages.len(), 0);
        assert!(result.current_lockfile.dev_dependencies.is_empty());
    }
}
