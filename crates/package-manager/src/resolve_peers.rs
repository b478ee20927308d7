use crate::{InstalledPackage, NodeId, TreeNode};
use knit_lockfile::dependency_path::pkg_id_to_filename;
use node_semver::{Range, Version};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

/// A package at its final location, after peer dependencies are bound.
///
/// Occurrences of a package that bind the same peers share one node.
#[derive(Clone)]
pub struct ResolvedNode {
    /// Package id, followed by the peers folder when the package has external peers.
    pub absolute_path: String,
    pub package: InstalledPackage,
    /// The `node_modules` directory the package and its dependencies are linked into.
    pub modules: PathBuf,
    /// Where the package content lives.
    pub hardlinked_location: PathBuf,
    /// Used in place from the store, without a `node_modules` of its own.
    pub independent: bool,
    /// Absolute paths of dependencies and bound peers.
    pub children: BTreeSet<String>,
    pub depth: usize,
    pub dev: bool,
    pub optional: bool,
    pub installable: bool,
}

impl ResolvedNode {
    pub fn name(&self) -> &'_ str {
        &self.package.name
    }

    pub fn version(&self) -> &'_ str {
        &self.package.version
    }

    pub fn pkg_id(&self) -> &'_ str {
        &self.package.id
    }
}

/// Order-independent set of the peers a package is bound to.
///
/// Displayed as the folder name that tells apart the copies of a package, e.g.
/// `@babel!core@7.0.0+react@16.4.0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeersFolder(BTreeSet<String>);

impl PeersFolder {
    pub fn insert(&mut self, name: &str, version: &str) {
        self.0.insert(format!("{}@{version}", name.replacen('/', "!", 1)));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeersFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut peers = self.0.iter();
        if let Some(first) = peers.next() {
            write!(f, "{first}")?;
        }
        for peer in peers {
            write!(f, "+{peer}")?;
        }
        Ok(())
    }
}

/// A root dependency already installed and left out of the tree.
#[derive(Debug, Clone)]
pub struct TopParent {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
struct ParentRef {
    version: String,
    depth: usize,
    /// `None` for already installed root dependencies.
    node_id: Option<NodeId>,
}

type ParentRefs = HashMap<String, ParentRef>;

/// Output of [`ResolvePeers`].
pub struct ResolvedPeers {
    pub nodes: BTreeMap<String, ResolvedNode>,
    /// Absolute path of every root dependency, by alias.
    pub root_nodes: BTreeMap<String, String>,
}

/// Bind the peer dependencies of every node of the tree and decide where each package lives.
#[must_use]
pub struct ResolvePeers<'a> {
    pub tree: &'a HashMap<NodeId, TreeNode>,
    pub installs: &'a HashMap<String, InstalledPackage>,
    /// Root positions by alias.
    pub root_nodes: &'a [(String, NodeId)],
    pub top_parents: &'a [TopParent],
    pub independent_leaves: bool,
    pub modules_dir: &'a Path,
    pub non_dev_ids: &'a HashSet<String>,
    pub non_optional_ids: &'a HashSet<String>,
}

/// Bookkeeping of a walk over the tree.
struct Walk<'a> {
    options: &'a ResolvePeers<'a>,
    nodes: BTreeMap<String, ResolvedNode>,
    absolute_paths: HashMap<NodeId, String>,
    /// Tree children and bound peers of the node registered at an absolute path.
    edges: HashMap<String, (Vec<NodeId>, BTreeSet<NodeId>)>,
}

impl<'a> ResolvePeers<'a> {
    /// Execute the subroutine.
    pub fn run(self) -> ResolvedPeers {
        let top_refs: ParentRefs = self
            .top_parents
            .iter()
            .map(|parent| {
                let parent_ref = ParentRef { version: parent.version.clone(), depth: 0, node_id: None };
                (parent.name.clone(), parent_ref)
            })
            .collect();
        let root_node_ids: Vec<NodeId> =
            self.root_nodes.iter().map(|(_, node_id)| node_id.clone()).collect();

        let mut walk = Walk {
            options: &self,
            nodes: BTreeMap::new(),
            absolute_paths: HashMap::new(),
            edges: HashMap::new(),
        };
        let refs = walk.with_children(&top_refs, &root_node_ids);
        walk.resolve_children(&root_node_ids, &refs);

        let Walk { mut nodes, absolute_paths, edges, .. } = walk;
        for (absolute_path, node) in nodes.iter_mut() {
            let Some((children, peers)) = edges.get(absolute_path) else { continue };
            node.children = children
                .iter()
                .chain(peers)
                .filter_map(|node_id| absolute_paths.get(node_id).cloned())
                .collect();
        }

        let root_nodes = self
            .root_nodes
            .iter()
            .filter_map(|(alias, node_id)| Some((alias.clone(), absolute_paths.get(node_id)?.clone())))
            .collect();
        ResolvedPeers { nodes, root_nodes }
    }
}

impl Walk<'_> {
    fn package_of(&self, node_id: &NodeId) -> Option<(&'_ TreeNode, &'_ InstalledPackage)> {
        let node = self.options.tree.get(node_id)?;
        let package = self.options.installs.get(&node.pkg_id)?;
        Some((node, package))
    }

    /// `parent_refs` overridden by the packages at `children`.
    fn with_children(&self, parent_refs: &ParentRefs, children: &[NodeId]) -> ParentRefs {
        let mut refs = parent_refs.clone();
        for child in children {
            let Some((node, package)) = self.package_of(child) else { continue };
            let parent_ref = ParentRef {
                version: package.version.clone(),
                depth: node.depth,
                node_id: Some(child.clone()),
            };
            refs.insert(package.name.clone(), parent_ref);
        }
        refs
    }

    /// Walk the children and return the peers they bind that none of them provides.
    fn resolve_children(&mut self, children: &[NodeId], refs: &ParentRefs) -> BTreeSet<NodeId> {
        let mut external_peers = BTreeSet::new();
        for child in children {
            external_peers.extend(
                self.resolve_node(child, refs).into_iter().filter(|peer| !children.contains(peer)),
            );
        }
        external_peers
    }

    /// Register the node and return every peer it or its descendants bind outside of itself.
    fn resolve_node(&mut self, node_id: &NodeId, parent_refs: &ParentRefs) -> BTreeSet<NodeId> {
        let Some((node, package)) = self.package_of(node_id) else { return BTreeSet::new() };
        let (node, package) = (node.clone(), package.clone());
        let children: Vec<NodeId> = node
            .children
            .values()
            .filter(|child| self.options.tree.contains_key(*child))
            .cloned()
            .collect();

        let refs = self.with_children(parent_refs, &children);
        let mut all_peers = self.resolve_children(&children, &refs);
        all_peers.remove(node_id);
        let own_peers = self.bind_peers(&node, &package, &refs);
        all_peers.extend(own_peers.iter().cloned());

        let mut peers_folder = PeersFolder::default();
        for peer in &all_peers {
            if let Some((_, peer_package)) = self.package_of(peer) {
                peers_folder.insert(&peer_package.name, &peer_package.version);
            }
        }

        let local_location =
            self.options.modules_dir.join(format!(".{}", pkg_id_to_filename(&package.id)));
        let (absolute_path, modules) = match peers_folder.is_empty() {
            true => (package.id.clone(), local_location.join("node_modules")),
            false => {
                let folder = peers_folder.to_string();
                (format!("{}/{folder}", package.id), local_location.join(folder).join("node_modules"))
            }
        };

        let is_shallower = self.nodes.get(&absolute_path).map_or(true, |existing| existing.depth > node.depth);
        if is_shallower {
            let independent =
                self.options.independent_leaves && children.is_empty() && package.peer_dependencies.is_empty();
            let hardlinked_location = match independent {
                true => package.path.clone(),
                false => modules.join(&package.name),
            };
            let peer_node_ids = own_peers.into_iter().filter(|peer| !children.contains(peer)).collect();
            self.edges.insert(absolute_path.clone(), (children, peer_node_ids));
            let resolved = ResolvedNode {
                absolute_path: absolute_path.clone(),
                modules,
                hardlinked_location,
                independent,
                children: BTreeSet::new(),
                depth: node.depth,
                dev: !self.options.non_dev_ids.contains(&package.id),
                optional: !self.options.non_optional_ids.contains(&package.id),
                installable: node.installable,
                package,
            };
            self.nodes.insert(absolute_path.clone(), resolved);
        }
        self.absolute_paths.insert(node_id.clone(), absolute_path);

        all_peers
    }

    /// Find the nodes providing the peer dependencies of a package.
    ///
    /// Peers provided by the package's own dependencies or by already installed root dependencies
    /// are not returned.
    fn bind_peers(&self, node: &TreeNode, package: &InstalledPackage, refs: &ParentRefs) -> BTreeSet<NodeId> {
        let mut bound = BTreeSet::new();
        for (peer_name, range) in &package.peer_dependencies {
            let resolved = refs.get(peer_name).filter(|resolved| {
                resolved.node_id.as_ref().map_or(true, |node_id| {
                    self.options.tree.get(node_id).is_some_and(|node| node.installable)
                })
            });
            let Some(resolved) = resolved else {
                tracing::warn!(target: "knit::peers", "{} requires a peer of {peer_name}@{range} but none was installed.", package.id);
                continue;
            };

            if !satisfies(&resolved.version, range) {
                tracing::warn!(target: "knit::peers", "{} requires a peer of {peer_name}@{range} but version {} was installed.", package.id, resolved.version);
            }

            if resolved.depth == node.depth + 1 {
                continue;
            }
            if let Some(node_id) = &resolved.node_id {
                bound.insert(node_id.clone());
            }
        }
        bound
    }
}

fn satisfies(version: &str, range: &str) -> bool {
    match (version.parse::<Version>(), range.parse::<Range>()) {
        (Ok(version), Ok(range)) => version.satisfies(&range),
        _ => false,
    }
}
