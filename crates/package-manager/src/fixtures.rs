//! Hand-built dependency trees for tests.

use crate::{DependencyFlags, InstalledPackage, NodeId, TreeNode};
use knit_lockfile::{registry_tarball_url, LockfileResolution, TarballResolution};
use knit_store_controller::{ready, PackageFilesResponse};
use std::{collections::HashMap, path::PathBuf};

pub const REGISTRY: &str = "https://registry.npmjs.org/";

pub fn pkg_id(name: &str, version: &str) -> String {
    format!("registry.npmjs.org/{name}/{version}")
}

pub fn installed_package(name: &str, version: &str) -> InstalledPackage {
    let integrity = "sha512-gf6ZldcfCDyNXPRiW3lQjEP1Z9rrUM/4Cn7BZbv3SdTA82zxWRP8OmLwvGR974uuENhGCFgFdN11z3n1Ofpprg==";
    let resolution: LockfileResolution = TarballResolution {
        tarball: registry_tarball_url(REGISTRY, name, version),
        integrity: Some(integrity.parse().unwrap()),
        registry: Some(REGISTRY.to_string()),
    }
    .into();
    InstalledPackage {
        id: pkg_id(name, version),
        resolution,
        name: name.to_string(),
        version: version.to_string(),
        flags: DependencyFlags { prod: true, dev: false, optional: false },
        peer_dependencies: Default::default(),
        optional_dependencies: Default::default(),
        bundled_dependencies: None,
        has_bundled_dependencies: false,
        engines: None,
        os: None,
        cpu: None,
        deprecated: None,
        path: PathBuf::from("/store").join(name).join(version),
        fetching_files: ready(PackageFilesResponse { from_store: true }),
        finishing: ready(()),
        engine_cache: None,
        spec_raw: format!("{name}@{version}"),
    }
}

/// A tree and the packages its nodes refer to.
#[derive(Default)]
pub struct TreeFixture {
    pub tree: HashMap<NodeId, TreeNode>,
    pub installs: HashMap<String, InstalledPackage>,
    pub roots: Vec<(String, NodeId)>,
}

impl TreeFixture {
    /// The package `name@version`, registered on first use.
    pub fn package(&mut self, name: &str, version: &str) -> &mut InstalledPackage {
        self.installs
            .entry(pkg_id(name, version))
            .or_insert_with(|| installed_package(name, version))
    }

    pub fn peer(&mut self, name: &str, version: &str, peer: &str, range: &str) -> &mut Self {
        self.package(name, version).peer_dependencies.insert(peer.to_string(), range.to_string());
        self
    }

    pub fn root(&mut self, name: &str, version: &str) -> NodeId {
        let node_id = self.node(&NodeId::root(), name, version);
        self.roots.push((name.to_string(), node_id.clone()));
        node_id
    }

    pub fn child(&mut self, parent: &NodeId, name: &str, version: &str) -> NodeId {
        let node_id = self.node(parent, name, version);
        self.tree
            .get_mut(parent)
            .expect("parent node")
            .children
            .insert(name.to_string(), node_id.clone());
        node_id
    }

    fn node(&mut self, parent: &NodeId, name: &str, version: &str) -> NodeId {
        let id = self.package(name, version).id.clone();
        let node_id = parent.child(&id);
        let node = TreeNode {
            node_id: node_id.clone(),
            pkg_id: id,
            children: Default::default(),
            depth: parent.depth(),
            installable: true,
        };
        self.tree.insert(node_id.clone(), node);
        node_id
    }
}
