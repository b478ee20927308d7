mod dependency_flags;
mod flatten;
mod install;
mod installability;
mod link;
mod link_bins;
mod node_id;
mod remove_orphans;
mod resolve_dependencies;
mod resolve_peers;
mod symlink_package;
mod update_lockfile;

#[cfg(test)]
mod fixtures;

pub use dependency_flags::DependencyFlags;
pub use flatten::{FlattenDependencies, FlattenError};
pub use install::{Install, InstallError, InstallSummary};
pub use installability::{
    check_engine, check_platform, is_installable, InstallabilityError, InstallabilityOptions,
    Platform,
};
pub use link::{Link, LinkError, LinkResult};
pub use link_bins::{link_bins, link_package_bins, LinkBinsError};
pub use node_id::{NodeId, ParseNodeIdError};
pub use remove_orphans::{remove_stale_flattened_aliases, RemoveOrphans, RemoveOrphansError};
pub use resolve_dependencies::{
    InstalledPackage, LocalPackage, PendingNode, PkgAddress, ResolveContext,
    ResolveDependenciesError, ResolveOptions, ResolvedGraph, TreeNode,
};
pub use resolve_peers::{PeersFolder, ResolvePeers, ResolvedNode, ResolvedPeers, TopParent};
pub use symlink_package::{symlink_package, ExistingLink, SymlinkPackageError};
pub use update_lockfile::{sync_root_dependencies, update_lockfile, SnapshotUpdate};
