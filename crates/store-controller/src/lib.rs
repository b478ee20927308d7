//! Contract between the installer and the package store.
//!
//! The store resolves wanted dependencies to package ids, downloads and unpacks their content, and
//! keeps track of which projects use which packages. The installer only sees the results.

use async_trait::async_trait;
use derive_more::{Display, Error};
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use knit_lockfile::LockfileResolution;
use knit_package_manifest::{PackageManifest, WantedDependency};
use miette::Diagnostic;
use std::{
    collections::BTreeMap,
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Error reported by a store.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum StoreError {
    #[display("No matching version found for {raw}")]
    #[diagnostic(code(knit_store_controller::no_matching_version))]
    NoMatchingVersion {
        #[error(not(source))]
        raw: String,
    },

    #[display("Failed to resolve {raw}: {message}")]
    #[diagnostic(code(knit_store_controller::resolve))]
    Resolve { raw: String, message: String },

    #[display("Failed to fetch {pkg_id}: {message}")]
    #[diagnostic(code(knit_store_controller::fetch))]
    Fetch { pkg_id: String, message: String },

    #[display("Store I/O error at {path:?}: {error}")]
    #[diagnostic(code(knit_store_controller::io))]
    Io {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

/// Error of a shared store future. Shared futures need a cloneable output.
pub type SharedStoreError = Arc<StoreError>;

/// Future that may be awaited by every consumer of a package.
pub type StoreFuture<T> = Shared<BoxFuture<'static, Result<T, SharedStoreError>>>;

/// Wrap a future into a [`StoreFuture`].
pub fn store_future<T, F>(future: F) -> StoreFuture<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    future.map(|result| result.map_err(Arc::new)).boxed().shared()
}

/// A [`StoreFuture`] that is already complete.
pub fn ready<T>(value: T) -> StoreFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures_util::future::ready(Ok(value)).boxed().shared()
}

/// Outcome of fetching the files of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageFilesResponse {
    /// The files were already in the store before this request.
    pub from_store: bool,
}

/// Everything the store knows about a requested package.
#[derive(Clone)]
pub struct PackageResponse {
    /// Package id, e.g. `registry.npmjs.org/foo/1.0.0`.
    pub id: String,
    pub resolution: LockfileResolution,
    /// Set when the manifest was known without fetching.
    pub manifest: Option<PackageManifest>,
    pub fetching_manifest: Option<StoreFuture<PackageManifest>>,
    /// The package is a directory on the local filesystem.
    pub is_local: bool,
    /// Directory of the unpacked package in the store.
    pub in_store_location: PathBuf,
    /// Build outputs keyed by engine name.
    pub cache_by_engine: BTreeMap<String, PathBuf>,
    /// Specifier to save in the manifest, for root dependencies.
    pub normalized_pref: Option<String>,
    /// Latest version published, if known.
    pub latest: Option<String>,
    pub fetching_files: StoreFuture<PackageFilesResponse>,
    pub finishing: StoreFuture<()>,
}

impl PackageResponse {
    /// The manifest, fetched if needed.
    pub async fn manifest(&self) -> Result<PackageManifest, SharedStoreError> {
        if let Some(manifest) = &self.manifest {
            return Ok(manifest.clone());
        }
        match &self.fetching_manifest {
            Some(fetching_manifest) => fetching_manifest.clone().await,
            None => Err(Arc::new(StoreError::Fetch {
                pkg_id: self.id.clone(),
                message: "the store returned no manifest".to_string(),
            })),
        }
    }
}

/// Options of [`StoreController::request_package`].
#[derive(Debug, Clone, Copy)]
pub struct RequestPackageOptions<'a> {
    pub registry: &'a str,
    /// Resolution recorded in the lockfile, if the dependency was locked.
    pub lockfile_resolution: Option<&'a LockfileResolution>,
    /// Id the lockfile resolved the dependency to.
    pub current_pkg_id: Option<&'a str>,
    /// Resolve again instead of trusting the lockfile.
    pub update: bool,
    /// Higher is fetched sooner.
    pub download_priority: i32,
    /// Root of the project the package is installed into.
    pub prefix: &'a Path,
    pub side_effects_cache: bool,
    /// Resolve only, without downloading content.
    pub skip_fetch: bool,
}

/// Changes of the packages a project uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionsUpdate {
    pub add: Vec<String>,
    pub remove: Vec<String>,
    /// Remove packages no project uses anymore.
    pub prune: bool,
}

/// Package store as seen by the installer.
#[async_trait]
pub trait StoreController: Send + Sync {
    async fn request_package(
        &self,
        wanted_dependency: &WantedDependency,
        options: RequestPackageOptions<'_>,
    ) -> Result<PackageResponse, StoreError>;

    async fn update_connections(
        &self,
        prefix: &Path,
        update: ConnectionsUpdate,
    ) -> Result<(), StoreError>;

    async fn save_state(&self) -> Result<(), StoreError>;
}
