use async_trait::async_trait;
use knit_lockfile::{
    dependency_path, registry_tarball_url, DirectoryResolution, LockfileResolution,
    TarballResolution,
};
use knit_package_manifest::{PackageManifest, WantedDependency};
use knit_store_controller::{
    ready, ConnectionsUpdate, PackageFilesResponse, PackageResponse, RequestPackageOptions,
    StoreController, StoreError,
};
use node_semver::{Range, Version};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

/// Parse a `package.json` written inline in a test.
pub fn manifest_from_json(json: &str) -> PackageManifest {
    serde_json::from_str(json).expect("parse manifest JSON")
}

/// In-memory registry and store.
///
/// Requested packages are materialized under `store_dir` with their `package.json` and any extra
/// files registered through [`MockStore::add_file`].
pub struct MockStore {
    store_dir: PathBuf,
    /// Versions of every package, by name.
    packages: BTreeMap<String, Vec<PackageManifest>>,
    /// Extra files of a package, by `name@version`.
    files: BTreeMap<String, Vec<(String, String)>>,
    /// Manifests of local directories, by specifier (e.g. `file:../foo`).
    local_packages: BTreeMap<String, PackageManifest>,
    failing: HashSet<String>,
    requests: Mutex<Vec<String>>,
    connections: Mutex<Vec<ConnectionsUpdate>>,
    saved_states: AtomicUsize,
}

impl MockStore {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        MockStore {
            store_dir: store_dir.into(),
            packages: BTreeMap::new(),
            files: BTreeMap::new(),
            local_packages: BTreeMap::new(),
            failing: HashSet::new(),
            requests: Mutex::default(),
            connections: Mutex::default(),
            saved_states: AtomicUsize::new(0),
        }
    }

    /// Publish a version of a package.
    pub fn add_package(&mut self, manifest: &str) -> &mut Self {
        let manifest = manifest_from_json(manifest);
        self.packages.entry(manifest.name.clone()).or_default().push(manifest);
        self
    }

    /// Ship a file with a published version.
    pub fn add_file(&mut self, name: &str, version: &str, path: &str, content: &str) -> &mut Self {
        self.files
            .entry(format!("{name}@{version}"))
            .or_default()
            .push((path.to_string(), content.to_string()));
        self
    }

    /// Make a `file:` specifier resolve to a local directory with this manifest.
    pub fn add_local_package(&mut self, specifier: &str, manifest: &str) -> &mut Self {
        self.local_packages.insert(specifier.to_string(), manifest_from_json(manifest));
        self
    }

    /// Make every request of a package fail.
    pub fn fail_package(&mut self, name: &str) -> &mut Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Raw specifiers of every request, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("lock requests").clone()
    }

    pub fn connections(&self) -> Vec<ConnectionsUpdate> {
        self.connections.lock().expect("lock connections").clone()
    }

    pub fn saved_states(&self) -> usize {
        self.saved_states.load(Ordering::SeqCst)
    }

    fn pick_version(&self, name: &str, pref: &str, locked_version: Option<&str>) -> Option<&PackageManifest> {
        let versions = self.packages.get(name)?;
        let parsed = |manifest: &PackageManifest| Version::parse(&manifest.version).ok();
        if let Some(locked) = locked_version {
            return versions.iter().find(|manifest| manifest.version == locked);
        }
        let range = match pref {
            "" | "latest" | "*" => None,
            pref => Some(pref.parse::<Range>().ok()?),
        };
        versions
            .iter()
            .filter_map(|manifest| Some((parsed(manifest)?, manifest)))
            .filter(|(version, _)| range.as_ref().map_or(true, |range| version.satisfies(range)))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, manifest)| manifest)
    }

    fn latest_version(&self, name: &str) -> Option<String> {
        self.pick_version(name, "latest", None).map(|manifest| manifest.version.clone())
    }

    fn materialize(&self, manifest: &PackageManifest, location: &Path) -> Result<bool, StoreError> {
        let io_error = |error| StoreError::Io { path: location.to_path_buf(), error };
        let manifest_path = location.join("package.json");
        if manifest_path.exists() {
            return Ok(true);
        }
        fs::create_dir_all(location).map_err(io_error)?;
        let extra_files = self
            .files
            .get(&format!("{}@{}", manifest.name, manifest.version))
            .into_iter()
            .flatten();
        for (path, content) in extra_files {
            let path = location.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
            fs::write(path, content).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(manifest).expect("serialize manifest");
        fs::write(manifest_path, json).map_err(io_error)?;
        Ok(false)
    }

    fn local_response(&self, specifier: &str, manifest: &PackageManifest, prefix: &Path) -> PackageResponse {
        let directory = specifier.trim_start_matches("file:");
        PackageResponse {
            id: specifier.to_string(),
            resolution: DirectoryResolution { directory: directory.to_string() }.into(),
            manifest: Some(manifest.clone()),
            fetching_manifest: None,
            is_local: true,
            in_store_location: prefix.join(directory),
            cache_by_engine: BTreeMap::new(),
            normalized_pref: Some(specifier.to_string()),
            latest: None,
            fetching_files: ready(PackageFilesResponse { from_store: true }),
            finishing: ready(()),
        }
    }
}

#[async_trait]
impl StoreController for MockStore {
    async fn request_package(
        &self,
        wanted_dependency: &WantedDependency,
        options: RequestPackageOptions<'_>,
    ) -> Result<PackageResponse, StoreError> {
        self.requests.lock().expect("lock requests").push(wanted_dependency.raw.clone());

        if let Some(manifest) = self.local_packages.get(&wanted_dependency.pref) {
            return Ok(self.local_response(&wanted_dependency.pref, manifest, options.prefix));
        }

        let name = wanted_dependency.alias.as_deref().unwrap_or_default();
        if self.failing.contains(name) {
            return Err(StoreError::Fetch {
                pkg_id: name.to_string(),
                message: "mocked network failure".to_string(),
            });
        }

        let locked_version = options
            .current_pkg_id
            .filter(|_| !options.update)
            .and_then(|id| dependency_path::parse(id).ok())
            .and_then(|parsed| parsed.version);
        let manifest = self
            .pick_version(name, &wanted_dependency.pref, locked_version)
            .ok_or_else(|| StoreError::NoMatchingVersion { raw: wanted_dependency.raw.clone() })?;

        let id = dependency_path::resolve(
            options.registry,
            &format!("/{}/{}", manifest.name, manifest.version),
        );
        let in_store_location =
            self.store_dir.join(dependency_path::pkg_id_to_filename(&id)).join("package");
        let from_store = match options.skip_fetch {
            true => true,
            false => self.materialize(manifest, &in_store_location)?,
        };
        let integrity = serde_json::to_string(manifest).expect("serialize manifest");
        let resolution: LockfileResolution = TarballResolution {
            tarball: registry_tarball_url(options.registry, &manifest.name, &manifest.version),
            integrity: Some(ssri::Integrity::from(integrity)),
            registry: Some(options.registry.to_string()),
        }
        .into();

        Ok(PackageResponse {
            id,
            resolution,
            manifest: Some(manifest.clone()),
            fetching_manifest: None,
            is_local: false,
            in_store_location,
            cache_by_engine: BTreeMap::new(),
            normalized_pref: Some(format!("^{}", manifest.version)),
            latest: self.latest_version(name),
            fetching_files: ready(PackageFilesResponse { from_store }),
            finishing: ready(()),
        })
    }

    async fn update_connections(
        &self,
        _prefix: &Path,
        update: ConnectionsUpdate,
    ) -> Result<(), StoreError> {
        self.connections.lock().expect("lock connections").push(update);
        Ok(())
    }

    async fn save_state(&self) -> Result<(), StoreError> {
        self.saved_states.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
