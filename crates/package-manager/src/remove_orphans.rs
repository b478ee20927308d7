use crate::symlink_package::remove_link;
use derive_more::{Display, Error};
use futures_util::future;
use knit_lockfile::{dependency_path, Lockfile};
use knit_package_manifest::PackageManifest;
use knit_store_controller::{ConnectionsUpdate, StoreController, StoreError};
use miette::Diagnostic;
use pipe_trait::Pipe;
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

/// Error type of [`RemoveOrphans`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum RemoveOrphansError {
    #[display("Failed to remove {path:?}: {error}")]
    #[diagnostic(code(knit_package_manager::remove_orphan))]
    Remove {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[diagnostic(transparent)]
    Store(#[error(source)] StoreError),
}

/// Remove from the modules dir what the previous install created and the new lockfile no longer has.
#[must_use]
pub struct RemoveOrphans<'a> {
    /// Lockfile describing what is currently installed.
    pub old_lockfile: &'a Lockfile,
    pub new_lockfile: &'a Lockfile,
    pub prefix: &'a Path,
    pub modules_dir: &'a Path,
    pub bin_dir: &'a Path,
    pub store: &'a dyn StoreController,
    /// Aliases of flattened packages, by package id. Entries of removed packages are dropped.
    pub flattened_aliases_by_id: &'a mut BTreeMap<String, String>,
    /// Only compute what would be removed.
    pub dry_run: bool,
}

impl<'a> RemoveOrphans<'a> {
    /// Execute the subroutine and return the ids of the removed packages.
    pub async fn run(self) -> Result<BTreeSet<String>, RemoveOrphansError> {
        let RemoveOrphans {
            old_lockfile,
            new_lockfile,
            prefix,
            modules_dir,
            bin_dir,
            store,
            flattened_aliases_by_id,
            dry_run,
        } = self;

        let new_root_dependencies = new_lockfile.root_dependencies();
        let removed_aliases: Vec<String> = old_lockfile
            .root_dependencies()
            .into_iter()
            .filter(|(alias, reference)| new_root_dependencies.get(alias) != Some(reference))
            .map(|(alias, _)| alias)
            .collect();

        let old_ids = package_ids(old_lockfile);
        let new_ids = package_ids(new_lockfile);
        let removed_ids: BTreeSet<String> = old_ids.difference(&new_ids).cloned().collect();
        tracing::debug!(target: "knit::prune", removed = removed_ids.len());

        if dry_run {
            return Ok(removed_ids);
        }

        for alias in &removed_aliases {
            remove_top_dependency(alias, modules_dir, bin_dir)?;
        }

        for id in &removed_ids {
            if let Some(alias) = flattened_aliases_by_id.remove(id) {
                remove_top_dependency(&alias, modules_dir, bin_dir)?;
            }
        }

        removed_ids
            .par_iter()
            .map(|id| modules_dir.join(format!(".{}", dependency_path::pkg_id_to_filename(id))))
            .try_for_each(|path| match fs::remove_dir_all(&path) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                Err(error) => Err(RemoveOrphansError::Remove { path, error }),
            })?;

        let update = ConnectionsUpdate {
            add: new_ids.difference(&old_ids).cloned().collect(),
            remove: removed_ids.iter().cloned().collect(),
            prune: false,
        };
        store.update_connections(prefix, update).await.map_err(RemoveOrphansError::Store)?;
        store.save_state().await.map_err(RemoveOrphansError::Store)?;

        Ok(removed_ids)
    }
}

/// Ids of every package of a lockfile.
fn package_ids(lockfile: &Lockfile) -> BTreeSet<String> {
    lockfile
        .packages
        .iter()
        .map(|(path, snapshot)| match &snapshot.id {
            Some(id) => id.clone(),
            None => dependency_path::resolve(&lockfile.registry, path),
        })
        .collect()
}

/// Unlink a root dependency and the commands it provided.
fn remove_top_dependency(alias: &str, modules_dir: &Path, bin_dir: &Path) -> Result<(), RemoveOrphansError> {
    let link = modules_dir.join(alias);
    let bins = match PackageManifest::from_path(&link.join("package.json")) {
        Ok(manifest) => manifest.bins(),
        Err(error) => {
            tracing::debug!(target: "knit::prune", %error, "No commands to unlink");
            Vec::new()
        }
    };

    let bin_paths = bins
        .into_iter()
        .flat_map(|(command, _)| {
            let path = bin_dir.join(command);
            [path.with_extension("cmd"), path]
        })
        .collect::<Vec<_>>();
    for path in bin_paths {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(RemoveOrphansError::Remove { path, error }),
        }
    }

    match remove_link(&link) {
        Ok(()) => {
            tracing::info!(target: "knit::prune", removed = alias);
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(RemoveOrphansError::Remove { path: link, error }),
    }
}

/// Remove the flattened aliases that no longer point to a package of the graph.
pub async fn remove_stale_flattened_aliases(
    modules_dir: &Path,
    stale_aliases: impl IntoIterator<Item = String>,
) -> Result<(), RemoveOrphansError> {
    stale_aliases
        .into_iter()
        .map(|alias| async move {
            let link = modules_dir.join(&alias);
            match tokio::fs::symlink_metadata(&link).await {
                Ok(_) => remove_link(&link).map_err(|error| RemoveOrphansError::Remove { path: link, error }),
                Err(_) => Ok(()),
            }
        })
        .pipe(future::try_join_all)
        .await
        .map(drop)
}
