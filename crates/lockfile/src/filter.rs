use crate::{dependency_path, Lockfile};
use std::collections::{BTreeMap, HashSet};

/// Which parts of a lockfile are installed.
#[derive(Debug, Clone, Copy)]
pub struct LockfileFilter<'a> {
    /// Ids of packages not installed on this machine.
    pub skipped: &'a HashSet<String>,
    pub production: bool,
    pub development: bool,
    pub optional: bool,
}

impl LockfileFilter<'_> {
    /// Whether every dependency group is installed.
    pub fn is_complete(&self) -> bool {
        self.production && self.development && self.optional
    }
}

impl Lockfile {
    /// Copy of the lockfile without the packages excluded by `filter`.
    pub fn filter(&self, filter: &LockfileFilter) -> Lockfile {
        let packages = self
            .packages
            .iter()
            .filter(|(path, snapshot)| {
                let id = match &snapshot.id {
                    Some(id) => id.clone(),
                    None => dependency_path::resolve(&self.registry, path),
                };
                !filter.skipped.contains(&id)
            })
            .filter(|(_, snapshot)| filter.production || snapshot.dev != Some(false) || snapshot.is_optional())
            .filter(|(_, snapshot)| filter.development || snapshot.dev != Some(true))
            .filter(|(_, snapshot)| filter.optional || !snapshot.is_optional())
            .map(|(path, snapshot)| (path.clone(), snapshot.clone()))
            .collect();

        let keep_if = |enabled: bool, map: &BTreeMap<String, String>| {
            if enabled {
                map.clone()
            } else {
                BTreeMap::new()
            }
        };

        Lockfile {
            lockfile_version: self.lockfile_version,
            lockfile_minor_version: self.lockfile_minor_version,
            registry: self.registry.clone(),
            specifiers: self.specifiers.clone(),
            dependencies: keep_if(filter.production, &self.dependencies),
            dev_dependencies: keep_if(filter.development, &self.dev_dependencies),
            optional_dependencies: keep_if(filter.optional, &self.optional_dependencies),
            packages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use text_block_macros::text_block;

    fn lockfile() -> Lockfile {
        let yaml = text_block! {
            "lockfileVersion: 3"
            "registry: https://registry.npmjs.org/"
            "dependencies:"
            "  prod: 1.0.0"
            "devDependencies:"
            "  dev: 1.0.0"
            "optionalDependencies:"
            "  opt: 1.0.0"
            "packages:"
            "  /prod/1.0.0:"
            "    resolution:"
            "      tarball: file:prod.tgz"
            "    dev: false"
            "  /dev/1.0.0:"
            "    resolution:"
            "      tarball: file:dev.tgz"
            "    dev: true"
            "  /opt/1.0.0:"
            "    resolution:"
            "      tarball: file:opt.tgz"
            "    dev: false"
            "    optional: true"
            "  /both/1.0.0:"
            "    resolution:"
            "      tarball: file:both.tgz"
            "  /aliased/1.0.0:"
            "    resolution:"
            "      tarball: file:aliased.tgz"
            "    id: example.com/aliased/1.0.0"
        };
        serde_yaml::from_str(yaml).unwrap()
    }

    fn paths(lockfile: &Lockfile) -> Vec<&str> {
        lockfile.packages.keys().map(String::as_str).collect()
    }

    #[test]
    fn filter_by_groups() {
        let skipped = HashSet::new();
        let filter = |production, development, optional| LockfileFilter {
            skipped: &skipped,
            production,
            development,
            optional,
        };

        eprintln!("CASE: everything");
        let received = lockfile().filter(&filter(true, true, true));
        assert!(filter(true, true, true).is_complete());
        assert_eq!(paths(&received), ["/aliased/1.0.0", "/both/1.0.0", "/dev/1.0.0", "/opt/1.0.0", "/prod/1.0.0"]);

        eprintln!("CASE: no production");
        let received = lockfile().filter(&filter(false, true, true));
        assert_eq!(paths(&received), ["/aliased/1.0.0", "/both/1.0.0", "/dev/1.0.0", "/opt/1.0.0"]);
        assert!(received.dependencies.is_empty());
        assert_eq!(received.dev_dependencies.len(), 1);

        eprintln!("CASE: no development");
        let received = lockfile().filter(&filter(true, false, true));
        assert_eq!(paths(&received), ["/aliased/1.0.0", "/both/1.0.0", "/opt/1.0.0", "/prod/1.0.0"]);
        assert!(received.dev_dependencies.is_empty());

        eprintln!("CASE: no optional");
        let received = lockfile().filter(&filter(true, true, false));
        assert_eq!(paths(&received), ["/aliased/1.0.0", "/both/1.0.0", "/dev/1.0.0", "/prod/1.0.0"]);
        assert!(received.optional_dependencies.is_empty());
    }

    #[test]
    fn filter_skipped_by_id() {
        let skipped: HashSet<String> =
            ["registry.npmjs.org/both/1.0.0".to_string(), "example.com/aliased/1.0.0".to_string()]
                .into_iter()
                .collect();
        let filter = LockfileFilter { skipped: &skipped, production: true, development: true, optional: true };
        let received = lockfile().filter(&filter);
        assert_eq!(paths(&received), ["/dev/1.0.0", "/opt/1.0.0", "/prod/1.0.0"]);
    }
}
