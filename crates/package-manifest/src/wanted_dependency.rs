use derive_more::Display;

/// A dependency requested by a manifest or reconstructed from a lockfile entry.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[display("{raw}")]
pub struct WantedDependency {
    /// Name the dependency is imported as.
    pub alias: Option<String>,
    /// Version range, tag, or other specifier.
    pub pref: String,
    pub dev: bool,
    pub optional: bool,
    /// `alias@pref` as it would be typed on a command line.
    pub raw: String,
}

impl WantedDependency {
    pub fn new(alias: &str, pref: &str, dev: bool, optional: bool) -> Self {
        WantedDependency {
            alias: Some(alias.to_string()),
            pref: pref.to_string(),
            dev,
            optional,
            raw: format!("{alias}@{pref}"),
        }
    }

    /// A dependency known only by name, e.g. rebuilt from lockfile references.
    pub fn from_alias(alias: &str, optional: bool) -> Self {
        WantedDependency {
            alias: Some(alias.to_string()),
            pref: String::new(),
            dev: false,
            optional,
            raw: alias.to_string(),
        }
    }
}
