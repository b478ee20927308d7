use std::{env, path::Component, path::Path, path::PathBuf, str::FromStr};

use pipe_trait::Pipe;
use serde::{de, Deserialize, Deserializer};

// serde has no literal `default = true`.
pub fn bool_true() -> bool {
    true
}

pub fn default_child_concurrency() -> u64 {
    5
}

pub fn default_network_concurrency() -> u64 {
    16
}

pub fn default_link_concurrency() -> u64 {
    16
}

// Get the drive letter from a path on Windows. If it's not a Windows path, return None.
fn get_drive_letter(current_dir: &Path) -> Option<String> {
    current_dir.components().find_map(|component| match component {
        Component::Prefix(prefix) => prefix.as_os_str().to_string_lossy().replace(':', "").pipe(Some),
        _ => None,
    })
}

fn current_dir() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// If the $KNIT_HOME env variable is set, then $KNIT_HOME/store
/// If the $XDG_DATA_HOME env variable is set, then $XDG_DATA_HOME/knit/store
/// On Windows: ~/AppData/Local/knit/store
/// On macOS: ~/Library/knit/store
/// On Linux: ~/.local/share/knit/store
pub fn default_store_dir() -> PathBuf {
    if let Ok(knit_home) = env::var("KNIT_HOME") {
        return PathBuf::from(knit_home).join("store");
    }

    if let Ok(xdg_data_home) = env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home).join("knit/store");
    }

    let current_drive = get_drive_letter(&current_dir()).unwrap_or_default();

    // Using ~ (tilde) for defining home path is not supported in Rust and
    // needs to be resolved into an absolute path.
    let Some(home_dir) = home::home_dir() else {
        return current_dir().join(".knit-store");
    };
    // In case of Windows, the store has to be on the same drive as the project to allow hardlinks.
    let home_drive = get_drive_letter(&home_dir).unwrap_or_default();

    if current_drive != home_drive {
        return PathBuf::from(format!("{current_drive}:\\.knit-store"));
    }

    match env::consts::OS {
        "macos" => home_dir.join("Library/knit/store"),
        "windows" => home_dir.join("AppData/Local/knit/store"),
        _ => home_dir.join(".local/share/knit/store"),
    }
}

pub fn default_modules_dir() -> PathBuf {
    current_dir().join("node_modules")
}

pub fn default_registry() -> String {
    "https://registry.npmjs.org/".to_string()
}

pub fn deserialize_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    bool::from_str(&s).map_err(de::Error::custom)
}

pub fn deserialize_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u64::from_str(&s).map_err(de::Error::custom)
}

pub fn deserialize_pathbuf<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let path = PathBuf::from_str(&s).map_err(de::Error::custom)?;

    if path.is_absolute() {
        return Ok(path);
    }

    Ok(env::current_dir().map_err(de::Error::custom)?.join(path))
}

/// Add a trailing "/" to a registry URL if it doesn't have one.
pub fn normalize_registry(registry: &str) -> String {
    if registry.ends_with('/') {
        return registry.to_string();
    }
    format!("{registry}/")
}

pub fn deserialize_registry<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(|registry| normalize_registry(&registry))
}
