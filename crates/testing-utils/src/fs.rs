use std::{
    io,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

fn normalized_suffix(path: &Path, prefix: &Path) -> String {
    path.strip_prefix(prefix)
        .expect("strip prefix from path")
        .to_str()
        .expect("convert suffix to UTF-8")
        .replace('\\', "/")
}

/// Every directory and symlink under `root`, relative to it, without following symlinks.
pub fn get_all_folders(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| entry.expect("access entry"))
        .filter(|entry| entry.file_type().is_dir() || entry.file_type().is_symlink())
        .map(|entry| normalized_suffix(entry.path(), root))
        .filter(|suffix| !suffix.is_empty())
        .collect()
}

/// Every regular file under `root`, relative to it, without following symlinks.
pub fn get_all_files(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| entry.expect("access entry"))
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| normalized_suffix(entry.path(), root))
        .collect()
}

// Helper function to check if a path is a symlink or junction
pub fn is_symlink_or_junction(path: &Path) -> io::Result<bool> {
    #[cfg(windows)]
    return junction::exists(path);

    #[cfg(not(windows))]
    return Ok(path.is_symlink());
}

/// Where a symlink or junction points to.
pub fn read_link_target(path: &Path) -> io::Result<PathBuf> {
    #[cfg(windows)]
    return junction::get_target(path);

    #[cfg(not(windows))]
    return std::fs::read_link(path);
}
