mod import_dir;
mod same_file;

pub use import_dir::{import_dir, ImportDirError, ImportMethod};
pub use same_file::is_same_file;

use std::{io, path::Path};

/// Create a symlink to a directory.
///
/// The `link` path will be a symbolic link pointing to `original`.
pub fn symlink_dir(original: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    return std::os::unix::fs::symlink(original, link);
    #[cfg(windows)]
    return junction::create(original, link); // junctions instead of symlinks because symlinks may require elevated privileges.
}

/// Add the executable bits to a file on POSIX platforms such as Linux or macOS,
/// or do nothing on Windows.
#[cfg_attr(windows, allow(unused))]
pub fn make_file_executable(file_path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    return {
        use std::{
            fs::{metadata, set_permissions, Permissions},
            os::unix::fs::PermissionsExt,
        };
        let mode = metadata(file_path)?.permissions().mode() | 0o111;
        set_permissions(file_path, Permissions::from_mode(mode))
    };

    #[cfg(windows)]
    return Ok(());
}

/// Whether an error was caused by linking across two filesystems (`EXDEV`).
pub fn is_cross_device_error(error: &io::Error) -> bool {
    #[cfg(unix)]
    return error.raw_os_error() == Some(18);
    #[cfg(windows)]
    return error.raw_os_error() == Some(17); // ERROR_NOT_SAME_DEVICE
}
