use std::{io, path::Path};

/// Whether two paths refer to the same file on disk (same device and inode).
///
/// Windows has no stable way to compare file indices, so it always reports `false`
/// and callers fall back to re-importing.
pub fn is_same_file(a: &Path, b: &Path) -> io::Result<bool> {
    #[cfg(unix)]
    return {
        use std::os::unix::fs::MetadataExt;
        let a = a.metadata()?;
        let b = b.metadata()?;
        Ok(a.dev() == b.dev() && a.ino() == b.ino())
    };

    #[cfg(windows)]
    return {
        let _ = (a.metadata()?, b.metadata()?);
        Ok(false)
    };
}
