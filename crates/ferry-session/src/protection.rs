//! File protection for the transfer cache directory

use std::path::Path;

/// Applied to the cache directory before a session is created. Failures are
/// not fatal; a session runs against an unprotected directory.
pub trait DirectoryProtection: Send + Sync {
    fn protect(&self, path: &Path) -> std::io::Result<()>;
}

/// Restricts the directory to its owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnlyProtection;

impl DirectoryProtection for OwnerOnlyProtection {
    #[cfg(unix)]
    fn protect(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
    }

    #[cfg(not(unix))]
    fn protect(&self, _path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        OwnerOnlyProtection.protect(dir.path()).unwrap();

        let mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        if cfg!(unix) {
            assert!(OwnerOnlyProtection.protect(&missing).is_err());
        }
    }
}
