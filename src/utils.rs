use anyhow::{Context, Result};
use std::{
    fs::{self, DirBuilder, Permissions},
    io::ErrorKind,
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::Path,
};
use walkdir::WalkDir;

/// Removes a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Creates a directory (and missing parents) with the given mode. Existing directories are left as is.
pub fn create_directory_recursive(path: &Path, mode: u32) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Strips group and other permission bits from every entry below `root`, like `chmod -R go=`.
///
/// Symlinks are skipped, their targets are never touched.
pub fn restrict_to_owner(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;

        if entry.file_type().is_symlink() {
            continue;
        }

        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let mode = metadata.permissions().mode() & !0o077;

        fs::set_permissions(entry.path(), Permissions::from_mode(mode))
            .with_context(|| format!("Failed to chmod {}", entry.path().display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_remove_if_exists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("X0");

        assert!(!remove_if_exists(&path)?);

        File::create(&path)?;
        assert!(remove_if_exists(&path)?);
        assert!(!path.exists());

        Ok(())
    }

    #[test]
    fn test_restrict_to_owner_is_recursive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("a").join("b");
        create_directory_recursive(&nested, 0o755)?;

        let file = nested.join("file");
        File::create(&file)?;
        fs::set_permissions(&file, Permissions::from_mode(0o664))?;

        restrict_to_owner(&dir.path().join("a"))?;

        assert_eq!(fs::metadata(&nested)?.permissions().mode() & 0o777, 0o700);
        assert_eq!(fs::metadata(&file)?.permissions().mode() & 0o777, 0o600);

        Ok(())
    }
}
