use crate::errors::{HostError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Filesystem operations used by environment probing and teardown
pub trait FileSystemGateway: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn read_to_string(&self, path: &Path) -> Result<String>;

    fn write(&self, path: &Path, contents: &str) -> Result<()>;

    /// Immediate children of a directory, sorted
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Delete a directory tree: files first, then subdirectories, then the
    /// directory itself. Stops at the first failure with `RemovalFailure`.
    fn remove_tree(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// The real filesystem via `std::fs`
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn removal_failure(path: &Path, e: std::io::Error) -> HostError {
    warn!("[ENV] Failed to remove {:?}: {}", path, e);
    HostError::RemovalFailure {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

impl FileSystemGateway for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(std::fs::read_to_string(path)?)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(removal_failure(path, e)),
        };
        if !meta.is_dir() {
            return std::fs::remove_file(path).map_err(|e| removal_failure(path, e));
        }

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let entries = std::fs::read_dir(path).map_err(|e| removal_failure(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| removal_failure(path, e))?;
            let file_type = entry.file_type().map_err(|e| removal_failure(&entry.path(), e))?;
            // Symlinked directories are unlinked, never descended into
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }

        for file in &files {
            std::fs::remove_file(file).map_err(|e| removal_failure(file, e))?;
        }
        for dir in &dirs {
            self.remove_tree(dir)?;
        }
        std::fs::remove_dir(path).map_err(|e| removal_failure(path, e))?;
        debug!("[ENV] Removed {:?}", path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_tree_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("env");
        std::fs::create_dir_all(root.join("lib/site-packages/pkg")).unwrap();
        std::fs::write(root.join("pyvenv.cfg"), "version = 3.11.4\n").unwrap();
        std::fs::write(root.join("lib/site-packages/pkg/__init__.py"), "").unwrap();

        let fs = LocalFileSystem::new();
        fs.remove_tree(&root).unwrap();
        assert!(!root.exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_remove_missing_tree_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        LocalFileSystem::new()
            .remove_tree(&dir.path().join("nope"))
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_tree_does_not_follow_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("keep.txt"), "keep").unwrap();

        let root = dir.path().join("env");
        std::fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        LocalFileSystem::new().remove_tree(&root).unwrap();
        assert!(!root.exists());
        assert!(outside.join("keep.txt").exists());
    }

    #[test]
    fn test_write_creates_parents_and_list_dir_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new();
        fs.write(&dir.path().join("b/kernel.json"), "{}").unwrap();
        fs.write(&dir.path().join("a/kernel.json"), "{}").unwrap();

        let listed = fs.list_dir(dir.path()).unwrap();
        assert_eq!(listed, vec![dir.path().join("a"), dir.path().join("b")]);
        assert_eq!(fs.read_to_string(&dir.path().join("a/kernel.json")).unwrap(), "{}");
    }
}
