//! File system abstraction for testability.

use async_trait::async_trait;
use std::path::Path;

/// Abstraction over the file operations the download manager performs.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Returns the size of a file if it exists.
    async fn file_size(&self, path: &Path) -> Option<u64>;

    /// Returns true if a file exists and is not empty.
    async fn has_content(&self, path: &Path) -> bool {
        self.file_size(path).await.is_some_and(|size| size > 0)
    }

    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Creates (or truncates) a file for writing.
    async fn create_file(&self, path: &Path) -> std::io::Result<tokio::fs::File>;

    /// Renames `from` to `to`, replacing `to` if it exists.
    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Creates a new `TokioFileSystem` instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path)
            .await
            .ok()
            .filter(std::fs::Metadata::is_file)
            .map(|m| m.len())
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn create_file(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::create(path).await
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn tokio_fs_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"hello").unwrap();

        let fs = TokioFileSystem::new();
        assert_eq!(fs.file_size(&path).await, Some(5));
        assert_eq!(
            fs.file_size(&dir.path().join("nonexistent.txt")).await,
            None
        );
        // Directories are not files
        assert_eq!(fs.file_size(dir.path()).await, None);
    }

    #[tokio::test]
    async fn tokio_fs_has_content_ignores_empty_files() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.bin");
        std::fs::File::create(&empty).unwrap();
        let full = dir.path().join("full.bin");
        std::fs::write(&full, b"x").unwrap();

        let fs = TokioFileSystem::new();
        assert!(!fs.has_content(&empty).await);
        assert!(fs.has_content(&full).await);
        assert!(!fs.has_content(&dir.path().join("missing")).await);
    }

    #[tokio::test]
    async fn tokio_fs_create_dir_all() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");

        let fs = TokioFileSystem::new();
        fs.create_dir_all(&nested).await.unwrap();
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn tokio_fs_rename_and_remove() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("file.part");
        let to = dir.path().join("file");
        std::fs::write(&to, b"old").unwrap();

        let fs = TokioFileSystem::new();
        drop(fs.create_file(&from).await.unwrap());
        fs.rename_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::metadata(&to).unwrap().len(), 0);

        fs.remove_file(&to).await.unwrap();
        assert!(!to.exists());
    }
}
