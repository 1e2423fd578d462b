//! Public file storage rooted at a single directory.
//!
//! Keys are relative, `/`-separated paths such as `users/avatar.webp`. Keys
//! that are absolute or contain `..` are rejected before touching the disk.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    public_url: String,
}

#[derive(Debug, thiserror::Error)]
#[error("storage key `{0}` escapes the storage root")]
pub struct InvalidKey(pub String);

impl Storage {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, InvalidKey> {
        let relative = Path::new(key.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => return Err(InvalidKey(key.to_string())),
            }
        }
        if depth == 0 {
            return Err(InvalidKey(key.to_string()));
        }
        Ok(resolved)
    }

    pub async fn put(&self, key: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory for {key}"))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {key}"))
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.resolve(key) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Removes the object if present. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("Failed to delete {key}")),
        }
    }

    pub fn url(&self, key: &str) -> String {
        format!("{}/{}", self.public_url, key.trim_start_matches('/'))
    }
}

/// Joins a folder and a file name into a storage key.
pub fn key(folder: &str, file_name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        file_name.to_string()
    } else {
        format!("{folder}/{file_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> (Storage, PathBuf) {
        let root = std::env::temp_dir().join(format!("medbook-storage-{}", uuid::Uuid::new_v4()));
        (Storage::new(&root, "http://cdn.test/storage/"), root)
    }

    #[tokio::test]
    async fn put_exists_delete() {
        let (storage, root) = temp_storage();
        storage.put("users/a.txt", b"hello").await.unwrap();
        assert!(storage.exists("users/a.txt").await);
        storage.delete("users/a.txt").await.unwrap();
        assert!(!storage.exists("users/a.txt").await);
        storage.delete("users/a.txt").await.unwrap();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (storage, _root) = temp_storage();
        assert!(storage.put("../escape.txt", b"x").await.is_err());
        assert!(storage.put("users/../../escape.txt", b"x").await.is_err());
        assert!(!storage.exists("../../etc/passwd").await);
        assert!(storage.delete("").await.is_err());
    }

    #[test]
    fn urls_and_keys() {
        let (storage, _root) = temp_storage();
        assert_eq!(storage.url("users/a.webp"), "http://cdn.test/storage/users/a.webp");
        assert_eq!(key("/users/", "a.webp"), "users/a.webp");
        assert_eq!(key("", "a.webp"), "a.webp");
    }
}
