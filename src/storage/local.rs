use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::traits::Storage;

/// 本地文件系统存储实现（开发与单机部署）
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();

        // 确保基础目录存在
        std::fs::create_dir_all(&base_path).context("Failed to create base directory")?;

        Ok(Self { base_path })
    }

    /// 获取文件的完整路径，拒绝跳出根目录的键
    fn get_full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = key.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            anyhow::bail!("非法的存储键: {}", key);
        }
        Ok(self.base_path.join(relative))
    }

    /// 确保文件的父目录存在
    async fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create parent directory")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(&self, key: &str, data: &[u8], _content_type: Option<&str>) -> Result<()> {
        let path = self.get_full_path(key)?;

        self.ensure_parent_dir(&path).await?;

        // 先写临时文件再重命名，覆盖写入时读方不会看到半个文件
        let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("Failed to write file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to move file into place: {}", path.display()))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.get_full_path(key)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read file")?,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        self.base_path
            .try_exists()
            .context("Failed to check base directory")
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        let key = "ext1/D1.pdf";
        let data = b"%PDF-1.7";

        storage.put(key, data, Some("application/pdf")).await.unwrap();
        assert!(temp_dir.path().join(key).is_file());

        let retrieved = storage.get(key).await.unwrap().unwrap();
        assert_eq!(retrieved, data);

        // 覆盖写入
        storage.put(key, b"%PDF-2.0", None).await.unwrap();
        assert_eq!(storage.get(key).await.unwrap().unwrap(), b"%PDF-2.0");

        assert!(storage.get("ext1/missing.pdf").await.unwrap().is_none());
        assert!(storage.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();
        assert!(storage.get("../etc/passwd").await.is_err());
        assert!(storage.put("a/../../b", b"x", None).await.is_err());
    }
}
