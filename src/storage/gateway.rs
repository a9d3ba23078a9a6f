use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::traits::Storage;
use crate::model::StoredFile;
use crate::pipeline::error::{PipelineError, PipelineResult, Step};
use crate::util::logging::standards::events;

/// 流水线访问对象存储的唯一入口
///
/// 源文件从可信桶读取，转换结果写入转换桶，两者可以是同一个后端。
/// 所有调用都有超时，失败统一归类为 `PipelineError`。
#[derive(Clone)]
pub struct ObjectStoreGateway {
    source: Arc<dyn Storage>,
    target: Arc<dyn Storage>,
    timeout: Duration,
}

impl ObjectStoreGateway {
    pub fn new(source: Arc<dyn Storage>, target: Arc<dyn Storage>, timeout: Duration) -> Self {
        Self {
            source,
            target,
            timeout,
        }
    }

    /// 读写同一个后端
    pub fn single(storage: Arc<dyn Storage>, timeout: Duration) -> Self {
        Self::new(storage.clone(), storage, timeout)
    }

    pub async fn fetch(&self, key: &str) -> PipelineResult<StoredFile> {
        let result = tokio::time::timeout(self.timeout, self.source.get(key)).await;

        match result {
            Err(_) => {
                warn!(
                    event = events::STORAGE_FAILED,
                    step = "fetch",
                    key = %key,
                    backend = self.source.backend(),
                    "[fail] 读取源文件超时"
                );
                Err(PipelineError::timeout(Step::Fetch, self.timeout.as_secs()))
            }
            Ok(Err(e)) => {
                warn!(
                    event = events::STORAGE_FAILED,
                    step = "fetch",
                    key = %key,
                    backend = self.source.backend(),
                    error = %e,
                    "[fail] 读取源文件失败"
                );
                Err(PipelineError::transport(Step::Fetch, format!("{:#}", e)))
            }
            Ok(Ok(None)) => Err(PipelineError::NotFound {
                key: key.to_string(),
            }),
            Ok(Ok(Some(bytes))) => Ok(StoredFile::from_key(key, bytes)),
        }
    }

    /// 写入转换结果，返回写入的键；同键覆盖
    pub async fn store(&self, file: &StoredFile) -> PipelineResult<String> {
        let put = self
            .target
            .put(&file.key, &file.bytes, Some(file.content_type.as_str()));

        match tokio::time::timeout(self.timeout, put).await {
            Err(_) => {
                warn!(
                    event = events::STORAGE_FAILED,
                    step = "store",
                    key = %file.key,
                    backend = self.target.backend(),
                    "[fail] 写入转换结果超时"
                );
                Err(PipelineError::timeout(Step::Store, self.timeout.as_secs()))
            }
            Ok(Err(e)) => {
                warn!(
                    event = events::STORAGE_FAILED,
                    step = "store",
                    key = %file.key,
                    backend = self.target.backend(),
                    error = %e,
                    "[fail] 写入转换结果失败"
                );
                Err(PipelineError::transport(Step::Store, format!("{:#}", e)))
            }
            Ok(Ok(())) => Ok(file.key.clone()),
        }
    }

    pub async fn health_check(&self) -> anyhow::Result<bool> {
        let source_ok = self.source.health_check().await?;
        let target_ok = self.target.health_check().await?;
        Ok(source_ok && target_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct SlowStorage;

    #[async_trait]
    impl Storage for SlowStorage {
        async fn put(&self, _key: &str, _data: &[u8], _ct: Option<&str>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        async fn get(&self, _key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn health_check(&self) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn backend(&self) -> &'static str {
            "slow"
        }
    }

    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn put(&self, _key: &str, _data: &[u8], _ct: Option<&str>) -> anyhow::Result<()> {
            anyhow::bail!("access denied")
        }
        async fn get(&self, _key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            anyhow::bail!("connection reset")
        }
        async fn health_check(&self) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_fetch_and_store() {
        let source_dir = TempDir::new().unwrap();
        let target_dir = TempDir::new().unwrap();
        let source = Arc::new(LocalStorage::new(source_dir.path()).unwrap());
        let target = Arc::new(LocalStorage::new(target_dir.path()).unwrap());
        source
            .put("uploads/Contract.DOCX", b"docx-bytes", None)
            .await
            .unwrap();

        let gateway = ObjectStoreGateway::new(source, target.clone(), Duration::from_secs(5));

        let file = gateway.fetch("uploads/Contract.DOCX").await.unwrap();
        assert_eq!(file.display_name, "Contract.DOCX");
        assert_eq!(file.format, "docx");
        assert_eq!(file.bytes, b"docx-bytes");

        let pdf = StoredFile::new("ext1/D1.pdf", "D1.pdf", b"%PDF".to_vec(), "pdf", "application/pdf");
        let key = gateway.store(&pdf).await.unwrap();
        assert_eq!(key, "ext1/D1.pdf");
        assert_eq!(target.get("ext1/D1.pdf").await.unwrap().unwrap(), b"%PDF");
        assert!(gateway.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let gateway = ObjectStoreGateway::single(
            Arc::new(LocalStorage::new(dir.path()).unwrap()),
            Duration::from_secs(5),
        );
        let err = gateway.fetch("nope/none.docx").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { ref key } if key == "nope/none.docx"));
    }

    #[tokio::test]
    async fn test_backend_errors_are_transport() {
        let gateway = ObjectStoreGateway::single(Arc::new(BrokenStorage), Duration::from_secs(5));
        let err = gateway.fetch("a.docx").await.unwrap_err();
        assert!(matches!(err, PipelineError::Transport { step: Step::Fetch, .. }));

        let file = StoredFile::from_key("ext1/D1.pdf", b"x".to_vec());
        let err = gateway.store(&file).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transport { step: Step::Store, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_transport() {
        let gateway = ObjectStoreGateway::single(Arc::new(SlowStorage), Duration::from_secs(1));
        let err = gateway.fetch("a.docx").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("超时"));

        let file = StoredFile::from_key("ext1/D1.pdf", b"x".to_vec());
        let err = gateway.store(&file).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transport { step: Step::Store, .. }));
    }
}
