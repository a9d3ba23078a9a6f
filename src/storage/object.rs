use anyhow::{Context, Result};
use async_trait::async_trait;
use opendal::services::{Oss as OssService, S3 as S3Service};
use opendal::{ErrorKind, Operator};
use std::time::Instant;
use tracing::{debug, error, info};

use super::factory::{OssConfig, S3Config};
use super::traits::Storage;

/// 基于 OpenDAL 的对象存储实现（阿里云 OSS / S3 兼容）
pub struct ObjectStorage {
    operator: Operator,
    backend: &'static str,
    bucket: String,
    endpoint: String,
}

impl ObjectStorage {
    pub fn oss(config: &OssConfig) -> Result<Self> {
        info!(
            "[tool] 配置OSS服务: endpoint={}, bucket={}",
            config.endpoint, config.bucket
        );

        let builder = OssService::default()
            .root(config.root.as_deref().unwrap_or_default())
            .bucket(&config.bucket)
            .endpoint(&config.endpoint)
            .access_key_id(&config.access_key_id)
            .access_key_secret(&config.access_key_secret);

        let operator = Operator::new(builder)
            .context("Failed to build OSS operator")?
            .finish();

        Ok(Self {
            operator,
            backend: "oss",
            bucket: config.bucket.clone(),
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn s3(config: &S3Config) -> Result<Self> {
        info!(
            "[tool] 配置S3服务: region={}, bucket={}, endpoint={:?}",
            config.region, config.bucket, config.endpoint
        );

        let mut builder = S3Service::default()
            .root(config.root.as_deref().unwrap_or_default())
            .bucket(&config.bucket)
            .region(&config.region);

        if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            builder = builder.endpoint(endpoint);
        }

        // 未配置密钥时走默认凭证链（实例角色 / 环境变量）
        if let (Some(key_id), Some(secret)) = (
            config.access_key_id.as_deref(),
            config.secret_access_key.as_deref(),
        ) {
            builder = builder.access_key_id(key_id).secret_access_key(secret);
        }

        let operator = Operator::new(builder)
            .context("Failed to build S3 operator")?
            .finish();

        Ok(Self {
            operator,
            backend: "s3",
            bucket: config.bucket.clone(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("s3.{}.amazonaws.com", config.region)),
        })
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    async fn put(&self, key: &str, data: &[u8], content_type: Option<&str>) -> Result<()> {
        let start = Instant::now();
        debug!(
            "[upload] {}写入: key={}, size={}字节, bucket={}",
            self.backend,
            key,
            data.len(),
            self.bucket
        );

        let result = match content_type {
            Some(content_type) => {
                self.operator
                    .write_with(key, data.to_vec())
                    .content_type(content_type)
                    .await
            }
            None => self.operator.write(key, data.to_vec()).await,
        };

        match result {
            Ok(_) => {
                info!(
                    "[ok] {}写入成功: {}, 用时: {:?}",
                    self.backend,
                    key,
                    start.elapsed()
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "[fail] {}写入失败: key={}, kind={:?}, endpoint={}, error={}",
                    self.backend,
                    key,
                    e.kind(),
                    self.endpoint,
                    e
                );
                Err(e).context("Failed to write object")
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let start = Instant::now();
        match self.operator.read(key).await {
            Ok(data) => {
                info!(
                    "[download] {}读取成功: key={}, size={}字节, 用时: {:?}",
                    self.backend,
                    key,
                    data.len(),
                    start.elapsed()
                );
                Ok(Some(data.to_vec()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("[download] {}读取: key不存在: {}", self.backend, key);
                Ok(None)
            }
            Err(e) => {
                error!(
                    "[fail] {}读取失败: key={}, kind={:?}, error={}",
                    self.backend,
                    key,
                    e.kind(),
                    e
                );
                Err(e).context("Failed to read object")
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        match self.operator.check().await {
            Ok(()) => {
                info!("[ok] {}连接正常: bucket={}", self.backend, self.bucket);
                Ok(true)
            }
            Err(e) => {
                error!(
                    "[fail] {}健康检查失败: bucket={}, kind={:?}, error={}",
                    self.backend,
                    self.bucket,
                    e.kind(),
                    e
                );
                Ok(false)
            }
        }
    }

    fn backend(&self) -> &'static str {
        self.backend
    }
}
