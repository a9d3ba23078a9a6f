use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::local::LocalStorage;
use super::object::ObjectStorage;
use super::traits::Storage;

/// 存储类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    Oss,
    S3,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::Oss => "oss",
            StorageType::S3 => "s3",
        }
    }
}

/// 存储配置（每个桶一份）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub storage_type: StorageType,

    /// 本地存储配置
    #[serde(default)]
    pub local: Option<LocalConfig>,

    /// OSS存储配置
    #[serde(default)]
    pub oss: Option<OssConfig>,

    /// S3存储配置
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl StorageConfig {
    pub fn local(base_path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Local,
            local: Some(LocalConfig {
                base_path: base_path.into(),
            }),
            oss: None,
            s3: None,
        }
    }

    /// 日志中使用的位置描述（不含凭证）
    pub fn describe(&self) -> String {
        match self.storage_type {
            StorageType::Local => format!(
                "local:{}",
                self.local
                    .as_ref()
                    .map(|l| l.base_path.as_str())
                    .unwrap_or("<unset>")
            ),
            StorageType::Oss => format!(
                "oss:{}",
                self.oss
                    .as_ref()
                    .map(|o| o.bucket.as_str())
                    .unwrap_or("<unset>")
            ),
            StorageType::S3 => format!(
                "s3:{}",
                self.s3
                    .as_ref()
                    .map(|s| s.bucket.as_str())
                    .unwrap_or("<unset>")
            ),
        }
    }
}

/// 本地存储配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalConfig {
    pub base_path: String,
}

/// OSS存储配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OssConfig {
    pub bucket: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    #[serde(default)]
    pub root: Option<String>,
}

/// S3存储配置，未提供密钥时使用默认凭证链
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
}

/// 创建存储实例
pub fn create_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.storage_type {
        StorageType::Local => {
            let local_config = config
                .local
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage configuration missing"))?;

            let storage = LocalStorage::new(&local_config.base_path)?;

            tracing::info!("Local storage initialized at: {}", local_config.base_path);
            Ok(Arc::new(storage))
        }

        StorageType::Oss => {
            let oss_config = config
                .oss
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("OSS configuration missing"))?;

            let storage = ObjectStorage::oss(oss_config)?;

            tracing::info!("OSS storage initialized for bucket: {}", oss_config.bucket);
            Ok(Arc::new(storage))
        }

        StorageType::S3 => {
            let s3_config = config
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 configuration missing"))?;

            let storage = ObjectStorage::s3(s3_config)?;

            tracing::info!("S3 storage initialized for bucket: {}", s3_config.bucket);
            Ok(Arc::new(storage))
        }
    }
}
