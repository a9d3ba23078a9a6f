//! 配置加载和管理模块
//! 处理配置文件的读取、写入、环境变量覆盖和默认模板生成

use super::types::*;
use super::validator::ConfigValidator;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从YAML文件读取配置
    pub fn read_yaml(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config = serde_yaml::from_str(&config_str)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 从进程环境变量应用覆盖
    pub fn apply_env_overrides(config: Config) -> Config {
        Self::apply_overrides_from(config, |key| std::env::var(key).ok())
    }

    /// 应用 `DOCS_*` 覆盖，`lookup` 返回变量值；密钥类字段不打印明文
    pub fn apply_overrides_from<F>(mut config: Config, lookup: F) -> Config
    where
        F: Fn(&str) -> Option<String>,
    {
        tracing::info!("[tool] 应用环境变量配置覆盖...");

        if let Some(node_id) = lookup("DOCS_NODE_ID") {
            config.deployment.node_id = node_id.clone();
            tracing::info!("[ok] 环境变量覆盖节点ID: {}", node_id);
        }

        if let Some(level) = lookup("DOCS_LOG_LEVEL") {
            config.logging.level = level.trim().to_ascii_lowercase();
            tracing::info!("[ok] 环境变量覆盖日志级别: {}", config.logging.level);
        }

        if let Some(log_retention) = lookup("DOCS_LOG_RETENTION") {
            if let Ok(retention_days) = log_retention.parse::<u32>() {
                config.logging.file.retention_days = Some(retention_days);
                tracing::info!("[ok] 环境变量覆盖日志保留天数: {}", retention_days);
            }
        }

        // NATS 配置覆盖，设置地址即切换到 NATS 驱动
        if let Some(nats_url) = lookup("DOCS_NATS_URL") {
            let nats_config = config
                .task_queue
                .nats
                .get_or_insert_with(NatsQueueConfig::default);
            nats_config.server_url = nats_url.clone();
            config.task_queue.driver = TaskQueueDriver::Nats;
            tracing::info!("[ok] 环境变量覆盖NATS服务地址: {}", nats_url);
        }

        if let Some(tls_enabled_flag) = lookup("DOCS_NATS_TLS_ENABLED") {
            if let Ok(enabled) = Self::parse_bool(&tls_enabled_flag) {
                let nats_config = config
                    .task_queue
                    .nats
                    .get_or_insert_with(NatsQueueConfig::default);
                let tls_cfg = nats_config
                    .tls
                    .get_or_insert_with(NatsTlsConfig::default);
                tls_cfg.enabled = enabled;
                tracing::info!("[ok] 环境变量覆盖NATS TLS开关: {}", enabled);
            } else {
                tracing::warn!(
                    "[warn] DOCS_NATS_TLS_ENABLED 无法解析为布尔值: {}",
                    tls_enabled_flag
                );
            }
        }

        if let Some(client_key) = lookup("DOCS_NATS_TLS_CLIENT_KEY") {
            if let Some(tls_cfg) = config
                .task_queue
                .nats
                .as_mut()
                .and_then(|nats| nats.tls.as_mut())
            {
                tls_cfg.client_key = Some(client_key);
                tracing::info!("[ok] 环境变量覆盖NATS客户端私钥: [隐藏]");
            }
        }

        if let Some(converter_url) = lookup("DOCS_CONVERTER_URL") {
            config.conversion.default_url = Some(converter_url.clone());
            tracing::info!("[ok] 环境变量覆盖转换服务地址: {}", converter_url);
        }

        if let Some(sink_url) = lookup("DOCS_STATUS_SINK_URL") {
            config.status_sink.base_url = sink_url.clone();
            tracing::info!("[ok] 环境变量覆盖状态接收端地址: {}", sink_url);
        }

        if let Some(max_attempts) = lookup("DOCS_MAX_ATTEMPTS") {
            match max_attempts.trim().parse::<u32>() {
                Ok(value) => {
                    config.redelivery.max_attempts = value;
                    tracing::info!("[ok] 环境变量覆盖最大尝试次数: {}", value);
                }
                Err(_) => tracing::warn!("[warn] DOCS_MAX_ATTEMPTS 无效: {}", max_attempts),
            }
        }

        if let Some(concurrency) = lookup("DOCS_WORKER_CONCURRENCY") {
            match concurrency.trim().parse::<usize>() {
                Ok(value) if value > 0 => {
                    config.worker.concurrency = Some(value);
                    tracing::info!("[ok] 环境变量覆盖worker并发数: {}", value);
                }
                _ => tracing::warn!("[warn] DOCS_WORKER_CONCURRENCY 无效: {}", concurrency),
            }
        }

        // 存储凭证覆盖（安全优先），源桶与结果桶共用同一组凭证
        let key_id = lookup("DOCS_STORAGE_ACCESS_KEY_ID");
        let key_secret = lookup("DOCS_STORAGE_ACCESS_KEY_SECRET");
        for storage in [&mut config.storage.source, &mut config.storage.target] {
            Self::apply_storage_credentials(storage, key_id.as_deref(), key_secret.as_deref());
        }
        if key_id.is_some() || key_secret.is_some() {
            tracing::info!("[ok] 环境变量覆盖存储访问凭证: [安全隐藏]");
        }

        tracing::info!("[tool] 环境变量覆盖配置应用完成");
        config
    }

    fn apply_storage_credentials(
        storage: &mut StorageConfig,
        key_id: Option<&str>,
        key_secret: Option<&str>,
    ) {
        if let Some(oss) = storage.oss.as_mut() {
            if let Some(id) = key_id {
                oss.access_key_id = id.to_string();
            }
            if let Some(secret) = key_secret {
                oss.access_key_secret = secret.to_string();
            }
        }
        if let Some(s3) = storage.s3.as_mut() {
            if let Some(id) = key_id {
                s3.access_key_id = Some(id.to_string());
            }
            if let Some(secret) = key_secret {
                s3.secret_access_key = Some(secret.to_string());
            }
        }
    }

    /// 解析布尔环境变量
    pub fn parse_bool(value: &str) -> Result<bool, ()> {
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            _ => Err(()),
        }
    }

    /// 智能配置加载（配置文件 + 环境变量 + 验证）
    pub fn load_with_env_overrides(path: impl AsRef<Path>) -> Result<Config> {
        let base_config = Self::read_yaml(path)?;
        let config = Self::apply_env_overrides(base_config);

        let report = ConfigValidator::validate_all(&config);
        for issue in &report.warnings {
            tracing::warn!("[warn] 配置警告 {}: {}", issue.field, issue.message);
        }
        if report.has_errors() {
            let summary = report
                .errors
                .iter()
                .map(|issue| format!("{}: {}", issue.field, issue.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(anyhow!("配置验证失败: {}", summary));
        }

        tracing::info!("[ok] 智能配置加载完成");
        Ok(config)
    }
}

/// 配置写入器
pub struct ConfigWriter;

impl ConfigWriter {
    /// 写入YAML文件
    pub fn write_yaml(config: &Config, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建配置目录失败: {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(config).context("序列化配置失败")?;
        fs::write(path, yaml).with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }

    /// 生成默认配置模板：本地队列 + 本地存储，转换服务与状态接收端指向本机
    pub fn generate_template() -> Config {
        Config {
            deployment: DeploymentConfig::default(),
            logging: LoggingConfig::default(),
            storage: StorageSection::default(),
            conversion: ConversionConfig::with_default_url("http://127.0.0.1:3000/convert"),
            http_client: HttpClientConfig::default(),
            task_queue: TaskQueueConfig::default(),
            redelivery: RedeliveryConfig::default(),
            worker: WorkerConfig::default(),
            status_sink: StatusSinkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_nats_url_switches_driver() {
        let config = ConfigLoader::apply_overrides_from(
            ConfigWriter::generate_template(),
            env(&[
                ("DOCS_NATS_URL", "nats://mq:4222"),
                ("DOCS_MAX_ATTEMPTS", "7"),
                ("DOCS_WORKER_CONCURRENCY", "4"),
            ]),
        );
        assert_eq!(config.task_queue.driver, TaskQueueDriver::Nats);
        assert_eq!(
            config.task_queue.nats.as_ref().map(|n| n.server_url.as_str()),
            Some("nats://mq:4222")
        );
        assert_eq!(config.redelivery.max_attempts, 7);
        assert_eq!(config.worker.concurrency, Some(4));
    }

    #[test]
    fn test_invalid_numbers_are_ignored() {
        let config = ConfigLoader::apply_overrides_from(
            ConfigWriter::generate_template(),
            env(&[
                ("DOCS_MAX_ATTEMPTS", "many"),
                ("DOCS_WORKER_CONCURRENCY", "0"),
            ]),
        );
        assert_eq!(config.redelivery.max_attempts, 3);
        assert_eq!(config.worker.concurrency, None);
    }

    #[test]
    fn test_storage_credentials_override() {
        let mut template = ConfigWriter::generate_template();
        template.storage.source = StorageConfig {
            storage_type: StorageType::Oss,
            oss: Some(OssConfig {
                bucket: "cases".to_string(),
                endpoint: "https://oss.example.com".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = ConfigLoader::apply_overrides_from(
            template,
            env(&[
                ("DOCS_STORAGE_ACCESS_KEY_ID", "id"),
                ("DOCS_STORAGE_ACCESS_KEY_SECRET", "secret"),
            ]),
        );
        let oss = config.storage.source.oss.unwrap();
        assert_eq!(oss.access_key_id, "id");
        assert_eq!(oss.access_key_secret, "secret");
        assert!(config.storage.target.oss.is_none());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(ConfigLoader::parse_bool(" Yes "), Ok(true));
        assert_eq!(ConfigLoader::parse_bool("0"), Ok(false));
        assert!(ConfigLoader::parse_bool("maybe").is_err());
    }

    #[test]
    fn test_template_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("config.yaml");
        ConfigWriter::write_yaml(&ConfigWriter::generate_template(), &path).unwrap();

        let loaded = ConfigLoader::read_yaml(&path).unwrap();
        assert_eq!(
            loaded.conversion.default_url.as_deref(),
            Some("http://127.0.0.1:3000/convert")
        );
        assert_eq!(loaded.redelivery.max_attempts, 3);
        assert!(ConfigLoader::load_with_env_overrides(&path).is_ok());
    }
}
