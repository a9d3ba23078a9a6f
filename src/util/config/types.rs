//! 配置结构定义模块
//! 包含转换服务配置的所有数据结构

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use crate::storage::factory::{LocalConfig, OssConfig, S3Config, StorageConfig, StorageType};
pub use crate::util::converter::{ConversionConfig, ConverterRoute};
pub use crate::util::http_client::HttpClientConfig;
pub use crate::util::status_sink::{StatusSinkConfig, StatusSinkDriver};

/// 主配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 源文件与转换结果的存储
    #[serde(default)]
    pub storage: StorageSection,
    /// 转换服务调用配置
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub task_queue: TaskQueueConfig,
    #[serde(default)]
    pub redelivery: RedeliveryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub status_sink: StatusSinkConfig,
}

/// 部署配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// 节点标识，写入日志便于多节点排查
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

fn default_node_id() -> String {
    "node-01".to_string()
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
        }
    }
}

/// 存储配置：源桶与转换结果桶分别配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_source_storage")]
    pub source: StorageConfig,
    #[serde(default = "default_target_storage")]
    pub target: StorageConfig,
}

fn default_source_storage() -> StorageConfig {
    StorageConfig::local("data/source")
}

fn default_target_storage() -> StorageConfig {
    StorageConfig::local("data/converted")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            source: default_source_storage(),
            target: default_target_storage(),
        }
    }
}

/// 任务队列驱动类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskQueueDriver {
    /// 使用本地内存通道，适合单机部署或开发环境
    #[default]
    Local,
    /// 使用 NATS JetStream 作为任务队列，支持多节点分布式处理
    Nats,
}

impl TaskQueueDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskQueueDriver::Local => "local",
            TaskQueueDriver::Nats => "nats",
        }
    }
}

/// 任务队列配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// 队列驱动类型，默认本地内存实现
    #[serde(default)]
    pub driver: TaskQueueDriver,
    /// 本地队列配置
    #[serde(default)]
    pub local: LocalQueueConfig,
    /// NATS JetStream 队列配置
    #[serde(default)]
    pub nats: Option<NatsQueueConfig>,
}

/// 本地任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalQueueConfig {
    /// Tokio 通道容量，默认 128
    #[serde(default = "default_local_channel_capacity")]
    pub channel_capacity: usize,
    /// 空队列时单次接收的等待时长（毫秒）
    #[serde(default = "default_local_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_local_channel_capacity() -> usize {
    128
}

fn default_local_poll_interval_ms() -> u64 {
    500
}

impl Default for LocalQueueConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_local_channel_capacity(),
            poll_interval_ms: default_local_poll_interval_ms(),
        }
    }
}

/// NATS JetStream 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsQueueConfig {
    /// NATS 服务器地址，例如 nats://127.0.0.1:4222
    pub server_url: String,
    /// 转换请求 subject
    #[serde(default = "default_nats_subject")]
    pub subject: String,
    /// JetStream Stream 名称
    #[serde(default = "default_nats_stream")]
    pub stream: String,
    /// JetStream 耐久消费者名称
    #[serde(default = "default_nats_durable")]
    pub durable_consumer: String,
    /// 服务端最大投递次数，-1 表示不限制，由重投策略决定何时进入死信
    #[serde(default = "default_nats_max_deliver")]
    pub max_deliver: i64,
    /// Ack 等待时长（毫秒），需大于单条消息的最长处理时间
    #[serde(default = "default_nats_ack_wait_ms")]
    pub ack_wait_ms: u64,
    /// 拉取请求的等待时间（毫秒）
    #[serde(default = "default_nats_pull_wait_ms")]
    pub pull_wait_ms: u64,
    /// TLS 配置
    #[serde(default)]
    pub tls: Option<NatsTlsConfig>,
    /// Stream 最大消息数，None 表示不限制
    #[serde(default = "default_nats_max_messages")]
    pub max_messages: Option<i64>,
    /// Stream 最大存储字节数，None 表示不限制
    #[serde(default = "default_nats_max_bytes")]
    pub max_bytes: Option<i64>,
    /// 消息最大保留时长（秒），None 表示不限制
    #[serde(default = "default_nats_max_age_seconds")]
    pub max_age_seconds: Option<u64>,
    /// 死信 subject
    #[serde(default = "default_nats_dead_letter_subject")]
    pub dead_letter_subject: String,
    /// 死信 Stream 名称
    #[serde(default = "default_nats_dead_letter_stream")]
    pub dead_letter_stream: String,
}

fn default_nats_subject() -> String {
    "docs.conversion.request".to_string()
}

fn default_nats_stream() -> String {
    "DOCS_CONVERSION".to_string()
}

fn default_nats_durable() -> String {
    "docs-converter-workers".to_string()
}

fn default_nats_max_deliver() -> i64 {
    -1
}

fn default_nats_ack_wait_ms() -> u64 {
    300_000
}

fn default_nats_pull_wait_ms() -> u64 {
    1_000
}

fn default_nats_max_messages() -> Option<i64> {
    Some(100_000)
}

fn default_nats_max_bytes() -> Option<i64> {
    Some(1_073_741_824) // 1 GiB
}

fn default_nats_max_age_seconds() -> Option<u64> {
    Some(7 * 24 * 3_600)
}

fn default_nats_dead_letter_subject() -> String {
    "docs.conversion.dead".to_string()
}

fn default_nats_dead_letter_stream() -> String {
    "DOCS_CONVERSION_DLQ".to_string()
}

impl Default for NatsQueueConfig {
    fn default() -> Self {
        Self {
            server_url: "nats://127.0.0.1:4222".to_string(),
            subject: default_nats_subject(),
            stream: default_nats_stream(),
            durable_consumer: default_nats_durable(),
            max_deliver: default_nats_max_deliver(),
            ack_wait_ms: default_nats_ack_wait_ms(),
            pull_wait_ms: default_nats_pull_wait_ms(),
            tls: None,
            max_messages: default_nats_max_messages(),
            max_bytes: default_nats_max_bytes(),
            max_age_seconds: default_nats_max_age_seconds(),
            dead_letter_subject: default_nats_dead_letter_subject(),
            dead_letter_stream: default_nats_dead_letter_stream(),
        }
    }
}

/// NATS TLS 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsTlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default = "default_true")]
    pub require_tls: bool,
}

impl Default for NatsTlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_file: None,
            client_cert: None,
            client_key: None,
            require_tls: true,
        }
    }
}

/// 重投策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeliveryConfig {
    /// 含首次投递在内的最大尝试次数，0 视为 1
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 首次重投前的等待时间（毫秒）
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 单次等待上限（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 重试耗尽时是否上报 FAILED_CONVERSION
    #[serde(default)]
    pub report_failure_on_exhaustion: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    900_000
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            report_failure_on_exhaustion: false,
        }
    }
}

/// Worker 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 并发处理数，未配置时取 CPU 核数
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// 存储读写与状态上报的单步超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// 队列异常后的初始退避（毫秒）
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_error_backoff_ms() -> u64 {
    1_000
}

impl WorkerConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency
            .filter(|value| *value > 0)
            .unwrap_or_else(num_cpus::get)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            step_timeout_secs: default_step_timeout_secs(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: LogFileConfig,
    /// 是否启用结构化（JSON）日志
    #[serde(default)]
    pub structured: Option<bool>,
    #[serde(default)]
    pub level_config: Option<LevelConfig>,
    #[serde(default)]
    pub enable_debug_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: LogFileConfig::default(),
            structured: Some(false),
            level_config: None,
            enable_debug_file: false,
        }
    }
}

/// 日志文件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_directory")]
    pub directory: String,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

fn default_log_directory() -> String {
    "logs".to_string()
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_log_directory(),
            retention_days: Some(7),
        }
    }
}

/// 日志级别配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelConfig {
    /// 流水线与 worker
    #[serde(default)]
    pub pipeline: Option<String>,
    /// 存储、队列、转换服务与状态接收端适配层
    #[serde(default)]
    pub adapters: Option<String>,
    /// 启动与配置
    #[serde(default)]
    pub system: Option<String>,
    /// 目标 → 级别，例如 `util.task_queue: debug` 或 `target:async_nats: warn`
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("deployment:\n  node_id: node-07\n").unwrap();
        assert_eq!(config.deployment.node_id, "node-07");
        assert_eq!(config.task_queue.driver, TaskQueueDriver::Local);
        assert_eq!(config.redelivery.max_attempts, 3);
        assert_eq!(config.redelivery.base_delay_ms, 1_000);
        assert_eq!(config.storage.source.storage_type, StorageType::Local);
        assert_eq!(config.logging.level, "info");
        assert!(config.task_queue.nats.is_none());
    }

    #[test]
    fn test_nats_section_defaults() {
        let yaml = r#"
task_queue:
  driver: nats
  nats:
    server_url: nats://mq:4222
redelivery:
  max_attempts: 5
  report_failure_on_exhaustion: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.task_queue.driver, TaskQueueDriver::Nats);
        let nats = config.task_queue.nats.unwrap();
        assert_eq!(nats.server_url, "nats://mq:4222");
        assert_eq!(nats.subject, "docs.conversion.request");
        assert_eq!(nats.max_deliver, -1);
        assert_ne!(nats.dead_letter_stream, nats.stream);
        assert_eq!(config.redelivery.max_attempts, 5);
        assert!(config.redelivery.report_failure_on_exhaustion);
    }

    #[test]
    fn test_worker_concurrency_fallback() {
        let mut worker = WorkerConfig::default();
        assert!(worker.effective_concurrency() >= 1);
        worker.concurrency = Some(0);
        assert!(worker.effective_concurrency() >= 1);
        worker.concurrency = Some(3);
        assert_eq!(worker.effective_concurrency(), 3);
    }
}
