//! 服务启动模块
//!
//! - 配置管理 (config.rs)
//! - 退出信号 (shutdown.rs)
//!
//! 按配置装配存储、转换客户端、状态接收端、队列与 worker 池。

pub mod config;
pub mod shutdown;

pub use config::ConfigManager;

use crate::build_info;
use crate::pipeline::{ConversionPipeline, OutcomeReporter, RedeliveryPolicy};
use crate::storage::{create_storage, ObjectStoreGateway};
use crate::util::config::{Config, ValidationReport};
use crate::util::converter::HttpConversionClient;
use crate::util::http_client::HttpClient;
use crate::util::status_sink::create_status_sink;
use crate::util::task_queue::{initialize_task_queue, check_task_queue, ConversionQueue};
use crate::util::worker::WorkerPool;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// 启动引导：持有配置与日志 guard
pub struct ServerBootstrap {
    config: Config,
    _log_guard: Option<WorkerGuard>,
}

impl ServerBootstrap {
    /// 加载配置、初始化日志并执行配置验证
    pub fn new() -> Result<Self> {
        let (config, report) = ConfigManager::load_and_validate()?;
        let log_guard = ConfigManager::initialize_logging(&config)?;

        info!("[launch] 开始服务引导程序...");
        ConfigManager::enforce_report(&report)?;

        Ok(Self {
            config,
            _log_guard: log_guard,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 运行 worker 池直到收到退出信号
    pub async fn start(self) -> Result<()> {
        info!("=== 文档转换服务启动 ===");
        info!("版本信息: {}", build_info::summary());
        info!(
            node_id = %self.config.deployment.node_id,
            queue = self.config.task_queue.driver.as_str(),
            source = %self.config.storage.source.describe(),
            target = %self.config.storage.target.describe(),
            "运行配置"
        );

        let components = build_components(&self.config).await?;
        let shutdown = CancellationToken::new();
        shutdown::spawn_signal_listener(shutdown.clone());

        components.pool.run(shutdown).await?;
        info!("[stop] 文档转换服务已退出");
        Ok(())
    }

    /// 检查存储、队列、状态接收端与日志目录
    pub async fn health_check(&self) -> Result<SystemHealthReport> {
        info!("[search] 执行系统健康检查...");
        let config = &self.config;

        let source_storage = check_storage(&config.storage.source).await;
        let target_storage = check_storage(&config.storage.target).await;

        let (queue, queue_depth) = match check_task_queue(&config.task_queue).await {
            Ok(status) => (CheckResult::ok(status.driver), status.depth),
            Err(e) => (CheckResult::failed(config.task_queue.driver.as_str(), e), None),
        };

        let status_sink = match HttpClient::new(config.http_client.clone()) {
            Ok(http) => {
                match create_status_sink(&config.status_sink, &http, config.task_queue.nats.as_ref())
                    .await
                {
                    Ok(sink) => CheckResult::ok(sink.driver()),
                    Err(e) => CheckResult::failed("status_sink", e),
                }
            }
            Err(e) => CheckResult::failed("http_client", e),
        };

        let logs = if config.logging.file.enabled {
            crate::util::log::check_log_health(Path::new(&config.logging.file.directory))
        } else {
            serde_json::json!({ "status": "disabled" })
        };

        let overall_healthy =
            source_storage.healthy && target_storage.healthy && queue.healthy && status_sink.healthy;

        Ok(SystemHealthReport {
            overall_healthy,
            source_storage,
            target_storage,
            queue,
            queue_depth,
            status_sink,
            logs,
            check_time: chrono::Utc::now(),
        })
    }
}

/// 装配完成的运行组件
pub struct PipelineComponents {
    pub queue: Arc<dyn ConversionQueue>,
    pub pipeline: Arc<ConversionPipeline>,
    pub pool: WorkerPool,
}

/// 按配置装配流水线与 worker 池
pub async fn build_components(config: &Config) -> Result<PipelineComponents> {
    info!("[build] 装配转换流水线...");

    let http = HttpClient::new(config.http_client.clone().with_env_proxy())
        .context("初始化HTTP客户端失败")?;

    let source = create_storage(&config.storage.source).context("初始化源存储失败")?;
    let target = create_storage(&config.storage.target).context("初始化结果存储失败")?;
    let step_timeout = Duration::from_secs(config.worker.step_timeout_secs.max(1));
    let gateway = ObjectStoreGateway::new(source, target, step_timeout);

    let converter = Arc::new(HttpConversionClient::new(&http, config.conversion.clone()));

    let sink = create_status_sink(&config.status_sink, &http, config.task_queue.nats.as_ref())
        .await
        .context("初始化状态接收端失败")?;
    let reporter = OutcomeReporter::new(sink, step_timeout);

    let policy = RedeliveryPolicy::from_config(&config.redelivery);
    info!(
        max_attempts = policy.effective_max_attempts(),
        base_delay_ms = policy.base_delay.as_millis() as u64,
        backoff_multiplier = policy.backoff_multiplier,
        report_failure_on_exhaustion = policy.report_failure_on_exhaustion,
        "[ok] 重投策略"
    );

    let pipeline = Arc::new(
        ConversionPipeline::new(gateway, converter, reporter, policy).with_target(
            config.conversion.target_extension.clone(),
            config.conversion.target_content_type.clone(),
        ),
    );

    let queue = initialize_task_queue(&config.task_queue)
        .await
        .context("初始化任务队列失败")?;

    let pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&pipeline),
        config.worker.effective_concurrency(),
        config.deployment.node_id.clone(),
    )
    .with_error_backoff(Duration::from_millis(config.worker.error_backoff_ms.max(1)));

    info!(
        concurrency = pool.concurrency(),
        queue = queue.driver(),
        "[ok] 转换流水线装配完成"
    );
    Ok(PipelineComponents {
        queue,
        pipeline,
        pool,
    })
}

async fn check_storage(config: &crate::storage::StorageConfig) -> CheckResult {
    let name = config.describe();
    match create_storage(config) {
        Ok(storage) => match storage.health_check().await {
            Ok(true) => CheckResult::ok(&name),
            Ok(false) => CheckResult {
                target: name,
                healthy: false,
                error: Some("health check returned false".to_string()),
            },
            Err(e) => CheckResult::failed(&name, e),
        },
        Err(e) => CheckResult::failed(&name, e),
    }
}

/// 单项检查结果
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub target: String,
    pub healthy: bool,
    pub error: Option<String>,
}

impl CheckResult {
    fn ok(target: &str) -> Self {
        Self {
            target: target.to_string(),
            healthy: true,
            error: None,
        }
    }

    fn failed(target: &str, error: anyhow::Error) -> Self {
        warn!("[fail] 健康检查失败 {}: {:#}", target, error);
        Self {
            target: target.to_string(),
            healthy: false,
            error: Some(format!("{:#}", error)),
        }
    }
}

/// 系统健康检查报告
#[derive(Debug, Clone)]
pub struct SystemHealthReport {
    pub overall_healthy: bool,
    pub source_storage: CheckResult,
    pub target_storage: CheckResult,
    pub queue: CheckResult,
    /// NATS 请求 Stream 的积压消息数
    pub queue_depth: Option<u64>,
    pub status_sink: CheckResult,
    pub logs: serde_json::Value,
    pub check_time: chrono::DateTime<chrono::Utc>,
}

/// 便捷函数：启动 worker
pub async fn start_worker() -> Result<()> {
    let bootstrap = ServerBootstrap::new()?;
    bootstrap.start().await
}

/// 便捷函数：执行健康检查
pub async fn check_system_health() -> Result<SystemHealthReport> {
    let bootstrap = ServerBootstrap::new()?;
    bootstrap.health_check().await
}

/// 便捷函数：加载配置并返回验证报告，不初始化日志
pub fn check_config() -> Result<(std::path::PathBuf, ValidationReport)> {
    let path = ConfigManager::find_config_file_path("config.yaml");
    let (_, report) = ConfigManager::load_from_path(&path)?;
    Ok((path, report))
}
