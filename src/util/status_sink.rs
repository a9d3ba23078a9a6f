//! 状态接收端
//!
//! 流水线的终态结果（CONVERTED / FAILED_CONVERSION）写往外部元数据服务。
//! 写入按 `document_id` 最后写入者生效，重复上报同一结果是安全的。

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::Outcome;
use crate::util::config::types::NatsQueueConfig;
use crate::util::http_client::HttpClient;
use crate::util::logging::standards::events;
use crate::util::task_queue::header_safe;

/// 关联属性：外部引用 ID 与新状态
pub const HEADER_EXTERNAL_REFERENCE: &str = "externalReferenceUUID";
pub const HEADER_STATUS: &str = "status";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSinkDriver {
    #[default]
    Http,
    Nats,
}

/// 状态接收端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSinkConfig {
    pub driver: StatusSinkDriver,
    /// HTTP 驱动：元数据服务地址，结果写往 `{base_url}/document/{documentId}/status`
    pub base_url: String,
    /// 单次上报超时（秒）
    pub timeout_secs: u64,
    /// NATS 驱动：结果发布的 subject（需被某个 Stream 覆盖）
    pub subject: String,
}

impl Default for StatusSinkConfig {
    fn default() -> Self {
        Self {
            driver: StatusSinkDriver::Http,
            base_url: "http://localhost:8081".to_string(),
            timeout_secs: 30,
            subject: "docs.conversion.outcome".to_string(),
        }
    }
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    /// 写入结果，返回后即视为对方已接收
    async fn report(&self, outcome: &Outcome) -> Result<()>;

    fn driver(&self) -> &'static str;
}

/// 根据配置创建状态接收端
pub async fn create_status_sink(
    config: &StatusSinkConfig,
    http: &HttpClient,
    nats: Option<&NatsQueueConfig>,
) -> Result<Arc<dyn StatusSink>> {
    match config.driver {
        StatusSinkDriver::Http => Ok(Arc::new(HttpStatusSink::new(http, config))),
        StatusSinkDriver::Nats => {
            let nats = nats.ok_or_else(|| anyhow!("NATS 状态接收端需要 task_queue.nats 连接配置"))?;
            let context = crate::util::task_queue::connect_jetstream(nats).await?;
            Ok(Arc::new(NatsStatusSink::new(context, config)))
        }
    }
}

/// 通过 HTTP PUT 写入元数据服务
pub struct HttpStatusSink {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpStatusSink {
    pub fn new(http: &HttpClient, config: &StatusSinkConfig) -> Self {
        Self {
            client: http.reqwest_client().clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn status_url(&self, document_id: &str) -> String {
        format!(
            "{}/document/{}/status",
            self.base_url,
            urlencoding::encode(document_id)
        )
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn report(&self, outcome: &Outcome) -> Result<()> {
        let url = self.status_url(&outcome.document_id);
        let start = Instant::now();

        let response = self
            .client
            .put(&url)
            .timeout(self.timeout)
            .json(outcome)
            .send()
            .await
            .with_context(|| format!("状态上报请求失败: {}", url))?;

        let status_code = response.status();
        if !status_code.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no-body>".to_string());
            warn!(
                event = events::STATUS_REPORT_FAILED,
                document_id = %outcome.document_id,
                status = %status_code,
                "[fail] 状态接收端返回非成功状态"
            );
            return Err(anyhow!(
                "状态接收端返回 {}: {}",
                status_code,
                truncate_string(&text, 512)
            ));
        }

        info!(
            event = events::STATUS_REPORTED,
            document_id = %outcome.document_id,
            new_status = %outcome.new_status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "[ok] 状态已上报"
        );
        Ok(())
    }

    fn driver(&self) -> &'static str {
        "http"
    }
}

/// 发布到 NATS JetStream，消息头携带关联属性
pub struct NatsStatusSink {
    context: jetstream::Context,
    subject: String,
    timeout: Duration,
}

impl NatsStatusSink {
    pub fn new(context: jetstream::Context, config: &StatusSinkConfig) -> Self {
        Self {
            context,
            subject: config.subject.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }
}

pub fn correlation_headers(outcome: &Outcome) -> HeaderMap {
    let mut headers = HeaderMap::new();
    // 外部引用由生产方给出，写入消息头前需清洗
    headers.insert(
        HEADER_EXTERNAL_REFERENCE,
        header_safe(&outcome.external_reference_id).as_str(),
    );
    headers.insert(HEADER_STATUS, outcome.new_status.as_str());
    headers
}

#[async_trait]
impl StatusSink for NatsStatusSink {
    async fn report(&self, outcome: &Outcome) -> Result<()> {
        let payload = serde_json::to_vec(outcome).context("序列化结果失败")?;

        let publish = async {
            let ack = self
                .context
                .publish_with_headers(
                    self.subject.clone(),
                    correlation_headers(outcome),
                    payload.into(),
                )
                .await
                .context("发布结果消息失败")?;
            ack.await.context("等待 JetStream 确认失败")?;
            Ok::<(), anyhow::Error>(())
        };

        tokio::time::timeout(self.timeout, publish)
            .await
            .map_err(|_| anyhow!("状态上报超时（{}秒）", self.timeout.as_secs()))??;

        info!(
            event = events::STATUS_REPORTED,
            document_id = %outcome.document_id,
            new_status = %outcome.new_status,
            subject = %self.subject,
            "[ok] 状态已发布"
        );
        Ok(())
    }

    fn driver(&self) -> &'static str {
        "nats"
    }
}

fn truncate_string(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let mut truncated: String = value.chars().take(max_chars).collect();
        truncated.push_str("...");
        truncated
    }
}
