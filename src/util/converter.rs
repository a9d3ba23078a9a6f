//! 转换服务客户端
//!
//! 通过 HTTP multipart 调用外部转换服务，把源文件转换成 PDF。
//! 客户端本身不做重试，失败按 [`PipelineError`] 分类后交给流水线处理。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::document::normalize_format;
use crate::model::StoredFile;
use crate::pipeline::error::{PipelineError, PipelineResult, Step};
use crate::util::http_client::HttpClient;
use crate::util::logging::standards::events;

/// 按格式族路由到不同的转换端点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterRoute {
    pub formats: Vec<String>,
    pub url: String,
}

/// 转换服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// 未命中路由表时使用的端点
    pub default_url: Option<String>,
    pub routes: Vec<ConverterRoute>,
    /// 无需转换、原样存储的格式
    pub passthrough_formats: Vec<String>,
    /// 单次转换请求超时（秒）
    pub timeout_secs: u64,
    /// 5xx 是否按瞬时错误重投（默认所有非 2xx 都是拒绝）
    pub treat_server_errors_as_transient: bool,
    pub target_extension: String,
    pub target_content_type: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            default_url: None,
            routes: Vec::new(),
            passthrough_formats: vec!["pdf".to_string()],
            timeout_secs: 120,
            treat_server_errors_as_transient: false,
            target_extension: "pdf".to_string(),
            target_content_type: "application/pdf".to_string(),
        }
    }
}

impl ConversionConfig {
    pub fn with_default_url(url: impl Into<String>) -> Self {
        Self {
            default_url: Some(url.into()),
            ..Default::default()
        }
    }

    /// 按格式选择端点：先查路由表，再回退到默认端点
    pub fn endpoint_for(&self, format: &str) -> Option<&str> {
        let format = normalize_format(format);
        self.routes
            .iter()
            .find(|route| {
                route
                    .formats
                    .iter()
                    .any(|f| normalize_format(f) == format)
            })
            .map(|route| route.url.as_str())
            .or(self.default_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn is_passthrough(&self, format: &str) -> bool {
        let format = normalize_format(format);
        self.passthrough_formats
            .iter()
            .any(|f| normalize_format(f) == format)
    }
}

/// 转换服务
#[async_trait]
pub trait ConversionClient: Send + Sync {
    /// 转换文件，返回目标格式字节
    async fn convert(&self, file: &StoredFile) -> PipelineResult<Vec<u8>>;
}

/// 基于 reqwest 的 HTTP 转换客户端
pub struct HttpConversionClient {
    client: Client,
    config: ConversionConfig,
    timeout: Duration,
}

impl HttpConversionClient {
    pub fn new(http: &HttpClient, config: ConversionConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        Self {
            client: http.reqwest_client().clone(),
            config,
            timeout,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    fn file_part(file: &StoredFile) -> Part {
        let part = Part::bytes(file.bytes.clone()).file_name(file.display_name.clone());
        match part.mime_str(&file.content_type) {
            Ok(part) => part,
            Err(_) => Part::bytes(file.bytes.clone()).file_name(file.display_name.clone()),
        }
    }
}

#[async_trait]
impl ConversionClient for HttpConversionClient {
    async fn convert(&self, file: &StoredFile) -> PipelineResult<Vec<u8>> {
        let format = normalize_format(&file.format);

        if self.config.is_passthrough(&format) {
            debug!(
                event = events::CONVERTER_PASSTHROUGH,
                key = %file.key,
                format = %format,
                "源文件已是目标格式，跳过转换"
            );
            return Ok(file.bytes.clone());
        }

        let url = self.config.endpoint_for(&format).ok_or_else(|| {
            warn!(
                event = events::CONVERTER_FAILED,
                key = %file.key,
                format = %format,
                "[fail] 没有可用的转换端点"
            );
            PipelineError::rejected(format.clone(), None)
        })?;

        let form = Form::new()
            .part("file", Self::file_part(file))
            .text("fileType", format.clone());

        let start = Instant::now();
        info!(
            event = events::CONVERTER_CALL,
            key = %file.key,
            format = %format,
            size = file.size(),
            url = %url,
            "调用转换服务"
        );

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    event = events::CONVERTER_FAILED,
                    key = %file.key,
                    timeout = e.is_timeout(),
                    error = %e,
                    "[fail] 转换服务请求失败"
                );
                if e.is_timeout() {
                    PipelineError::timeout(Step::Convert, self.timeout.as_secs())
                } else {
                    PipelineError::transport(Step::Convert, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                event = events::CONVERTER_FAILED,
                key = %file.key,
                format = %format,
                status = status.as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "[fail] 转换服务返回非成功状态"
            );
            if status.is_server_error() && self.config.treat_server_errors_as_transient {
                return Err(PipelineError::transport(
                    Step::Convert,
                    format!("转换服务返回 {}", status),
                ));
            }
            return Err(PipelineError::rejected(format, Some(status.as_u16())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::transport(Step::Convert, format!("读取转换结果失败: {}", e)))?;

        info!(
            event = events::CONVERTER_CALL,
            key = %file.key,
            converted_size = bytes.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "[ok] 转换完成"
        );

        Ok(bytes.to_vec())
    }
}
