//! HTTP客户端模块
//!
//! 转换服务和状态接收端共用一个连接池化的 reqwest 客户端，支持：
//! - 超时配置
//! - 代理设置
//! - 连接池管理

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// HTTP客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// 请求超时时间（秒）
    pub timeout_secs: u64,
    /// 连接超时时间（秒）
    pub connect_timeout_secs: u64,
    /// 是否接受无效证书（仅开发环境）
    pub danger_accept_invalid_certs: bool,
    /// User-Agent，为空时使用构建信息
    pub user_agent: String,
    /// TCP keepalive时间（秒）
    pub tcp_keepalive_secs: u64,
    /// 连接池空闲超时（秒）
    pub pool_idle_timeout_secs: u64,
    /// 每个主机的最大空闲连接数
    pub pool_max_idle_per_host: usize,
    /// HTTP代理URL（可选）
    pub http_proxy: Option<String>,
    /// HTTPS代理URL（可选）
    pub https_proxy: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            connect_timeout_secs: 10,
            danger_accept_invalid_certs: false,
            user_agent: String::new(),
            tcp_keepalive_secs: 60,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 16,
            http_proxy: None,
            https_proxy: None,
        }
    }
}

impl HttpClientConfig {
    /// 从环境变量加载代理配置
    pub fn with_env_proxy(mut self) -> Self {
        if let Ok(proxy_url) = std::env::var("HTTP_PROXY") {
            self.http_proxy = Some(proxy_url);
        }
        if let Ok(proxy_url) = std::env::var("HTTPS_PROXY") {
            self.https_proxy = Some(proxy_url);
        }
        self
    }
}

/// HTTP客户端包装器
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl HttpClient {
    /// 创建新的HTTP客户端
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Self::build_reqwest_client(&config)?;
        Ok(Self { client, config })
    }

    fn build_reqwest_client(config: &HttpClientConfig) -> Result<Client> {
        let user_agent = if config.user_agent.trim().is_empty() {
            crate::build_info::user_agent()
        } else {
            config.user_agent.clone()
        };

        let mut client_builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
            .user_agent(user_agent)
            .tcp_keepalive(Duration::from_secs(config.tcp_keepalive_secs))
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host);

        // 配置HTTP代理
        if let Some(proxy_url) = &config.http_proxy {
            if let Ok(proxy) = reqwest::Proxy::http(proxy_url) {
                info!("使用HTTP代理: {}", proxy_url);
                client_builder = client_builder.proxy(proxy);
            } else {
                warn!("HTTP代理配置无效: {}", proxy_url);
            }
        }

        // 配置HTTPS代理
        if let Some(proxy_url) = &config.https_proxy {
            if let Ok(proxy) = reqwest::Proxy::https(proxy_url) {
                info!("使用HTTPS代理: {}", proxy_url);
                client_builder = client_builder.proxy(proxy);
            } else {
                warn!("HTTPS代理配置无效: {}", proxy_url);
            }
        }

        client_builder.build().context("构建HTTP客户端失败")
    }

    /// 底层reqwest客户端（内部为 Arc，克隆开销很小）
    pub fn reqwest_client(&self) -> &Client {
        &self.client
    }

    /// 获取配置
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.config)
            .finish()
    }
}
