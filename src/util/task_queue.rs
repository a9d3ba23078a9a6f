use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::util::config::types::{
    LocalQueueConfig, NatsQueueConfig, TaskQueueConfig, TaskQueueDriver,
};
use crate::util::logging::standards::events;

pub const CONVERSION_QUEUE_NAME: &str = "document-conversion";

/// 死信消息头
pub const HEADER_DELIVERY_ATTEMPTS: &str = "Docs-Delivery-Attempts";
pub const HEADER_DEAD_LETTER_REASON: &str = "Docs-Dead-Letter-Reason";
pub const HEADER_DEAD_LETTER_DETAIL: &str = "Docs-Dead-Letter-Detail";
pub const HEADER_SOURCE_SUBJECT: &str = "Docs-Source-Subject";

/// 进入死信队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// 转换服务拒绝输入
    Rejected,
    /// 重投次数耗尽
    Exhausted,
    /// 消息无法解析
    Malformed,
    /// 程序错误
    Internal,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Rejected => "conversion_rejected",
            DeadLetterReason::Exhausted => "delivery_exhausted",
            DeadLetterReason::Malformed => "malformed_payload",
            DeadLetterReason::Internal => "internal_error",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 本地队列保存的死信记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub detail: String,
}

enum Receipt {
    Local,
    Nats(Box<jetstream::Message>),
}

/// 一次投递
///
/// `payload` 是队列中的原始字节，`attempt` 是传输层给出的投递序号（从 1 开始）。
/// 投递必须且只能通过 ack / nack / dead_letter 之一结束。
pub struct Delivery {
    pub payload: Vec<u8>,
    pub attempt: u32,
    receipt: Receipt,
}

impl Delivery {
    pub fn local(payload: Vec<u8>, attempt: u32) -> Self {
        Self {
            payload,
            attempt: attempt.max(1),
            receipt: Receipt::Local,
        }
    }

    fn nats(message: jetstream::Message) -> Self {
        let attempt = message
            .info()
            .map(|info| info.delivered.max(1) as u32)
            .unwrap_or(1);
        Self {
            payload: message.payload.to_vec(),
            attempt,
            receipt: Receipt::Nats(Box::new(message)),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("size", &self.payload.len())
            .field("attempt", &self.attempt)
            .field(
                "receipt",
                &match self.receipt {
                    Receipt::Local => "local",
                    Receipt::Nats(_) => "nats",
                },
            )
            .finish()
    }
}

/// 转换请求队列
///
/// 重投延迟由传输层负责（`nack` 携带等待时间），worker 从不在消息上休眠。
#[async_trait]
pub trait ConversionQueue: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// 等待下一条消息，轮询窗口内没有消息时返回 `Ok(None)`
    async fn receive(&self) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: Delivery) -> Result<()>;

    /// 在 `redeliver_after` 之后重新投递，投递序号加一
    async fn nack(&self, delivery: Delivery, redeliver_after: Duration) -> Result<()>;

    /// 原样转发原始载荷到死信通道并结束本次投递
    async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<()>;

    fn driver(&self) -> &'static str;
}

/// 根据配置初始化任务队列实现
pub async fn initialize_task_queue(config: &TaskQueueConfig) -> Result<Arc<dyn ConversionQueue>> {
    match config.driver {
        TaskQueueDriver::Local => Ok(Arc::new(LocalTaskQueue::new(
            CONVERSION_QUEUE_NAME,
            &config.local,
        ))),
        TaskQueueDriver::Nats => {
            let nats_config = config
                .nats
                .as_ref()
                .ok_or_else(|| anyhow!("缺少 NATS 队列配置"))?;
            let queue = NatsTaskQueue::connect(CONVERSION_QUEUE_NAME, nats_config).await?;
            Ok(Arc::new(queue))
        }
    }
}

/// 队列检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCheck {
    pub driver: &'static str,
    /// 请求 Stream 中的消息数，单机队列不跨进程，没有可查询的深度
    pub depth: Option<u64>,
}

/// 只检查连通性与 Stream 状态，不创建消费者也不启动后台任务
pub async fn check_task_queue(config: &TaskQueueConfig) -> Result<QueueCheck> {
    match config.driver {
        TaskQueueDriver::Local => Ok(QueueCheck {
            driver: TaskQueueDriver::Local.as_str(),
            depth: None,
        }),
        TaskQueueDriver::Nats => {
            let nats_config = config
                .nats
                .as_ref()
                .ok_or_else(|| anyhow!("缺少 NATS 队列配置"))?;
            let context = connect_jetstream(nats_config).await?;
            ensure_streams(&context, nats_config).await?;
            let depth = stream_depth(&context, nats_config).await?;
            Ok(QueueCheck {
                driver: TaskQueueDriver::Nats.as_str(),
                depth: Some(depth),
            })
        }
    }
}

/// 请求 Stream 当前的消息数，5 秒超时
pub async fn stream_depth(context: &jetstream::Context, config: &NatsQueueConfig) -> Result<u64> {
    let lookup = async {
        let mut stream = context
            .get_stream(&config.stream)
            .await
            .map_err(|e| anyhow!("获取Stream失败: {}", e))?;
        let info = stream
            .info()
            .await
            .map_err(|e| anyhow!("获取Stream信息失败: {}", e))?;
        Ok::<u64, anyhow::Error>(info.state.messages)
    };

    tokio::time::timeout(Duration::from_secs(5), lookup)
        .await
        .map_err(|_| anyhow!("查询Stream状态超时（5秒）"))?
}

struct LocalMessage {
    payload: Vec<u8>,
    attempt: u32,
}

/// 单机队列实现，基于 tokio mpsc
pub struct LocalTaskQueue {
    sender: mpsc::Sender<LocalMessage>,
    receiver: Mutex<mpsc::Receiver<LocalMessage>>,
    queue_name: &'static str,
    poll_interval: Duration,
    /// 已发布但尚未 ack / 死信的消息数（等待重投的也算在内）
    pending_tasks: Arc<AtomicU64>,
    dead_letters: SyncMutex<Vec<DeadLetterRecord>>,
}

impl LocalTaskQueue {
    pub fn new(queue_name: &'static str, config: &LocalQueueConfig) -> Self {
        let capacity = config.channel_capacity.max(16);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            queue_name,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            pending_tasks: Arc::new(AtomicU64::new(0)),
            dead_letters: SyncMutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending_tasks.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.lock().clone()
    }

    /// 等待所有消息处理完成（测试与单机模式的优雅退出使用）
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn release(&self) -> u64 {
        let previous = self
            .pending_tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

#[async_trait]
impl ConversionQueue for LocalTaskQueue {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let new_depth = self.pending_tasks.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            event = events::QUEUE_ENQUEUE,
            queue = self.queue_name,
            depth = new_depth
        );

        match self
            .sender
            .send(LocalMessage {
                payload,
                attempt: 1,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.release();
                Err(anyhow!("发送转换请求失败: {}", e))
            }
        }
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(self.poll_interval, receiver.recv()).await {
            Ok(Some(message)) => Ok(Some(Delivery::local(message.payload, message.attempt))),
            Ok(None) => Err(anyhow!("本地队列 [{}] 已关闭", self.queue_name)),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, _delivery: Delivery) -> Result<()> {
        let depth = self.release();
        debug!(event = events::QUEUE_DEQUEUE, queue = self.queue_name, depth);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, redeliver_after: Duration) -> Result<()> {
        let sender = self.sender.clone();
        let pending = Arc::clone(&self.pending_tasks);
        let queue_name = self.queue_name;
        let message = LocalMessage {
            payload: delivery.payload,
            attempt: delivery.attempt.saturating_add(1),
        };

        tokio::spawn(async move {
            if !redeliver_after.is_zero() {
                tokio::time::sleep(redeliver_after).await;
            }
            if let Err(e) = sender.send(message).await {
                error!(
                    event = events::QUEUE_ERROR,
                    queue = queue_name,
                    error = %e,
                    "[fail] 本地队列重投失败，消息丢弃"
                );
                let _ = pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    current.checked_sub(1)
                });
            }
        });
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<()> {
        self.dead_letters.lock().push(DeadLetterRecord {
            payload: delivery.payload,
            attempts: delivery.attempt,
            reason,
            detail: detail.to_string(),
        });
        self.release();
        Ok(())
    }

    fn driver(&self) -> &'static str {
        "local"
    }
}

/// 基于 NATS JetStream 的任务队列实现
#[derive(Clone)]
pub struct NatsTaskQueue {
    context: Arc<RwLock<jetstream::Context>>,
    consumer: Arc<RwLock<Option<consumer::PullConsumer>>>,
    queue_name: &'static str,
    config: NatsQueueConfig, // 保存配置以供重连使用
    /// 断线重连状态标记
    reconnecting: Arc<AtomicBool>,
}

impl NatsTaskQueue {
    /// 连接NATS服务器，带超时和重试机制
    pub async fn connect(queue_name: &'static str, config: &NatsQueueConfig) -> Result<Self> {
        let context = connect_jetstream(config).await?;
        ensure_streams(&context, config).await?;

        let queue = Self {
            context: Arc::new(RwLock::new(context)),
            consumer: Arc::new(RwLock::new(None)),
            queue_name,
            config: config.clone(),
            reconnecting: Arc::new(AtomicBool::new(false)),
        };

        // [loop] 启动后台健康监控任务
        queue.start_health_monitor();

        Ok(queue)
    }

    async fn pull_consumer(&self) -> Result<consumer::PullConsumer> {
        if let Some(consumer) = self.consumer.read().await.as_ref() {
            return Ok(consumer.clone());
        }

        let mut guard = self.consumer.write().await;
        if let Some(consumer) = guard.as_ref() {
            return Ok(consumer.clone());
        }

        let context = self.context.read().await.clone();
        let stream = context
            .get_or_create_stream(build_stream_config(&self.config))
            .await
            .with_context(|| format!("创建/获取 JetStream Stream [{}] 失败", self.config.stream))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.config.durable_consumer,
                build_consumer_config(&self.config),
            )
            .await
            .with_context(|| {
                format!("创建/获取消费者 [{}] 失败", self.config.durable_consumer)
            })?;

        info!(
            stream = %self.config.stream,
            subject = %self.config.subject,
            durable_consumer = %self.config.durable_consumer,
            ack_wait_ms = self.config.ack_wait_ms,
            pull_wait_ms = self.config.pull_wait_ms,
            "[ok] JetStream 消费者就绪"
        );

        *guard = Some(consumer.clone());
        Ok(consumer)
    }

    /// [loop] 启动后台健康监控任务
    fn start_health_monitor(&self) {
        let queue_clone = self.clone();
        tokio::spawn(async move {
            queue_clone.health_monitor_loop().await;
        });
    }

    /// 健康监控循环
    async fn health_monitor_loop(&self) {
        let mut check_interval = tokio::time::interval(Duration::from_secs(30));
        check_interval.tick().await;
        let mut healthy = true;

        loop {
            check_interval.tick().await;

            if let Err(e) = self.check_connection_health().await {
                warn!("[warn] NATS连接健康检查失败: {}", e);
                healthy = false;

                if !self.reconnecting.load(Ordering::SeqCst) {
                    info!("[loop] 触发NATS断线重连...");
                    self.reconnect().await;
                }
            } else if !healthy {
                info!("[ok] NATS连接已恢复健康");
                healthy = true;
            }
        }
    }

    /// 检查NATS连接健康状态
    async fn check_connection_health(&self) -> Result<()> {
        let context = self.context.read().await.clone();
        stream_depth(&context, &self.config).await.map(|_| ())
    }

    /// [loop] 执行断线重连
    async fn reconnect(&self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            warn!("[warn] 已有重连任务在进行中，跳过");
            return;
        }

        info!("[loop] 开始NATS断线重连流程...");

        const MAX_RECONNECT_ATTEMPTS: u32 = 5;
        let mut retry_delay = Duration::from_secs(2);

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            info!(
                "尝试重连NATS (第{}/{}次)...",
                attempt, MAX_RECONNECT_ATTEMPTS
            );

            match tokio::time::timeout(Duration::from_secs(10), try_connect(&self.config)).await {
                Ok(Ok(client)) => {
                    let new_context = jetstream::new(client);
                    match ensure_streams(&new_context, &self.config).await {
                        Ok(()) => {
                            *self.context.write().await = new_context;
                            // 旧消费者绑定在旧连接上，下次拉取时重建
                            *self.consumer.write().await = None;

                            info!(
                                "[ok] NATS重连成功 (尝试 {}/{})",
                                attempt, MAX_RECONNECT_ATTEMPTS
                            );
                            self.reconnecting.store(false, Ordering::SeqCst);
                            return;
                        }
                        Err(e) => {
                            warn!("[fail] 创建/获取Stream失败: {:#}", e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        "[fail] NATS重连失败 (尝试 {}/{}): {}",
                        attempt, MAX_RECONNECT_ATTEMPTS, e
                    );
                }
                Err(_) => {
                    warn!(
                        "[stopwatch] NATS重连超时 (尝试 {}/{}, 10秒)",
                        attempt, MAX_RECONNECT_ATTEMPTS
                    );
                }
            }

            if attempt < MAX_RECONNECT_ATTEMPTS {
                info!("等待 {:?} 后重试重连...", retry_delay);
                tokio::time::sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(Duration::from_secs(60));
            }
        }

        error!(
            "[fail] NATS重连失败，已尝试{}次。连接将在下次健康检查时继续重试。",
            MAX_RECONNECT_ATTEMPTS
        );
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    fn take_message(delivery: Delivery) -> Result<Box<jetstream::Message>> {
        match delivery.receipt {
            Receipt::Nats(message) => Ok(message),
            Receipt::Local => Err(anyhow!("投递不属于 NATS 队列")),
        }
    }
}

#[async_trait]
impl ConversionQueue for NatsTaskQueue {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let context = self.context.read().await;
        let ack = context
            .publish(self.config.subject.clone(), payload.into())
            .await
            .context("发布转换请求消息失败")?;

        ack.await.context("等待 JetStream 确认失败")?;
        debug!(
            event = events::QUEUE_ENQUEUE,
            queue = self.queue_name,
            subject = %self.config.subject
        );
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let consumer = self.pull_consumer().await?;

        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .expires(Duration::from_millis(self.config.pull_wait_ms.max(100)))
            .messages()
            .await
            .map_err(|e| anyhow!("从 NATS 拉取消息失败: {}", e))?;

        match batch.next().await {
            Some(Ok(message)) => {
                let delivery = Delivery::nats(message);
                debug!(
                    target: "queue.consumer",
                    event = events::QUEUE_DEQUEUE,
                    stream = %self.config.stream,
                    consumer = %self.config.durable_consumer,
                    delivered_attempts = delivery.attempt
                );
                Ok(Some(delivery))
            }
            Some(Err(e)) => Err(anyhow!("读取 JetStream 消息失败: {}", e)),
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: Delivery) -> Result<()> {
        let message = Self::take_message(delivery)?;
        message
            .ack()
            .await
            .map_err(|e| anyhow!("NATS 消息 ACK 失败: {}", e))
    }

    async fn nack(&self, delivery: Delivery, redeliver_after: Duration) -> Result<()> {
        let attempt = delivery.attempt;
        let message = Self::take_message(delivery)?;
        message
            .ack_with(AckKind::Nak(Some(redeliver_after)))
            .await
            .map_err(|e| anyhow!("发送 NAK 失败: {}", e))?;
        debug!(
            event = events::QUEUE_REDELIVER,
            attempt,
            delay_ms = redeliver_after.as_millis() as u64,
            "已发送 NAK，等待 JetStream 重投"
        );
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<()> {
        let attempt = delivery.attempt;
        let message = Self::take_message(delivery)?;

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_DELIVERY_ATTEMPTS, attempt.to_string().as_str());
        headers.insert(HEADER_DEAD_LETTER_REASON, reason.as_str());
        headers.insert(HEADER_DEAD_LETTER_DETAIL, header_safe(detail).as_str());
        headers.insert(HEADER_SOURCE_SUBJECT, message.subject.as_str());

        {
            let context = self.context.read().await;
            let ack = context
                .publish_with_headers(
                    self.config.dead_letter_subject.clone(),
                    headers,
                    message.payload.clone(),
                )
                .await
                .context("发布死信消息失败")?;
            ack.await.context("等待死信 JetStream 确认失败")?;
        }

        // 死信已落盘，终止原消息防止重复投递
        message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| anyhow!("终止消息失败: {}", e))?;

        info!(
            event = events::QUEUE_DEAD_LETTER,
            subject = %self.config.dead_letter_subject,
            attempt,
            reason = reason.as_str(),
            "消息已转入死信队列"
        );
        Ok(())
    }

    fn driver(&self) -> &'static str {
        "nats"
    }
}

/// 连接NATS，带超时与指数退避重试
pub async fn connect_jetstream(config: &NatsQueueConfig) -> Result<jetstream::Context> {
    info!("[plug] 正在连接NATS服务器: {}", config.server_url);

    const MAX_RETRIES: u32 = 3;
    const CONNECT_TIMEOUT_SECS: u64 = 10;
    let mut retry_delay = Duration::from_secs(1);

    for attempt in 1..=MAX_RETRIES {
        info!("尝试连接NATS (第{}/{}次)...", attempt, MAX_RETRIES);

        let connect_result = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            try_connect(config),
        )
        .await;

        match connect_result {
            Ok(Ok(client)) => {
                info!("[ok] NATS连接成功 (尝试 {}/{})", attempt, MAX_RETRIES);
                return Ok(jetstream::new(client));
            }
            Ok(Err(e)) => {
                warn!(
                    "[fail] NATS连接失败 (尝试 {}/{}): {:#}",
                    attempt, MAX_RETRIES, e
                );
            }
            Err(_timeout) => {
                warn!(
                    "[stopwatch] NATS连接超时 (尝试 {}/{}, {}秒)",
                    attempt, MAX_RETRIES, CONNECT_TIMEOUT_SECS
                );
            }
        }

        if attempt < MAX_RETRIES {
            info!("等待 {:?} 后重试...", retry_delay);
            tokio::time::sleep(retry_delay).await;
            retry_delay *= 2;
        }
    }

    let error_msg = format!(
        "NATS连接失败，已重试{}次。请检查NATS服务与网络连接，配置地址: {}",
        MAX_RETRIES, config.server_url
    );
    error!("[fail] {}", error_msg);
    Err(anyhow!(error_msg))
}

/// 尝试连接NATS（不带超时）
async fn try_connect(config: &NatsQueueConfig) -> Result<async_nats::Client> {
    if let Some(tls) = config.tls.as_ref().filter(|tls| tls.enabled) {
        let mut options = ConnectOptions::new();

        if tls.require_tls {
            options = options.require_tls(true);
        }

        let ca_file = tls
            .ca_file
            .as_ref()
            .ok_or_else(|| anyhow!("NATS TLS 配置缺少 ca_file"))?;
        options = options.add_root_certificates(PathBuf::from(ca_file));

        match (&tls.client_cert, &tls.client_key) {
            (Some(cert), Some(key)) => {
                options = options.add_client_certificate(PathBuf::from(cert), PathBuf::from(key));
            }
            (None, None) => {}
            _ => {
                return Err(anyhow!("NATS TLS 配置 client_cert/client_key 需要同时提供"));
            }
        }

        options
            .connect(&config.server_url)
            .await
            .with_context(|| format!("TLS连接NATS失败: {}", config.server_url))
    } else {
        async_nats::connect(&config.server_url)
            .await
            .with_context(|| format!("连接NATS失败: {}", config.server_url))
    }
}

/// 确保请求队列与死信队列的 Stream 都存在
async fn ensure_streams(context: &jetstream::Context, config: &NatsQueueConfig) -> Result<()> {
    context
        .get_or_create_stream(build_stream_config(config))
        .await
        .with_context(|| format!("创建/获取 JetStream Stream [{}] 失败", config.stream))?;
    info!("[ok] JetStream Stream [{}] 就绪", config.stream);

    context
        .get_or_create_stream(build_dead_letter_stream_config(config))
        .await
        .with_context(|| {
            format!(
                "创建/获取死信 Stream [{}] 失败",
                config.dead_letter_stream
            )
        })?;
    info!("[ok] 死信 Stream [{}] 就绪", config.dead_letter_stream);
    Ok(())
}

pub fn build_stream_config(config: &NatsQueueConfig) -> stream::Config {
    stream::Config {
        name: config.stream.clone(),
        subjects: vec![config.subject.clone()],
        retention: stream::RetentionPolicy::WorkQueue,
        max_messages: config.max_messages.unwrap_or(-1),
        max_bytes: config.max_bytes.unwrap_or(-1),
        max_age: config
            .max_age_seconds
            .map(Duration::from_secs)
            .unwrap_or_default(),
        ..Default::default()
    }
}

/// 死信 Stream 不设过期时间，等待运维处理
pub fn build_dead_letter_stream_config(config: &NatsQueueConfig) -> stream::Config {
    stream::Config {
        name: config.dead_letter_stream.clone(),
        subjects: vec![config.dead_letter_subject.clone()],
        retention: stream::RetentionPolicy::WorkQueue,
        ..Default::default()
    }
}

pub fn build_consumer_config(config: &NatsQueueConfig) -> consumer::pull::Config {
    consumer::pull::Config {
        durable_name: Some(config.durable_consumer.clone()),
        ack_policy: consumer::AckPolicy::Explicit,
        ack_wait: Duration::from_millis(config.ack_wait_ms),
        max_deliver: config.max_deliver,
        filter_subject: config.subject.clone(),
        ..Default::default()
    }
}

/// 死信回放使用的耐久消费者
pub const DEAD_LETTER_REPLAY_CONSUMER: &str = "docs-dead-letter-replay";

pub fn build_dead_letter_consumer_config(config: &NatsQueueConfig) -> consumer::pull::Config {
    consumer::pull::Config {
        durable_name: Some(DEAD_LETTER_REPLAY_CONSUMER.to_string()),
        ack_policy: consumer::AckPolicy::Explicit,
        ack_wait: Duration::from_millis(config.ack_wait_ms),
        filter_subject: config.dead_letter_subject.clone(),
        ..Default::default()
    }
}

/// 死信回放结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub failed: usize,
}

/// 从死信 Stream 取出至多 `limit` 条消息，原样重新发布到请求 subject
///
/// 每条消息先确认重新发布成功，再从死信 Stream 中移除；发布失败的消息留在死信中。
pub async fn replay_dead_letters(config: &NatsQueueConfig, limit: usize) -> Result<ReplaySummary> {
    let context = connect_jetstream(config).await?;
    ensure_streams(&context, config).await?;

    let stream = context
        .get_stream(&config.dead_letter_stream)
        .await
        .with_context(|| format!("获取死信 Stream [{}] 失败", config.dead_letter_stream))?;
    let consumer = stream
        .get_or_create_consumer(
            DEAD_LETTER_REPLAY_CONSUMER,
            build_dead_letter_consumer_config(config),
        )
        .await
        .context("创建死信回放消费者失败")?;

    let mut summary = ReplaySummary::default();
    while summary.replayed + summary.failed < limit {
        let remaining = limit - summary.replayed - summary.failed;
        let mut batch = consumer
            .fetch()
            .max_messages(remaining)
            .expires(Duration::from_millis(config.pull_wait_ms.max(100)))
            .messages()
            .await
            .map_err(|e| anyhow!("从死信 Stream 拉取消息失败: {}", e))?;

        let mut fetched = 0;
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| anyhow!("读取死信消息失败: {}", e))?;
            fetched += 1;

            let header = |name: &str| {
                message
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.get(name))
                    .map(|value| value.as_str().to_string())
                    .unwrap_or_default()
            };
            let reason = header(HEADER_DEAD_LETTER_REASON);
            let attempts = header(HEADER_DELIVERY_ATTEMPTS);

            let published = async {
                let ack = context
                    .publish(config.subject.clone(), message.payload.clone())
                    .await
                    .context("重新发布消息失败")?;
                ack.await.context("等待 JetStream 确认失败")?;
                Ok::<(), anyhow::Error>(())
            }
            .await;

            match published {
                Ok(()) => {
                    message
                        .ack()
                        .await
                        .map_err(|e| anyhow!("死信消息 ACK 失败: {}", e))?;
                    summary.replayed += 1;
                    info!(
                        event = events::QUEUE_ENQUEUE,
                        subject = %config.subject,
                        reason = %reason,
                        attempts = %attempts,
                        size = message.payload.len(),
                        "[ok] 死信消息已重新入队"
                    );
                }
                Err(e) => {
                    // 留在死信中，交给下一次回放
                    let _ = message.ack_with(AckKind::Nak(None)).await;
                    summary.failed += 1;
                    warn!(
                        event = events::QUEUE_ERROR,
                        reason = %reason,
                        error = %format!("{:#}", e),
                        "[fail] 死信消息重新入队失败"
                    );
                }
            }
        }

        if fetched == 0 {
            break;
        }
    }

    Ok(summary)
}

/// 消息头只允许单行 ASCII 可见字符
pub(crate) fn header_safe(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .take(512)
        .collect();
    cleaned
}
