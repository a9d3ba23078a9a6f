//! 转换 worker
//!
//! 固定数量的 worker 任务共享一个队列句柄和一条流水线，每个任务一次只处理一条投递，
//! 处理完毕后按 [`Disposition`] 执行 ack / nack / 死信，再接收下一条。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::ConversionRequest;
use crate::pipeline::{ConversionPipeline, Disposition};
use crate::util::logging::standards::events;
use crate::util::task_queue::{ConversionQueue, DeadLetterReason, Delivery};

/// 正在处理的文档与最近一次处理时间
#[derive(Debug, Default)]
pub struct WorkerActivity {
    state: Mutex<WorkerActivityState>,
}

#[derive(Debug, Default, Clone)]
struct WorkerActivityState {
    running_documents: Vec<String>,
    processed: u64,
    last_job_started_at: Option<DateTime<Utc>>,
    last_job_finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct WorkerActivitySnapshot {
    pub running_documents: Vec<String>,
    pub processed: u64,
    pub last_job_started_at: Option<String>,
    pub last_job_finished_at: Option<String>,
}

impl WorkerActivity {
    fn start(self: &Arc<Self>, document_id: &str) -> JobActivityGuard {
        let mut state = self.state.lock();
        state.running_documents.push(document_id.to_string());
        state.last_job_started_at = Some(Utc::now());
        JobActivityGuard {
            activity: Arc::clone(self),
            document_id: document_id.to_string(),
        }
    }

    fn finish(&self, document_id: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .running_documents
            .iter()
            .position(|doc| doc == document_id)
        {
            state.running_documents.remove(pos);
        }
        state.processed += 1;
        state.last_job_finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> WorkerActivitySnapshot {
        let state = self.state.lock();
        WorkerActivitySnapshot {
            running_documents: state.running_documents.clone(),
            processed: state.processed,
            last_job_started_at: state.last_job_started_at.map(|dt| dt.to_rfc3339()),
            last_job_finished_at: state.last_job_finished_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

struct JobActivityGuard {
    activity: Arc<WorkerActivity>,
    document_id: String,
}

impl Drop for JobActivityGuard {
    fn drop(&mut self) {
        self.activity.finish(&self.document_id);
    }
}

/// Worker 池
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn ConversionQueue>,
    pipeline: Arc<ConversionPipeline>,
    concurrency: usize,
    node_id: String,
    error_backoff: Duration,
    activity: Arc<WorkerActivity>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn ConversionQueue>,
        pipeline: Arc<ConversionPipeline>,
        concurrency: usize,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            pipeline,
            concurrency: concurrency.max(1),
            node_id: node_id.into(),
            error_backoff: Duration::from_secs(1),
            activity: Arc::new(WorkerActivity::default()),
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn activity(&self) -> Arc<WorkerActivity> {
        Arc::clone(&self.activity)
    }

    /// 启动所有 worker 任务，`shutdown` 取消后等待在途投递处理完再返回
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            event = events::WORKER_START,
            node_id = %self.node_id,
            concurrency = self.concurrency,
            queue = self.queue.driver(),
            "[launch] 启动转换 worker"
        );

        let mut workers = JoinSet::new();
        for index in 0..self.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.worker_loop(index, shutdown).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker 任务异常退出: {}", e);
            }
        }

        let snapshot = self.activity.snapshot();
        info!(
            event = events::WORKER_STOP,
            node_id = %self.node_id,
            processed = snapshot.processed,
            "[stop] 转换 worker 已停止"
        );
        Ok(())
    }

    async fn worker_loop(&self, index: usize, shutdown: CancellationToken) {
        let mut backoff = self.error_backoff;

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    backoff = self.error_backoff;
                    // 取消信号不打断在途投递
                    if let Err(e) = self.process_delivery(delivery).await {
                        warn!(worker = index, error = %e, "[fail] 投递结算失败");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        event = events::QUEUE_ERROR,
                        worker = index,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "从队列接收消息失败"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff.saturating_mul(2)).min(Duration::from_secs(30));
                }
            }
        }
    }

    /// 接收并处理一条投递，没有消息时返回 `false`
    pub async fn run_once(&self) -> Result<bool> {
        match self.queue.receive().await? {
            Some(delivery) => {
                self.process_delivery(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let request = match ConversionRequest::from_payload(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    event = events::DOCUMENT_MALFORMED,
                    attempt = delivery.attempt,
                    size = delivery.payload.len(),
                    error = %e,
                    "无法解析转换请求"
                );
                return self
                    .pipeline
                    .reporter()
                    .dead_letter(
                        self.queue.as_ref(),
                        delivery,
                        DeadLetterReason::Malformed,
                        &e.to_string(),
                    )
                    .await;
            }
        };

        let _guard = self.activity.start(&request.document_id);
        let handled = AssertUnwindSafe(self.pipeline.handle(&request, delivery.attempt))
            .catch_unwind()
            .await;
        let disposition = match handled {
            Ok(disposition) => disposition,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(
                    event = events::WORKER_PANIC,
                    document_id = %request.document_id,
                    attempt = delivery.attempt,
                    reason = %reason,
                    "[fail] 处理文档时发生 panic，转入死信"
                );
                Disposition::DeadLetter {
                    reason: DeadLetterReason::Internal,
                    detail: format!("panic: {}", reason),
                }
            }
        };
        self.settle(delivery, disposition).await
    }

    async fn settle(&self, delivery: Delivery, disposition: Disposition) -> Result<()> {
        match disposition {
            Disposition::Acknowledge => self.queue.ack(delivery).await,
            Disposition::Redeliver { after } => self.queue.nack(delivery, after).await,
            Disposition::DeadLetter { reason, detail } => {
                self.pipeline
                    .reporter()
                    .dead_letter(self.queue.as_ref(), delivery, reason, &detail)
                    .await
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::model::DocumentStatus;
    use crate::pipeline::testing::*;
    use crate::pipeline::RedeliveryPolicy;
    use crate::storage::Storage;
    use crate::util::config::types::LocalQueueConfig;
    use crate::util::task_queue::{LocalTaskQueue, CONVERSION_QUEUE_NAME};

    fn local_queue() -> Arc<LocalTaskQueue> {
        Arc::new(LocalTaskQueue::new(
            CONVERSION_QUEUE_NAME,
            &LocalQueueConfig {
                channel_capacity: 64,
                poll_interval_ms: 20,
            },
        ))
    }

    async fn run_until_idle(pool: &WorkerPool, queue: &LocalTaskQueue) {
        let shutdown = CancellationToken::new();
        let handle = {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_success_is_acknowledged() {
        let h = harness(ConverterBehavior::Succeed, RedeliveryPolicy::default());
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 2, "test-node");

        queue.publish(request().to_payload().unwrap()).await.unwrap();
        run_until_idle(&pool, &queue).await;

        let outcomes = h.sink.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].new_status, DocumentStatus::Converted);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(pool.activity().snapshot().processed, 1);
        assert!(pool.activity().snapshot().running_documents.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_dead_letters_original_payload_once() {
        let h = harness(ConverterBehavior::Reject(400), RedeliveryPolicy::default());
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 1, "test-node");

        let payload = request().to_payload().unwrap();
        queue.publish(payload.clone()).await.unwrap();
        run_until_idle(&pool, &queue).await;

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, payload);
        assert_eq!(dead[0].reason, DeadLetterReason::Rejected);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(h.sink.outcomes()[0].new_status, DocumentStatus::FailedConversion);
    }

    #[tokio::test]
    async fn test_transient_fetch_failures_exhaust_attempts() {
        let policy = RedeliveryPolicy::new(3, Duration::from_millis(10), 2.0);
        let h = harness(ConverterBehavior::Succeed, policy);
        h.source.failing_gets.store(u32::MAX, Ordering::SeqCst);
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 2, "test-node");

        queue.publish(request().to_payload().unwrap()).await.unwrap();
        run_until_idle(&pool, &queue).await;

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].reason, DeadLetterReason::Exhausted);
        assert_eq!(h.converter.calls(), 0);
        assert!(h.sink.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_redelivery() {
        let policy = RedeliveryPolicy::new(3, Duration::from_millis(10), 2.0);
        let h = harness(ConverterBehavior::Succeed, policy);
        h.source.failing_gets.store(1, Ordering::SeqCst);
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 1, "test-node");

        queue.publish(request().to_payload().unwrap()).await.unwrap();
        run_until_idle(&pool, &queue).await;

        assert!(queue.dead_letters().is_empty());
        assert_eq!(h.sink.outcomes().len(), 1);
        assert_eq!(h.converter.calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_dead_letters_without_redelivery() {
        let h = harness(ConverterBehavior::Transport, RedeliveryPolicy::immediate());
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 1, "test-node");

        queue.publish(request().to_payload().unwrap()).await.unwrap();
        assert!(pool.run_once().await.unwrap());

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(queue.pending(), 0);
        assert_eq!(h.converter.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered_verbatim() {
        let h = harness(ConverterBehavior::Succeed, RedeliveryPolicy::default());
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 1, "test-node");

        let garbage = b"{\"documentId\": 42".to_vec();
        queue.publish(garbage.clone()).await.unwrap();
        queue
            .publish(br#"{"documentId":"","sourceKey":"a","externalReferenceId":"b","format":"docx"}"#.to_vec())
            .await
            .unwrap();
        assert!(pool.run_once().await.unwrap());
        assert!(pool.run_once().await.unwrap());

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].payload, garbage);
        assert!(dead.iter().all(|d| d.reason == DeadLetterReason::Malformed));
        assert_eq!(h.converter.calls(), 0);
    }

    #[tokio::test]
    async fn test_panicking_conversion_is_dead_lettered_and_worker_survives() {
        let h = harness(ConverterBehavior::Panic, RedeliveryPolicy::default());
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 1, "test-node");

        let payload = request().to_payload().unwrap();
        queue.publish(payload.clone()).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };
        assert!(queue.wait_idle(Duration::from_secs(5)).await);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, payload);
        assert_eq!(dead[0].reason, DeadLetterReason::Internal);
        assert!(dead[0].detail.contains("converter exploded"));
        assert_eq!(queue.pending(), 0);
        assert!(pool.activity().snapshot().running_documents.is_empty());

        // 同一个 worker 继续处理后续消息
        h.converter.set(ConverterBehavior::Succeed);
        queue.publish(payload).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(h.sink.outcomes().len(), 1);
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_string()), "boom");
        assert_eq!(panic_message(&42u8), "Unknown panic payload");
    }

    #[tokio::test]
    async fn test_many_documents_with_concurrency() {
        let h = harness(ConverterBehavior::Succeed, RedeliveryPolicy::default());
        let queue = local_queue();
        let pool = WorkerPool::new(queue.clone(), h.pipeline.clone(), 4, "test-node");

        for i in 0..20 {
            let key = format!("uploads/doc-{}.docx", i);
            h.source.put(&key, b"bytes", None).await.unwrap();
            let request = ConversionRequest::new(format!("doc-{}", i), key, "case-9", "docx");
            queue.publish(request.to_payload().unwrap()).await.unwrap();
        }
        run_until_idle(&pool, &queue).await;

        assert_eq!(h.sink.outcomes().len(), 20);
        assert!(h.target.object("case-9/doc-7.pdf").is_some());
        assert_eq!(pool.activity().snapshot().processed, 20);
    }
}
