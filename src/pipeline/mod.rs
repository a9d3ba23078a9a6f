//! 文档转换流水线
//!
//! 单条转换请求的处理：读取源文件、调用转换服务、写入 PDF、上报状态。
//! 流水线本身无状态，所有失败在这里归类为 [`Disposition`]，由 worker 交给队列执行。

pub mod error;
pub mod policy;
pub mod reporter;
pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::model::{ConversionRequest, Outcome, StoredFile};
use crate::storage::gateway::ObjectStoreGateway;
use crate::util::converter::ConversionClient;
use crate::util::logging::standards::events;
use crate::util::task_queue::DeadLetterReason;

pub use error::{PipelineError, PipelineResult, Step};
pub use policy::RedeliveryPolicy;
pub use reporter::OutcomeReporter;
pub use state::{PipelineEvent, PipelineState, StateTracker};

/// 一次投递的处理结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// 处理完成，确认消息
    Acknowledge,
    /// 等待 `after` 后重新投递
    Redeliver { after: Duration },
    /// 原样转入死信队列
    DeadLetter {
        reason: DeadLetterReason,
        detail: String,
    },
}

pub struct ConversionPipeline {
    gateway: ObjectStoreGateway,
    converter: Arc<dyn ConversionClient>,
    reporter: OutcomeReporter,
    policy: RedeliveryPolicy,
    target_extension: String,
    target_content_type: String,
}

impl ConversionPipeline {
    pub fn new(
        gateway: ObjectStoreGateway,
        converter: Arc<dyn ConversionClient>,
        reporter: OutcomeReporter,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            gateway,
            converter,
            reporter,
            policy,
            target_extension: "pdf".to_string(),
            target_content_type: "application/pdf".to_string(),
        }
    }

    pub fn with_target(
        mut self,
        extension: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        self.target_extension = extension.into();
        self.target_content_type = content_type.into();
        self
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    pub fn reporter(&self) -> &OutcomeReporter {
        &self.reporter
    }

    pub fn gateway(&self) -> &ObjectStoreGateway {
        &self.gateway
    }

    /// 处理一次投递，`attempt` 为传输层给出的投递序号（从 1 开始）
    pub async fn handle(&self, request: &ConversionRequest, attempt: u32) -> Disposition {
        let start = Instant::now();
        let mut tracker = StateTracker::new(&request.document_id);

        info!(
            event = events::DOCUMENT_RECEIVED,
            document_id = %request.document_id,
            external_reference_id = %request.external_reference_id,
            source_key = %request.source_key,
            format = %request.format,
            attempt,
            "收到转换请求"
        );

        let disposition = match self.run(request, &mut tracker).await {
            Ok(converted_key) => {
                info!(
                    event = events::DOCUMENT_CONVERTED,
                    document_id = %request.document_id,
                    converted_key = %converted_key,
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "[ok] 文档转换完成"
                );
                Disposition::Acknowledge
            }
            Err(err) => self.on_failure(request, attempt, err, &mut tracker).await,
        };

        tracing::debug!(
            document_id = %request.document_id,
            final_state = %tracker.state(),
            history = ?tracker.history(),
            "流水线结束"
        );
        disposition
    }

    async fn run(
        &self,
        request: &ConversionRequest,
        tracker: &mut StateTracker,
    ) -> PipelineResult<String> {
        tracker.advance(PipelineEvent::Start)?;
        let mut source = self.gateway.fetch(&request.source_key).await?;

        // 以请求中的格式提示为准，缺省时使用文件扩展名
        let format = request.normalized_format();
        if !format.is_empty() {
            source.format = format;
        }
        tracker.advance(PipelineEvent::Fetched)?;

        let converted = self.converter.convert(&source).await?;
        tracker.advance(PipelineEvent::Converted)?;

        let key = request.converted_key(&self.target_extension);
        let display_name = key.rsplit('/').next().unwrap_or(&key).to_string();
        let target = StoredFile::new(
            key,
            display_name,
            converted,
            self.target_extension.as_str(),
            self.target_content_type.as_str(),
        );
        let stored_key = self.gateway.store(&target).await?;

        self.reporter
            .report(&Outcome::converted(request, stored_key.as_str()))
            .await?;
        tracker.advance(PipelineEvent::Reported)?;

        Ok(stored_key)
    }

    async fn on_failure(
        &self,
        request: &ConversionRequest,
        attempt: u32,
        err: PipelineError,
        tracker: &mut StateTracker,
    ) -> Disposition {
        match err {
            PipelineError::ConversionRejected { .. } => {
                warn!(
                    event = events::DOCUMENT_REJECTED,
                    document_id = %request.document_id,
                    attempt,
                    error = %err,
                    "转换服务拒绝该文档"
                );
                match self.reporter.report(&Outcome::failed(request)).await {
                    Ok(()) => self.dead_letter_after(
                        tracker,
                        &[PipelineEvent::Rejected, PipelineEvent::DeadLettered],
                        DeadLetterReason::Rejected,
                        err.to_string(),
                    ),
                    // 拒绝结果未送达，按瞬时错误重投，避免静默丢失
                    Err(report_err) => self.on_transient(request, attempt, report_err, tracker).await,
                }
            }
            e if e.is_retryable() => self.on_transient(request, attempt, e, tracker).await,
            other => {
                error!(
                    event = events::DOCUMENT_DEAD_LETTERED,
                    document_id = %request.document_id,
                    state = %tracker.state(),
                    error_kind = other.kind(),
                    error = %other,
                    "[fail] 流水线内部错误"
                );
                Disposition::DeadLetter {
                    reason: DeadLetterReason::Internal,
                    detail: other.to_string(),
                }
            }
        }
    }

    async fn on_transient(
        &self,
        request: &ConversionRequest,
        attempt: u32,
        err: PipelineError,
        tracker: &mut StateTracker,
    ) -> Disposition {
        if let Err(internal) = tracker.advance(PipelineEvent::TransientFailure) {
            return internal_dead_letter(internal);
        }

        if self.policy.has_attempts_remaining(attempt) {
            if let Err(internal) = tracker.advance(PipelineEvent::AttemptsRemaining) {
                return internal_dead_letter(internal);
            }
            let after = self.policy.delay_after(attempt);
            warn!(
                event = events::DOCUMENT_RETRY_SCHEDULED,
                document_id = %request.document_id,
                attempt,
                max_attempts = self.policy.effective_max_attempts(),
                delay_ms = after.as_millis() as u64,
                error_kind = err.kind(),
                error = %err,
                "瞬时错误，稍后重投"
            );
            return Disposition::Redeliver { after };
        }

        let exhausted = PipelineError::DeliveryExhausted {
            attempts: attempt,
            last_error: err.to_string(),
        };

        if self.policy.report_failure_on_exhaustion {
            match self.reporter.report(&Outcome::failed(request)).await {
                Ok(()) => {
                    return self.dead_letter_after(
                        tracker,
                        &[PipelineEvent::FailureReported, PipelineEvent::DeadLettered],
                        DeadLetterReason::Exhausted,
                        exhausted.to_string(),
                    );
                }
                Err(report_err) => {
                    warn!(
                        document_id = %request.document_id,
                        error = %report_err,
                        "[fail] 重试耗尽后的失败状态上报失败，仍转入死信"
                    );
                }
            }
        }

        self.dead_letter_after(
            tracker,
            &[PipelineEvent::AttemptsExhausted],
            DeadLetterReason::Exhausted,
            exhausted.to_string(),
        )
    }

    fn dead_letter_after(
        &self,
        tracker: &mut StateTracker,
        path: &[PipelineEvent],
        reason: DeadLetterReason,
        detail: String,
    ) -> Disposition {
        for event in path {
            if let Err(internal) = tracker.advance(*event) {
                return internal_dead_letter(internal);
            }
        }
        Disposition::DeadLetter { reason, detail }
    }
}

fn internal_dead_letter(err: PipelineError) -> Disposition {
    error!(error = %err, "[fail] 状态机校验失败");
    Disposition::DeadLetter {
        reason: DeadLetterReason::Internal,
        detail: err.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::*;
    use super::*;
    use crate::model::DocumentStatus;

    #[tokio::test]
    async fn test_success_reports_converted() {
        let h = harness(ConverterBehavior::Succeed, RedeliveryPolicy::default());
        let request = request();
        assert_eq!(request.source_key, "ext1/D1.docx");

        let disposition = h.pipeline.handle(&request, 1).await;

        assert_eq!(disposition, Disposition::Acknowledge);
        assert_eq!(
            h.sink.outcomes(),
            vec![Outcome {
                document_id: "D1".into(),
                new_status: DocumentStatus::Converted,
                converted_key: Some("ext1/D1.pdf".into()),
                external_reference_id: "ext1".into(),
            }]
        );
        assert_eq!(h.target.object("ext1/D1.pdf").unwrap(), b"%PDF-docx-bytes");
    }

    #[tokio::test]
    async fn test_rejection_reports_failure_and_dead_letters() {
        let h = harness(ConverterBehavior::Reject(400), RedeliveryPolicy::default());

        let disposition = h.pipeline.handle(&request(), 1).await;

        assert!(matches!(
            disposition,
            Disposition::DeadLetter {
                reason: DeadLetterReason::Rejected,
                ..
            }
        ));
        let outcomes = h.sink.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].new_status, DocumentStatus::FailedConversion);
        assert_eq!(outcomes[0].converted_key, None);
        assert_eq!(h.target.puts.load(Ordering::SeqCst), 0);
        assert_eq!(h.converter.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_retries_then_dead_letters() {
        let policy = RedeliveryPolicy::new(3, Duration::from_millis(100), 2.0);
        let h = harness(ConverterBehavior::Succeed, policy);
        h.source.failing_gets.store(u32::MAX, Ordering::SeqCst);

        assert_eq!(
            h.pipeline.handle(&request(), 1).await,
            Disposition::Redeliver {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(
            h.pipeline.handle(&request(), 2).await,
            Disposition::Redeliver {
                after: Duration::from_millis(200)
            }
        );
        let last = h.pipeline.handle(&request(), 3).await;
        match last {
            Disposition::DeadLetter { reason, detail } => {
                assert_eq!(reason, DeadLetterReason::Exhausted);
                assert!(detail.contains('3'));
            }
            other => panic!("unexpected disposition: {:?}", other),
        }

        assert_eq!(h.converter.calls(), 0);
        assert!(h.sink.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_zero_max_attempts_dead_letters_immediately() {
        let h = harness(ConverterBehavior::Transport, RedeliveryPolicy::immediate());

        let disposition = h.pipeline.handle(&request(), 1).await;

        assert!(matches!(
            disposition,
            Disposition::DeadLetter {
                reason: DeadLetterReason::Exhausted,
                ..
            }
        ));
        assert_eq!(h.converter.calls(), 1);
        assert!(h.sink.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_can_report_failure() {
        let policy = RedeliveryPolicy::new(2, Duration::ZERO, 1.0)
            .with_failure_report_on_exhaustion(true);
        let h = harness(ConverterBehavior::Transport, policy);

        assert_eq!(
            h.pipeline.handle(&request(), 1).await,
            Disposition::Redeliver {
                after: Duration::ZERO
            }
        );
        assert!(h.sink.outcomes().is_empty());

        let disposition = h.pipeline.handle(&request(), 2).await;
        assert!(matches!(
            disposition,
            Disposition::DeadLetter {
                reason: DeadLetterReason::Exhausted,
                ..
            }
        ));
        let outcomes = h.sink.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].new_status, DocumentStatus::FailedConversion);
    }

    #[tokio::test]
    async fn test_missing_source_is_retryable() {
        let h = harness(ConverterBehavior::Succeed, RedeliveryPolicy::default());
        let missing = ConversionRequest::new("D2", "uploads/none.docx", "ext1", "docx");

        assert!(matches!(
            h.pipeline.handle(&missing, 1).await,
            Disposition::Redeliver { .. }
        ));
        assert_eq!(h.converter.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_redelivers_and_recovers() {
        let h = harness(
            ConverterBehavior::Succeed,
            RedeliveryPolicy::new(3, Duration::from_millis(10), 2.0),
        );
        h.target.failing_puts.store(1, Ordering::SeqCst);

        assert!(matches!(
            h.pipeline.handle(&request(), 1).await,
            Disposition::Redeliver { .. }
        ));
        assert!(h.sink.outcomes().is_empty());

        // 重投从读取开始重新执行
        assert_eq!(h.pipeline.handle(&request(), 2).await, Disposition::Acknowledge);
        assert_eq!(h.converter.calls(), 2);
        assert_eq!(h.sink.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_redelivers() {
        let h = harness(ConverterBehavior::Succeed, RedeliveryPolicy::default());
        h.sink.failing_reports.store(1, Ordering::SeqCst);

        assert!(matches!(
            h.pipeline.handle(&request(), 1).await,
            Disposition::Redeliver { .. }
        ));
        // PDF 已写入，重投时覆盖写入并再次上报
        assert!(h.target.object("ext1/D1.pdf").is_some());
        assert_eq!(h.pipeline.handle(&request(), 2).await, Disposition::Acknowledge);
        assert_eq!(h.sink.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_unreported_rejection_is_redelivered() {
        let h = harness(ConverterBehavior::Reject(415), RedeliveryPolicy::default());
        h.sink.failing_reports.store(1, Ordering::SeqCst);

        assert!(matches!(
            h.pipeline.handle(&request(), 1).await,
            Disposition::Redeliver { .. }
        ));
        assert!(matches!(
            h.pipeline.handle(&request(), 2).await,
            Disposition::DeadLetter {
                reason: DeadLetterReason::Rejected,
                ..
            }
        ));
        assert_eq!(h.sink.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_after_dead_letter_is_classified_the_same() {
        let h = harness(ConverterBehavior::Reject(400), RedeliveryPolicy::default());

        let first = h.pipeline.handle(&request(), 1).await;
        let replayed = h.pipeline.handle(&request(), 1).await;

        assert_eq!(first, replayed);
        let outcomes = h.sink.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn test_custom_target_extension() {
        let h = harness(ConverterBehavior::Succeed, RedeliveryPolicy::default());
        let pipeline = ConversionPipeline::new(
            ObjectStoreGateway::new(h.source.clone(), h.target.clone(), Duration::from_secs(5)),
            h.converter.clone(),
            OutcomeReporter::new(h.sink.clone(), Duration::from_secs(5)),
            RedeliveryPolicy::default(),
        )
        .with_target("pdfa", "application/pdf");

        assert_eq!(pipeline.handle(&request(), 1).await, Disposition::Acknowledge);
        assert!(h.target.object("ext1/D1.pdfa").is_some());
        assert_eq!(
            h.sink.outcomes()[0].converted_key.as_deref(),
            Some("ext1/D1.pdfa")
        );
    }
}
