use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

use super::error::{PipelineError, PipelineResult, Step};
use crate::model::Outcome;
use crate::util::logging::standards::events;
use crate::util::status_sink::StatusSink;
use crate::util::task_queue::{ConversionQueue, DeadLetterReason, Delivery};

/// 结果上报：终态写往状态接收端，无法处理的投递原样转发到死信通道
#[derive(Clone)]
pub struct OutcomeReporter {
    sink: Arc<dyn StatusSink>,
    timeout: Duration,
}

impl OutcomeReporter {
    pub fn new(sink: Arc<dyn StatusSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    pub async fn report(&self, outcome: &Outcome) -> PipelineResult<()> {
        match tokio::time::timeout(self.timeout, self.sink.report(outcome)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(
                    event = events::STATUS_REPORT_FAILED,
                    document_id = %outcome.document_id,
                    new_status = %outcome.new_status,
                    sink = self.sink.driver(),
                    error = %e,
                    "[fail] 状态上报失败"
                );
                Err(PipelineError::transport(Step::Report, format!("{:#}", e)))
            }
            Err(_) => {
                warn!(
                    event = events::STATUS_REPORT_FAILED,
                    document_id = %outcome.document_id,
                    sink = self.sink.driver(),
                    "[fail] 状态上报超时"
                );
                Err(PipelineError::timeout(Step::Report, self.timeout.as_secs()))
            }
        }
    }

    /// 转发原始载荷到死信通道，附带投递次数与原因
    pub async fn dead_letter(
        &self,
        queue: &dyn ConversionQueue,
        delivery: Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<()> {
        let attempt = delivery.attempt;
        let size = delivery.payload.len();
        queue
            .dead_letter(delivery, reason, detail)
            .await
            .inspect_err(|e| {
                error!(
                    event = events::QUEUE_ERROR,
                    attempt,
                    reason = reason.as_str(),
                    error = %e,
                    "[fail] 转入死信队列失败"
                );
            })?;

        warn!(
            event = events::DOCUMENT_DEAD_LETTERED,
            attempt,
            size,
            reason = reason.as_str(),
            detail = %detail,
            driver = queue.driver(),
            "消息已进入死信队列"
        );
        Ok(())
    }
}
