//! 单次投递的流水线状态机（不持久化，仅用于驱动和校验控制流）
//!
//! ```text
//! RECEIVED -> FETCHING -> CONVERTING -> STORING -> REPORTED_SUCCESS
//! FETCHING | CONVERTING | STORING --(瞬时错误)--> RETRY_WAIT --(未耗尽)--> RECEIVED
//! RETRY_WAIT --(耗尽)--> DEAD_LETTERED
//! CONVERTING --(拒绝)--> REPORTED_FAILURE -> DEAD_LETTERED
//! ```

use std::fmt;

use super::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Fetching,
    Converting,
    Storing,
    RetryWait,
    ReportedSuccess,
    ReportedFailure,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Start,
    Fetched,
    Converted,
    /// 已存储并且状态接收端已确认
    Reported,
    TransientFailure,
    Rejected,
    AttemptsRemaining,
    AttemptsExhausted,
    /// 重试耗尽后按策略上报 FAILED_CONVERSION
    FailureReported,
    DeadLettered,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "RECEIVED",
            PipelineState::Fetching => "FETCHING",
            PipelineState::Converting => "CONVERTING",
            PipelineState::Storing => "STORING",
            PipelineState::RetryWait => "RETRY_WAIT",
            PipelineState::ReportedSuccess => "REPORTED_SUCCESS",
            PipelineState::ReportedFailure => "REPORTED_FAILURE",
            PipelineState::DeadLettered => "DEAD_LETTERED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::ReportedSuccess | PipelineState::DeadLettered
        )
    }

    /// 合法迁移返回下一状态，非法迁移返回 None
    pub fn next(self, event: PipelineEvent) -> Option<PipelineState> {
        use PipelineEvent as E;
        use PipelineState as S;

        match (self, event) {
            (S::Received, E::Start) => Some(S::Fetching),
            (S::Fetching, E::Fetched) => Some(S::Converting),
            (S::Converting, E::Converted) => Some(S::Storing),
            (S::Storing, E::Reported) => Some(S::ReportedSuccess),
            (S::Fetching | S::Converting | S::Storing, E::TransientFailure) => Some(S::RetryWait),
            (S::RetryWait, E::AttemptsRemaining) => Some(S::Received),
            (S::RetryWait, E::AttemptsExhausted) => Some(S::DeadLettered),
            (S::RetryWait, E::FailureReported) => Some(S::ReportedFailure),
            (S::Converting, E::Rejected) => Some(S::ReportedFailure),
            (S::ReportedFailure, E::DeadLettered) => Some(S::DeadLettered),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 跟踪一次投递的状态迁移并记录 trace 日志
#[derive(Debug)]
pub struct StateTracker {
    document_id: String,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl StateTracker {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            state: PipelineState::Received,
            history: vec![PipelineState::Received],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn advance(&mut self, event: PipelineEvent) -> Result<PipelineState, PipelineError> {
        let next = self.state.next(event).ok_or_else(|| {
            PipelineError::Internal(format!(
                "非法状态迁移: {} --{:?}--> ?",
                self.state, event
            ))
        })?;

        tracing::trace!(
            document_id = %self.document_id,
            from = %self.state,
            to = %next,
            event = ?event,
            "pipeline state transition"
        );

        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = StateTracker::new("D1");
        tracker.advance(PipelineEvent::Start).unwrap();
        tracker.advance(PipelineEvent::Fetched).unwrap();
        tracker.advance(PipelineEvent::Converted).unwrap();
        let last = tracker.advance(PipelineEvent::Reported).unwrap();
        assert_eq!(last, PipelineState::ReportedSuccess);
        assert!(last.is_terminal());
        assert_eq!(
            tracker.history(),
            &[
                PipelineState::Received,
                PipelineState::Fetching,
                PipelineState::Converting,
                PipelineState::Storing,
                PipelineState::ReportedSuccess,
            ]
        );
    }

    #[test]
    fn test_rejection_path() {
        let mut tracker = StateTracker::new("D1");
        tracker.advance(PipelineEvent::Start).unwrap();
        tracker.advance(PipelineEvent::Fetched).unwrap();
        tracker.advance(PipelineEvent::Rejected).unwrap();
        assert_eq!(tracker.state(), PipelineState::ReportedFailure);
        assert!(!tracker.state().is_terminal());
        tracker.advance(PipelineEvent::DeadLettered).unwrap();
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_retry_paths() {
        // 分别在 fetch / convert / store 阶段失败
        for failing_events in [
            vec![PipelineEvent::Start],
            vec![PipelineEvent::Start, PipelineEvent::Fetched],
            vec![
                PipelineEvent::Start,
                PipelineEvent::Fetched,
                PipelineEvent::Converted,
            ],
        ] {
            let mut tracker = StateTracker::new("D1");
            for event in failing_events {
                tracker.advance(event).unwrap();
            }
            tracker.advance(PipelineEvent::TransientFailure).unwrap();
            assert_eq!(tracker.state(), PipelineState::RetryWait);
            assert_eq!(
                PipelineState::RetryWait.next(PipelineEvent::AttemptsRemaining),
                Some(PipelineState::Received)
            );
            tracker.advance(PipelineEvent::AttemptsExhausted).unwrap();
            assert_eq!(tracker.state(), PipelineState::DeadLettered);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        let mut tracker = StateTracker::new("D1");
        assert!(tracker.advance(PipelineEvent::Converted).is_err());
        assert_eq!(tracker.state(), PipelineState::Received);
        assert_eq!(PipelineState::Fetching.next(PipelineEvent::Rejected), None);
        assert_eq!(PipelineState::Received.next(PipelineEvent::Reported), None);
        assert_eq!(
            PipelineState::ReportedSuccess.next(PipelineEvent::TransientFailure),
            None
        );
        assert_eq!(PipelineState::DeadLettered.next(PipelineEvent::Start), None);
    }
}
