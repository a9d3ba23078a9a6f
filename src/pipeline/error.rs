use std::fmt;

use thiserror::Error;

/// 流水线中访问外部服务的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Convert,
    Store,
    Report,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Fetch => "fetch",
            Step::Convert => "convert",
            Step::Store => "store",
            Step::Report => "report",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流水线错误分类
///
/// 所有失败都在流水线边界归入以下类别，再由重投策略决定确认、重投或进入死信。
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 源文件不存在（可能是最终一致性导致的短暂不可见）
    #[error("源文件不存在: {key}")]
    NotFound { key: String },

    /// 网络、超时或鉴权失败
    #[error("{step} 阶段传输失败: {message}")]
    Transport { step: Step, message: String },

    /// 转换服务明确拒绝输入
    #[error("转换服务拒绝 {format} 文件 (status={})", display_status(.status))]
    ConversionRejected { format: String, status: Option<u16> },

    /// 重投次数耗尽
    #[error("已投递 {attempts} 次仍失败: {last_error}")]
    DeliveryExhausted { attempts: u32, last_error: String },

    /// 程序错误（非法状态迁移、无法解析的消息等）
    #[error("内部错误: {0}")]
    Internal(String),
}

fn display_status(status: &Option<u16>) -> String {
    status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl PipelineError {
    pub fn transport(step: Step, message: impl fmt::Display) -> Self {
        PipelineError::Transport {
            step,
            message: message.to_string(),
        }
    }

    pub fn timeout(step: Step, secs: u64) -> Self {
        PipelineError::Transport {
            step,
            message: format!("超时（{}秒）", secs),
        }
    }

    pub fn rejected(format: impl Into<String>, status: Option<u16>) -> Self {
        PipelineError::ConversionRejected {
            format: format.into(),
            status,
        }
    }

    /// 可通过重投恢复的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::NotFound { .. } | PipelineError::Transport { .. }
        )
    }

    /// 日志事件中使用的分类标签
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::Transport { .. } => "transport",
            PipelineError::ConversionRejected { .. } => "conversion_rejected",
            PipelineError::DeliveryExhausted { .. } => "delivery_exhausted",
            PipelineError::Internal(_) => "internal",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(PipelineError::NotFound { key: "a".into() }.is_retryable());
        assert!(PipelineError::timeout(Step::Convert, 30).is_retryable());
        assert!(!PipelineError::rejected("docx", Some(400)).is_retryable());
        assert!(!PipelineError::DeliveryExhausted {
            attempts: 3,
            last_error: "x".into()
        }
        .is_retryable());
        assert!(!PipelineError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::rejected("docx", Some(400));
        assert!(err.to_string().contains("status=400"));
        let err = PipelineError::rejected("exe", None);
        assert!(err.to_string().contains("status=none"));
        let err = PipelineError::transport(Step::Store, "connection reset");
        assert!(err.to_string().starts_with("store"));
        assert_eq!(err.kind(), "transport");
    }
}
