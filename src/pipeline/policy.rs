use std::time::Duration;

use crate::util::config::types::RedeliveryConfig;

/// 重投策略
///
/// `max_attempts` 是包含首次投递在内的总尝试次数，0 与 1 等价（只尝试一次）。
/// 第 n 次失败后的等待时间为 `base_delay * backoff_multiplier^(n-1)`，不超过 `max_delay`。
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// 重试耗尽时是否同时上报 FAILED_CONVERSION
    pub report_failure_on_exhaustion: bool,
}

impl RedeliveryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
            max_delay: Duration::from_secs(15 * 60),
            report_failure_on_exhaustion: false,
        }
    }

    /// 立即失败：只尝试一次，无延迟
    pub fn immediate() -> Self {
        Self::new(0, Duration::ZERO, 0.0)
    }

    pub fn with_failure_report_on_exhaustion(mut self, enabled: bool) -> Self {
        self.report_failure_on_exhaustion = enabled;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn from_config(config: &RedeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            report_failure_on_exhaustion: config.report_failure_on_exhaustion,
        }
    }

    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// `attempt` 为本次投递序号（从 1 开始）
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.effective_max_attempts()
    }

    /// 第 `attempt` 次失败后、下一次投递前的等待时间
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * multiplier.powi(exponent);
        let cap = self.max_delay.max(self.base_delay);

        if !millis.is_finite() || millis >= cap.as_millis() as f64 {
            cap
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::from_config(&RedeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_budget() {
        let policy = RedeliveryPolicy::new(3, Duration::ZERO, 0.0);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
        assert!(!policy.has_attempts_remaining(4));
    }

    #[test]
    fn test_zero_attempts_means_single_attempt() {
        let policy = RedeliveryPolicy::immediate();
        assert_eq!(policy.effective_max_attempts(), 1);
        assert!(!policy.has_attempts_remaining(1));
        assert_eq!(policy.delay_after(1), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RedeliveryPolicy::new(5, Duration::from_millis(500), 2.0)
            .with_max_delay(Duration::from_secs(3));
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(4), Duration::from_secs(3));
        assert_eq!(policy.delay_after(60), Duration::from_secs(3));
    }

    #[test]
    fn test_multiplier_below_one_is_constant_delay() {
        let policy = RedeliveryPolicy::new(4, Duration::from_millis(200), 0.0);
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(200));

        let policy = RedeliveryPolicy::new(4, Duration::from_millis(200), f64::NAN);
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    }

    #[test]
    fn test_from_config() {
        let config = RedeliveryConfig {
            max_attempts: 7,
            base_delay_ms: 100,
            backoff_multiplier: 3.0,
            max_delay_ms: 60_000,
            report_failure_on_exhaustion: true,
        };
        let policy = RedeliveryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.delay_after(3), Duration::from_millis(900));
        assert!(policy.report_failure_on_exhaustion);
    }
}
