//! 配置验证模块
//! 提供配置的验证、检查和诊断功能

use super::types::*;
use url::Url;

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 全面验证配置
    pub fn validate_all(config: &Config) -> ValidationReport {
        let mut report = ValidationReport::new();

        Self::validate_conversion_config(&config.conversion, &mut report);
        Self::validate_redelivery_config(&config.redelivery, &mut report);
        Self::validate_task_queue_config(config, &mut report);
        Self::validate_storage_config("storage.source", &config.storage.source, &mut report);
        Self::validate_storage_config("storage.target", &config.storage.target, &mut report);
        Self::validate_status_sink_config(config, &mut report);
        Self::validate_logging_config(&config.logging, &mut report);

        report
    }

    fn validate_conversion_config(config: &ConversionConfig, report: &mut ValidationReport) {
        match config.default_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => Self::check_http_url("conversion.default_url", url, report),
            None if config.routes.is_empty() => report.add_warning(
                "conversion.default_url",
                "未配置转换服务端点，非直通格式都会被判定为拒绝",
            ),
            None => {}
        }

        for (index, route) in config.routes.iter().enumerate() {
            let field = format!("conversion.routes[{}]", index);
            Self::check_http_url(&field, &route.url, report);
            if route.formats.is_empty() {
                report.add_warning(&field, "路由未声明任何格式，不会被命中");
            }
        }

        if config.timeout_secs == 0 {
            report.add_error("conversion.timeout_secs", "转换超时必须大于0");
        }
        if config.target_extension.trim().is_empty() {
            report.add_error("conversion.target_extension", "目标扩展名不能为空");
        }
    }

    fn validate_redelivery_config(config: &RedeliveryConfig, report: &mut ValidationReport) {
        if config.max_attempts == 0 {
            report.add_info("redelivery.max_attempts", "max_attempts 为 0，按 1 次尝试处理");
        }
        if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
            report.add_error(
                "redelivery.backoff_multiplier",
                &format!("退避倍数必须 >= 1.0: {}", config.backoff_multiplier),
            );
        }
        if config.max_delay_ms < config.base_delay_ms {
            report.add_warning(
                "redelivery.max_delay_ms",
                "max_delay_ms 小于 base_delay_ms，等待时间将固定为 base_delay_ms",
            );
        }
    }

    fn validate_task_queue_config(config: &Config, report: &mut ValidationReport) {
        if config.task_queue.local.channel_capacity == 0 {
            report.add_error("task_queue.local.channel_capacity", "通道容量必须大于0");
        }

        let nats = match (config.task_queue.driver, config.task_queue.nats.as_ref()) {
            (TaskQueueDriver::Nats, None) => {
                report.add_error("task_queue.nats", "driver 为 nats 但缺少 nats 配置段");
                return;
            }
            (_, Some(nats)) => nats,
            (TaskQueueDriver::Local, None) => return,
        };

        if !nats.server_url.starts_with("nats://") && !nats.server_url.starts_with("tls://") {
            report.add_error(
                "task_queue.nats.server_url",
                &format!("无效的NATS地址: {}", nats.server_url),
            );
        }
        for (field, subject) in [
            ("task_queue.nats.subject", &nats.subject),
            ("task_queue.nats.dead_letter_subject", &nats.dead_letter_subject),
        ] {
            if !is_valid_subject(subject) {
                report.add_error(field, &format!("无效的 subject: {}", subject));
            }
        }
        if nats.subject == nats.dead_letter_subject {
            report.add_error(
                "task_queue.nats.dead_letter_subject",
                "死信 subject 不能与请求 subject 相同",
            );
        }
        if nats.stream == nats.dead_letter_stream {
            report.add_error(
                "task_queue.nats.dead_letter_stream",
                "死信 Stream 不能与请求 Stream 相同",
            );
        }

        let max_attempts = config.redelivery.max_attempts.max(1) as i64;
        if nats.max_deliver > 0 && nats.max_deliver <= max_attempts {
            report.add_warning(
                "task_queue.nats.max_deliver",
                &format!(
                    "max_deliver={} 不大于 max_attempts={}，服务端可能先于重投策略丢弃消息",
                    nats.max_deliver, max_attempts
                ),
            );
        }

        let step_ms = config
            .conversion
            .timeout_secs
            .saturating_add(config.worker.step_timeout_secs.saturating_mul(3))
            .saturating_mul(1_000);
        if nats.ack_wait_ms < step_ms {
            report.add_warning(
                "task_queue.nats.ack_wait_ms",
                &format!(
                    "ack_wait_ms={} 小于单条消息最长处理时间 {}ms，处理中可能被重复投递",
                    nats.ack_wait_ms, step_ms
                ),
            );
        }
    }

    fn validate_storage_config(field: &str, config: &StorageConfig, report: &mut ValidationReport) {
        match config.storage_type {
            StorageType::Local => match config.local.as_ref() {
                Some(local) if !local.base_path.trim().is_empty() => {}
                _ => report.add_error(field, "local 存储缺少 base_path"),
            },
            StorageType::Oss => match config.oss.as_ref() {
                Some(oss) => {
                    if oss.bucket.is_empty() {
                        report.add_error(field, "oss.bucket 不能为空");
                    }
                    Self::check_http_url(&format!("{}.oss.endpoint", field), &oss.endpoint, report);
                    if oss.access_key_id.is_empty() || oss.access_key_secret.is_empty() {
                        report.add_warning(field, "OSS 访问凭证为空");
                    }
                }
                None => report.add_error(field, "type 为 oss 但缺少 oss 配置段"),
            },
            StorageType::S3 => match config.s3.as_ref() {
                Some(s3) => {
                    if s3.bucket.is_empty() {
                        report.add_error(field, "s3.bucket 不能为空");
                    }
                    if s3.region.is_empty() {
                        report.add_error(field, "s3.region 不能为空");
                    }
                    if let Some(endpoint) = s3.endpoint.as_deref() {
                        Self::check_http_url(&format!("{}.s3.endpoint", field), endpoint, report);
                    }
                }
                None => report.add_error(field, "type 为 s3 但缺少 s3 配置段"),
            },
        }
    }

    fn validate_status_sink_config(config: &Config, report: &mut ValidationReport) {
        let sink = &config.status_sink;
        match sink.driver {
            StatusSinkDriver::Http => {
                Self::check_http_url("status_sink.base_url", &sink.base_url, report)
            }
            StatusSinkDriver::Nats => {
                if config.task_queue.nats.is_none() {
                    report.add_error(
                        "status_sink.driver",
                        "NATS 状态接收端需要 task_queue.nats 连接配置",
                    );
                }
                if !is_valid_subject(&sink.subject) {
                    report.add_error(
                        "status_sink.subject",
                        &format!("无效的 subject: {}", sink.subject),
                    );
                }
            }
        }
    }

    fn validate_logging_config(config: &LoggingConfig, report: &mut ValidationReport) {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.level.to_ascii_lowercase().as_str()) {
            report.add_error("logging.level", &format!("无效的日志级别: {}", config.level));
        }
        if config.file.enabled && config.file.directory.trim().is_empty() {
            report.add_error("logging.file.directory", "启用文件日志时目录不能为空");
        }
    }

    fn check_http_url(field: &str, value: &str, report: &mut ValidationReport) {
        if !value.starts_with("http://") && !value.starts_with("https://") {
            report.add_error(field, &format!("无效的URL格式: {}", value));
        } else if let Err(err) = Url::parse(value) {
            report.add_error(field, &format!("URL 解析失败: {}", err));
        }
    }
}

/// subject 由非空 token 组成，不含空白，通配符只允许出现在订阅端
fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject.split('.').all(|token| {
            !token.is_empty()
                && token != "*"
                && token != ">"
                && !token.chars().any(|c| c.is_whitespace())
        })
}

/// 验证报告
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub info: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, field: &str, message: &str) {
        self.errors.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_info(&mut self, field: &str, message: &str) {
        self.info.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }
}

/// 验证问题
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::config::ConfigWriter;

    fn has_issue(issues: &[ValidationIssue], field: &str) -> bool {
        issues.iter().any(|issue| issue.field == field)
    }

    #[test]
    fn test_template_is_valid() {
        let report = ConfigValidator::validate_all(&ConfigWriter::generate_template());
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_nats_driver_requires_section() {
        let mut config = ConfigWriter::generate_template();
        config.task_queue.driver = TaskQueueDriver::Nats;
        let report = ConfigValidator::validate_all(&config);
        assert!(has_issue(&report.errors, "task_queue.nats"));
    }

    #[test]
    fn test_nats_subjects_and_max_deliver() {
        let mut config = ConfigWriter::generate_template();
        config.task_queue.driver = TaskQueueDriver::Nats;
        config.task_queue.nats = Some(NatsQueueConfig {
            dead_letter_subject: "docs.conversion.request".to_string(),
            max_deliver: 2,
            ack_wait_ms: 1_000,
            ..Default::default()
        });
        let report = ConfigValidator::validate_all(&config);
        assert!(has_issue(&report.errors, "task_queue.nats.dead_letter_subject"));
        assert!(has_issue(&report.warnings, "task_queue.nats.max_deliver"));
        assert!(has_issue(&report.warnings, "task_queue.nats.ack_wait_ms"));
    }

    #[test]
    fn test_bad_urls_and_multiplier() {
        let mut config = ConfigWriter::generate_template();
        config.conversion.default_url = Some("converter:3000".to_string());
        config.status_sink.base_url = "ftp://meta".to_string();
        config.redelivery.backoff_multiplier = 0.5;
        config.logging.level = "verbose".to_string();
        let report = ConfigValidator::validate_all(&config);
        assert!(has_issue(&report.errors, "conversion.default_url"));
        assert!(has_issue(&report.errors, "status_sink.base_url"));
        assert!(has_issue(&report.errors, "redelivery.backoff_multiplier"));
        assert!(has_issue(&report.errors, "logging.level"));
    }

    #[test]
    fn test_storage_section_mismatch() {
        let mut config = ConfigWriter::generate_template();
        config.storage.target.storage_type = StorageType::S3;
        let report = ConfigValidator::validate_all(&config);
        assert!(has_issue(&report.errors, "storage.target"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: Config =
            serde_yaml::from_str(include_str!("../../../config/config.example.yaml")).unwrap();
        assert_eq!(config.task_queue.driver, TaskQueueDriver::Nats);
        assert_eq!(config.storage.source.storage_type, StorageType::Oss);
        assert_eq!(config.conversion.routes.len(), 1);

        let report = ConfigValidator::validate_all(&config);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(has_issue(&report.warnings, "storage.source"));
    }

    #[test]
    fn test_subject_rules() {
        assert!(is_valid_subject("docs.conversion.request"));
        assert!(!is_valid_subject("docs..request"));
        assert!(!is_valid_subject("docs.*"));
        assert!(!is_valid_subject("docs conversion"));
    }
}
