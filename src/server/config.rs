//! 配置管理模块
//! 负责配置文件的定位、加载、验证和日志初始化

use crate::util::config::{Config, ConfigLoader, ConfigValidator, ConfigWriter, ValidationReport};
use crate::util::log::log_init_with_config;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "docs-converter";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 加载配置（含环境变量覆盖）并生成验证报告
    ///
    /// 配置文件不存在时写出默认模板并返回错误，需修改后重新启动。
    pub fn load_and_validate() -> Result<(Config, ValidationReport)> {
        let config_path = Self::find_config_file_path("config.yaml");
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(config_path: &Path) -> Result<(Config, ValidationReport)> {
        info!("[clipboard] 加载配置文件: {}", config_path.display());

        if !config_path.exists() {
            Self::write_template(config_path);
            return Err(anyhow!(
                "配置文件不存在，已生成模板: {}，请修改后重新启动",
                config_path.display()
            ));
        }

        let config = ConfigLoader::apply_env_overrides(ConfigLoader::read_yaml(config_path)?);
        let report = ConfigValidator::validate_all(&config);

        info!("[ok] 配置加载完成");
        Ok((config, report))
    }

    /// 初始化日志系统，返回的 guard 需持有到进程退出
    pub fn initialize_logging(config: &Config) -> Result<Option<WorkerGuard>> {
        log_init_with_config(LOG_FILE_PREFIX, &config.logging)
    }

    /// 输出验证报告中的警告与提示，存在错误时返回汇总错误
    pub fn enforce_report(report: &ValidationReport) -> Result<()> {
        for issue in &report.info {
            info!("[info] 配置提示 {}: {}", issue.field, issue.message);
        }
        for issue in &report.warnings {
            warn!("[warn] 配置警告 {}: {}", issue.field, issue.message);
        }
        if report.has_errors() {
            for issue in &report.errors {
                tracing::error!("[fail] 配置错误 {}: {}", issue.field, issue.message);
            }
            return Err(anyhow!("配置验证失败: {} 个错误", report.errors.len()));
        }
        Ok(())
    }

    /// 智能查找配置文件路径，适应开发和生产环境
    pub fn find_config_file_path(filename: &str) -> PathBuf {
        let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        // 情况1：当前目录下的 config/
        let config_in_current = current_dir.join("config").join(filename);
        if config_in_current.exists() {
            return config_in_current;
        }

        // 情况2：在 bin/ 目录启动时使用上级目录的 config/
        if let Some(parent) = current_dir.parent() {
            let config_in_parent = parent.join("config").join(filename);
            if config_in_parent.exists() {
                return config_in_parent;
            }
        }

        // 情况3：可执行文件位于 bin/ 时检查项目根目录
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            if exe_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
                if let Some(project_root) = exe_dir.parent() {
                    let config_in_root = project_root.join("config").join(filename);
                    if config_in_root.exists() {
                        return config_in_root;
                    }
                }
            }
        }

        // 情况4：当前目录
        let dev_path = current_dir.join(filename);
        if dev_path.exists() {
            return dev_path;
        }

        // 都不存在时，模板写到 config/ 下
        if current_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
            if let Some(parent) = current_dir.parent() {
                return parent.join("config").join(filename);
            }
        }
        current_dir.join("config").join(filename)
    }

    fn write_template(config_path: &Path) {
        info!("[note] 创建默认配置文件: {}", config_path.display());
        if let Err(write_err) = ConfigWriter::write_yaml(&ConfigWriter::generate_template(), config_path) {
            warn!("[fail] 创建默认配置文件失败: {}", write_err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_template_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("config.yaml");

        let err = ConfigManager::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("已生成模板"));
        assert!(path.exists());

        // 模板可直接加载且无错误
        let (config, report) = ConfigManager::load_from_path(&path).unwrap();
        assert!(!report.has_errors(), "{:?}", report.errors);
        assert_eq!(config.redelivery.max_attempts, 3);
        assert!(ConfigManager::enforce_report(&report).is_ok());
    }

    #[test]
    fn test_enforce_report_with_errors() {
        let mut report = ValidationReport::new();
        report.add_warning("a", "warn");
        assert!(ConfigManager::enforce_report(&report).is_ok());
        report.add_error("b", "bad");
        assert!(ConfigManager::enforce_report(&report).is_err());
    }
}
