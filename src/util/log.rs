use crate::util::config::{LevelConfig, LoggingConfig};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::EnvFilter, Layer, Registry};

const CRATE_TARGET: &str = "docs_converter";

static DEBUG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// 初始化日志：控制台 + 按天滚动文件，返回的 guard 需由调用方持有到进程退出
pub fn log_init_with_config(
    file_prefix: &str,
    config: &LoggingConfig,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level_filter = parse_level(&config.level).unwrap_or(LevelFilter::INFO);
    let filter_expression = build_env_filter_expression(level_filter, config.level_config.as_ref());
    let use_json = config.structured.unwrap_or(false);

    let mut layers: Vec<BoxedLayer> = vec![output_layer(
        use_json,
        false,
        io::stdout,
        env_filter(&filter_expression, level_filter),
    )];

    let mut guard = None;
    let mut log_dir = None;
    if config.file.enabled {
        let dir = resolve_log_dir(&config.file.directory);
        std::fs::create_dir_all(&dir)?;

        let (info_writer, info_guard) =
            tracing_appender::non_blocking(daily(&dir, format!("{}-info", file_prefix)));
        layers.push(output_layer(
            use_json,
            true,
            info_writer,
            env_filter(&filter_expression, level_filter),
        ));
        guard = Some(info_guard);

        if config.enable_debug_file {
            let (debug_writer, debug_guard) =
                tracing_appender::non_blocking(daily(&dir, format!("{}-debug", file_prefix)));
            let _ = DEBUG_GUARD.set(debug_guard);
            let debug_expression =
                build_env_filter_expression(LevelFilter::DEBUG, config.level_config.as_ref());
            layers.push(output_layer(
                use_json,
                true,
                debug_writer,
                env_filter(&debug_expression, LevelFilter::DEBUG),
            ));
        }
        log_dir = Some(dir);
    }

    Registry::default().with(layers).try_init()?;

    match log_dir {
        Some(dir) => {
            tracing::info!(
                event = "log.init",
                level = %config.level,
                console = true,
                file = true,
                directory = %dir.display(),
                rotation = "daily",
                structured = use_json,
                split_debug = config.enable_debug_file
            );
            if let Some(retention) = config.file.retention_days {
                tracing::info!(event = "log.retention", days = retention);
                if let Err(e) = cleanup_old_logs(&dir, file_prefix, retention) {
                    tracing::warn!("清理旧日志失败: {}", e);
                }
            }
        }
        None => {
            tracing::info!(event = "log.init", level = %config.level, console = true, file = false, structured = use_json);
        }
    }

    Ok(guard)
}

fn output_layer<W>(use_json: bool, file: bool, writer: W, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    if use_json {
        layer()
            .json()
            .with_target(false)
            .with_ansi(!file)
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    } else {
        let format = Format::default()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false);
        layer()
            .event_format(format)
            .with_ansi(!file)
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    }
}

fn env_filter(expression: &str, fallback: LevelFilter) -> EnvFilter {
    EnvFilter::try_new(expression).unwrap_or_else(|_| EnvFilter::new(level_filter_to_str(fallback)))
}

/// 相对路径基于工作目录解析；在 bin 目录下启动时使用上级目录
fn resolve_log_dir(directory: &str) -> PathBuf {
    let path = Path::new(directory);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if current_dir.file_name() == Some(std::ffi::OsStr::new("bin")) {
        if let Some(parent) = current_dir.parent() {
            return parent.join(directory);
        }
    }
    current_dir.join(directory)
}

/// 删除超过保留天数的本服务日志文件，返回删除数量
pub fn cleanup_old_logs(log_dir: &Path, file_prefix: &str, retention_days: u32) -> anyhow::Result<usize> {
    if !log_dir.exists() {
        tracing::debug!("日志目录不存在: {}", log_dir.display());
        return Ok(0);
    }

    let retention = std::time::Duration::from_secs(retention_days as u64 * 24 * 60 * 60);
    let cutoff = std::time::SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(std::time::UNIX_EPOCH);

    let mut deleted_count = 0;
    let mut total_size_deleted = 0u64;

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        // 只处理本服务的日志文件
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("");
        if !file_name.starts_with(file_prefix) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .or_else(|_| metadata.created())
            .unwrap_or_else(|_| std::time::SystemTime::now());
        if modified >= cutoff {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                deleted_count += 1;
                total_size_deleted += metadata.len();
                tracing::debug!("已删除过期日志: {}", path.display());
            }
            Err(e) => tracing::warn!("删除日志文件失败: {} - {}", path.display(), e),
        }
    }

    if deleted_count > 0 {
        let size_mb = total_size_deleted as f64 / (1024.0 * 1024.0);
        tracing::info!(
            "已清理 {} 个过期日志文件，释放空间 {:.2} MB",
            deleted_count,
            size_mb
        );
    }

    Ok(deleted_count)
}

/// 日志目录可写性检查
pub fn check_log_health(log_dir: &Path) -> serde_json::Value {
    let exists = log_dir.exists();
    let writable = exists && {
        let test_file = log_dir.join(".write_test");
        let write_ok = std::fs::write(&test_file, "test").is_ok();
        if write_ok {
            let _ = std::fs::remove_file(&test_file);
        }
        write_ok
    };

    serde_json::json!({
        "status": if exists && writable { "healthy" } else { "error" },
        "directory_exists": exists,
        "directory_writable": writable,
        "path": log_dir.to_string_lossy()
    })
}

fn build_env_filter_expression(
    default_level: LevelFilter,
    level_config: Option<&LevelConfig>,
) -> String {
    let mut directives = vec![level_filter_to_str(default_level).to_string()];

    if let Some(cfg) = level_config {
        if let Some(level) = cfg.pipeline.as_deref().and_then(normalize_level_str) {
            directives.push(format!("{CRATE_TARGET}::pipeline={level}"));
            directives.push(format!("{CRATE_TARGET}::util::worker={level}"));
        }
        if let Some(level) = cfg.adapters.as_deref().and_then(normalize_level_str) {
            directives.push(format!("{CRATE_TARGET}::storage={level}"));
            directives.push(format!("{CRATE_TARGET}::util::task_queue={level}"));
            directives.push(format!("{CRATE_TARGET}::util::converter={level}"));
            directives.push(format!("{CRATE_TARGET}::util::status_sink={level}"));
        }
        if let Some(level) = cfg.system.as_deref().and_then(normalize_level_str) {
            directives.push(format!("{CRATE_TARGET}::server={level}"));
            directives.push(format!("{CRATE_TARGET}::util::config={level}"));
        }

        let mut overrides: Vec<_> = cfg.overrides.iter().collect();
        overrides.sort();
        for (target, level_str) in overrides {
            if let Some(level) = normalize_level_str(level_str) {
                directives.push(format!("{}={level}", normalize_directive_target(target)));
            }
        }
    }

    directives.join(",")
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

fn normalize_level_str(level: &str) -> Option<&'static str> {
    parse_level(level).map(level_filter_to_str)
}

fn level_filter_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
    }
}

fn normalize_directive_target(target: &str) -> String {
    if let Some(raw) = target.strip_prefix("target:") {
        raw.to_string()
    } else if target.contains("::") {
        target.to_string()
    } else {
        format!("{CRATE_TARGET}::{}", target.replace('.', "::"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_filter_expression_with_overrides() {
        let cfg = LevelConfig {
            pipeline: Some("debug".to_string()),
            adapters: None,
            system: Some("bogus".to_string()),
            overrides: HashMap::from([
                ("util.task_queue".to_string(), "trace".to_string()),
                ("target:async_nats".to_string(), "WARN".to_string()),
            ]),
        };
        let expr = build_env_filter_expression(LevelFilter::INFO, Some(&cfg));
        assert!(expr.starts_with("info,"));
        assert!(expr.contains("docs_converter::pipeline=debug"));
        assert!(expr.contains("docs_converter::util::task_queue=trace"));
        assert!(expr.contains("async_nats=warn"));
        assert!(!expr.contains("docs_converter::server"));
        assert!(EnvFilter::try_new(&expr).is_ok());
    }

    #[test]
    fn test_cleanup_only_touches_own_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docs-converter-info.2024-01-01"), "old").unwrap();
        std::fs::write(dir.path().join("other.log"), "keep").unwrap();

        // 保留 0 天：所有本服务日志都已过期
        std::thread::sleep(std::time::Duration::from_millis(10));
        let deleted = cleanup_old_logs(dir.path(), "docs-converter", 0).unwrap();
        assert_eq!(deleted, 1);
        assert!(dir.path().join("other.log").exists());
    }

    #[test]
    fn test_log_health() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(check_log_health(dir.path())["status"], "healthy");
        assert_eq!(check_log_health(&dir.path().join("missing"))["status"], "error");
    }
}
