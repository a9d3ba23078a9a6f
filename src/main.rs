use std::io::Write;

use docs_converter::{build_info, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "Unknown location".to_string());

        eprintln!("[PANIC] 程序异常退出");
        eprintln!("位置: {}", location);
        eprintln!("原因: {}", message);
        eprintln!(
            "时间: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        tracing::error!(event = "panic.raised", location = %location, reason = %message, time = %chrono::Utc::now());

        let panic_msg = format!(
            "PANIC OCCURRED\nLocation: {}\nReason: {}\nTime: {}\n\n",
            location,
            message,
            chrono::Utc::now()
        );

        if let Err(e) = std::fs::write("./panic.log", &panic_msg) {
            eprintln!("[WARN] 无法写入panic.log: {}", e);
        } else {
            eprintln!("[OK] Panic信息已保存到 ./panic.log");
        }

        std::io::stderr().flush().ok();
    }));

    let mut args = std::env::args();
    let _ = args.next();

    match args.next().as_deref() {
        None | Some("worker") | Some("--worker") => server::start_worker().await,
        Some("health-check") | Some("--health-check") => {
            let report = server::check_system_health().await?;
            println!(
                "健康检查: overall={}, source={:?}, target={:?}, queue={:?}, queue_depth={:?}, sink={:?}, logs={}",
                report.overall_healthy,
                report.source_storage,
                report.target_storage,
                report.queue,
                report.queue_depth,
                report.status_sink,
                report.logs
            );
            if !report.overall_healthy {
                std::process::exit(1);
            }
            Ok(())
        }
        Some("check-config") | Some("--check-config") => {
            let (path, report) = server::check_config()?;
            println!("配置文件: {}", path.display());
            for issue in &report.errors {
                println!("[error] {}: {}", issue.field, issue.message);
            }
            for issue in &report.warnings {
                println!("[warn]  {}: {}", issue.field, issue.message);
            }
            for issue in &report.info {
                println!("[info]  {}: {}", issue.field, issue.message);
            }
            if report.has_errors() {
                std::process::exit(2);
            }
            println!("[ok] 配置有效");
            Ok(())
        }
        Some("version") | Some("--version") | Some("-V") => {
            println!("{}", build_info::summary());
            Ok(())
        }
        Some(other) => {
            eprintln!("未知命令: {}", other);
            eprintln!("用法: docs-converter [worker|health-check|check-config|version]");
            std::process::exit(64);
        }
    }
}
