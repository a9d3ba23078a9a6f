//! 死信回放：把死信 Stream 中的消息原样重新发布到转换请求 subject
//!
//! 用法: `replay-dead-letters [LIMIT]`，LIMIT 也可通过 `REPLAY_LIMIT` 设置，默认 10。

use std::env;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use docs_converter::server::ConfigManager;
use docs_converter::util::config::TaskQueueDriver;
use docs_converter::util::task_queue::replay_dead_letters;

fn parse_limit(arg: Option<String>, default: usize) -> usize {
    arg.or_else(|| env::var("REPLAY_LIMIT").ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    let limit = parse_limit(env::args().nth(1), 10);

    let (config, validation) = ConfigManager::load_and_validate().context("加载配置文件失败")?;
    let _guard = ConfigManager::initialize_logging(&config).context("初始化日志系统失败")?;
    ConfigManager::enforce_report(&validation)?;

    if config.task_queue.driver != TaskQueueDriver::Nats {
        return Err(anyhow!("死信回放仅支持 NATS 队列，当前驱动: {}", config.task_queue.driver.as_str()));
    }
    let nats = config
        .task_queue
        .nats
        .as_ref()
        .ok_or_else(|| anyhow!("缺少 task_queue.nats 配置"))?;

    info!(
        limit,
        from = %nats.dead_letter_subject,
        to = %nats.subject,
        "准备回放死信消息"
    );

    let summary = replay_dead_letters(nats, limit).await?;
    info!(
        replayed = summary.replayed,
        failed = summary.failed,
        "[ok] 死信回放完成"
    );
    println!("replayed={} failed={}", summary.replayed, summary.failed);

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
