//! 退出信号处理

use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::util::logging::standards::events;

/// 收到 SIGINT / SIGTERM 后取消 `token`
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c() => {
                info!(event = events::WORKER_SIGNAL, signal = "SIGINT");
            }
            result = wait_for_sigterm() => {
                if let Err(e) = result {
                    warn!(event = events::WORKER_SIGNAL, error = %e, "SIGTERM 监听注册失败，仅响应 Ctrl+C");
                    tokio::select! {
                        _ = ctrl_c() => {}
                        _ = token.cancelled() => return,
                    }
                }
                info!(event = events::WORKER_SIGNAL, signal = "SIGTERM");
            }
            _ = token.cancelled() => return,
        }
        info!(event = events::WORKER_SHUTDOWN_BEGIN, "[stop] 停止接收新消息，等待在途任务完成");
        token.cancel();
    });
}

/// 等待 SIGTERM 信号
async fn wait_for_sigterm() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term_signal = signal(SignalKind::terminate())?;
        term_signal.recv().await;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
        Ok(())
    }
}
