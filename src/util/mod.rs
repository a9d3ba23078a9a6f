pub mod config;
pub mod converter;
pub mod http_client; // [global] HTTP客户端模块（支持依赖注入）
pub mod log;
pub mod logging;
pub mod status_sink;
pub mod task_queue;
pub mod worker;
