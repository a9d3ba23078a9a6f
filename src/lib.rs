pub mod build_info;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod storage;
pub mod util;

/// 智能查找配置文件路径，适应开发和生产环境
pub fn find_config_file_path(filename: &str) -> std::path::PathBuf {
    server::config::ConfigManager::find_config_file_path(filename)
}
