use anyhow::Result;
use async_trait::async_trait;

/// 存储操作trait
///
/// 只暴露流水线需要的按键读写，对象存储内部细节由各实现负责。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 写入文件，键已存在时覆盖
    async fn put(&self, key: &str, data: &[u8], content_type: Option<&str>) -> Result<()>;

    /// 读取文件，不存在时返回 `Ok(None)`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 健康检查
    async fn health_check(&self) -> Result<bool>;

    /// 后端名称，用于日志
    fn backend(&self) -> &'static str;
}
