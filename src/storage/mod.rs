// 存储抽象层模块

pub mod factory;
pub mod gateway;
pub mod local;
pub mod object;
pub mod traits;

pub use factory::{create_storage, StorageConfig, StorageType};
pub use gateway::ObjectStoreGateway;
pub use traits::Storage;
