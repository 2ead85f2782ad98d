// 缓存模块
// 滑动窗口记录的键、数据结构和存储操作

pub mod keys;
pub mod models;
pub mod operations;

// 重新导出常用类型，方便其他模块使用
pub use models::window::WindowEntry;
pub use operations::window::{MemoryWindowStore, RedisWindowStore, StoreError, WindowStore};
