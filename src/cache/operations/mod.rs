/// 缓存操作
/// 提供缓存操作的功能实现

// 滑动窗口存储
pub mod window;

// 重新导出常用操作
pub use window::{MAX_RETENTION_SECS, MemoryWindowStore, RedisWindowStore, StoreError, WindowStore, prune};
