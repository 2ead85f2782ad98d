/// 缓存键模块
/// 提供各种缓存键生成函数

// 准入控制窗口键模块
pub mod window_keys;

// 重新导出常用的键生成函数
pub use window_keys::{processing_time_key, rate_limit_key, tokens_key};
