/// 缓存数据模型
/// 定义缓存数据的结构体
// 滑动窗口记录
pub mod window;

// 重新导出常用类型
pub use window::WindowEntry;
