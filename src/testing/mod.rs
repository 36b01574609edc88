//! 测试基础设施
//!
//! 在不依赖真实存储服务的情况下测试仓储、生命周期和清理任务。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockStoreBackend`] | 内存后端 + 延迟 / 故障 / 离线注入 |
//! | [`StoreOp`] | 故障注入和调用统计的操作类型 |
//!
//! 所有 Mock 完全在内存中运行，可安全地在多任务测试中共享。
//! 延迟基于 tokio 时钟，配合 `#[tokio::test(start_paused = true)]` 不会真实等待。

mod mock_store;

pub use mock_store::{MockStoreBackend, StoreOp};
