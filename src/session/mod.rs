//! 会话层
//!
//! | 类型 | 说明 |
//! |------|------|
//! | [`InvestigationStateRepository`] | `inv:state:*` 的读写，每次保存刷新 TTL |
//! | [`ClientSessionIndex`] | `(user_id, client_id) → session_id`，支持断线恢复 |
//! | [`SessionLifecycleManager`] | 创建或恢复、心跳、关闭，以及对外的 load / save |
//! | [`CleanupScheduler`] | 周期回收过期会话和悬挂索引 |
//!
//! 所有组件共享同一个 `Arc<StateStore>`，进程内不缓存任何调查状态，
//! 多实例部署只通过共享存储协调。

pub mod cleanup;
pub mod client_index;
pub mod lifecycle;
pub mod repository;

pub use cleanup::{CleanupHandle, CleanupRunReport, CleanupScheduler, CleanupStatus};
pub use client_index::ClientSessionIndex;
pub use lifecycle::{
    LifecycleStats, LifecycleStatsSnapshot, ResumeOutcome, SessionLifecycleManager,
};
pub use repository::InvestigationStateRepository;
