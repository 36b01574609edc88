//! 状态存储抽象
//!
//! 所有组件只通过 [`StateStore`] 访问共享存储。它本身不含业务逻辑，
//! 只负责给每次调用加上时限：调用方的 [`Deadline`] 与单次操作超时取较早者。
//!
//! | 超时来源 | 错误 |
//! |----------|------|
//! | 单次操作超时（后端慢或不可达） | [`StoreError::Unavailable`] |
//! | 调用方 deadline 耗尽 | [`StoreError::Timeout`] |
//!
//! 后端通过 [`StoreBackend`] 接入：
//!
//! - [`InMemoryStateStore`]：进程内存，适合测试和单实例
//! - [`FileStateStore`]：JSON 文件持久化
//!
//! ## Key 约定
//!
//! | Key | 值 | TTL |
//! |-----|----|-----|
//! | `inv:state:{session_id}` | 带版本的会话状态 | 会话 TTL |
//! | `client:session:{user_id}:{client_id}` | `session_id` | 索引 TTL |
//! | `client:owner:{session_id}` | 对应的索引 key | 索引 TTL |

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use crate::error::{Result, StateError, StoreError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub const STATE_KEY_PREFIX: &str = "inv:state:";
pub const CLIENT_INDEX_PREFIX: &str = "client:session:";
pub const CLIENT_OWNER_PREFIX: &str = "client:owner:";

const MAX_IDENTIFIER_LEN: usize = 128;

pub fn state_key(session_id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{session_id}")
}

pub fn client_index_key(user_id: &str, client_id: &str) -> String {
    format!("{CLIENT_INDEX_PREFIX}{user_id}:{client_id}")
}

pub fn client_owner_key(session_id: &str) -> String {
    format!("{CLIENT_OWNER_PREFIX}{session_id}")
}

/// 校验会进入 key 的标识符：非空、不超过 128 字符、不含 `:` 和空白
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StateError::InvalidIdentifier(format!("{kind} is empty")).into());
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(StateError::InvalidIdentifier(format!(
            "{kind} exceeds {MAX_IDENTIFIER_LEN} characters"
        ))
        .into());
    }
    if value.chars().any(|c| c == ':' || c.is_whitespace()) {
        return Err(StateError::InvalidIdentifier(format!(
            "{kind} '{value}' contains ':' or whitespace"
        ))
        .into());
    }
    Ok(())
}

// ── Deadline ─────────────────────────────────────────────────────────────────

/// 显式的操作截止时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// 超出 `Instant` 表示范围时退化为一百年后
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self(
            now.checked_add(timeout)
                .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600)),
        )
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

// ── StoreBackend trait ───────────────────────────────────────────────────────

/// 一页前缀扫描结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// 下一页游标；`None` 表示已扫描到末尾
    pub next_cursor: Option<String>,
}

/// 带 TTL 的 KV 后端
///
/// 过期条目对 `get` 不可见，但在被删除之前仍会出现在
/// `scan_expired_candidates` 的结果中，供清理任务回收关联数据。
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 写入并重置 TTL
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// 删除 key，返回是否存在（含已过期未回收的条目）
    async fn delete(&self, key: &str) -> Result<bool>;

    /// 返回最多 `batch_size` 个 TTL 已过、尚未删除的 key
    async fn scan_expired_candidates(&self, prefix: &str, batch_size: usize)
    -> Result<Vec<String>>;

    /// 按 key 顺序分页列出仍存活的 key，`cursor` 为上一页最后一个 key（不含）
    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<ScanPage>;

    /// 剩余存活时间；key 不存在或已过期返回 `None`
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// 只重置存活 key 的 TTL，不改写内容；key 不存在或已过期返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// 释放后端资源
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ── StateStore ───────────────────────────────────────────────────────────────

/// 带时限的存储门面，进程启动时创建一次，以 `Arc` 注入各组件
pub struct StateStore {
    backend: Arc<dyn StoreBackend>,
    op_timeout: Duration,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StoreBackend>, op_timeout: Duration) -> Self {
        Self {
            backend,
            op_timeout,
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    pub async fn get(&self, key: &str, deadline: Deadline) -> Result<Option<Vec<u8>>> {
        self.bounded("get", deadline, self.backend.get(key)).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        self.bounded("set", deadline, self.backend.set(key, value, ttl))
            .await
    }

    pub async fn delete(&self, key: &str, deadline: Deadline) -> Result<bool> {
        self.bounded("delete", deadline, self.backend.delete(key))
            .await
    }

    pub async fn scan_expired_candidates(
        &self,
        prefix: &str,
        batch_size: usize,
        deadline: Deadline,
    ) -> Result<Vec<String>> {
        self.bounded(
            "scan_expired_candidates",
            deadline,
            self.backend.scan_expired_candidates(prefix, batch_size),
        )
        .await
    }

    pub async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        batch_size: usize,
        deadline: Deadline,
    ) -> Result<ScanPage> {
        self.bounded(
            "scan_prefix",
            deadline,
            self.backend.scan_prefix(prefix, cursor, batch_size),
        )
        .await
    }

    pub async fn ttl(&self, key: &str, deadline: Deadline) -> Result<Option<Duration>> {
        self.bounded("ttl", deadline, self.backend.ttl(key)).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration, deadline: Deadline) -> Result<bool> {
        self.bounded("expire", deadline, self.backend.expire(key, ttl))
            .await
    }

    /// 关闭后端（停机时显式调用）
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    async fn bounded<T>(
        &self,
        op: &str,
        deadline: Deadline,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if deadline.is_expired() {
            return Err(StoreError::Timeout { op: op.to_string() }.into());
        }
        let op_deadline = Deadline::after(self.op_timeout);
        let caller_bound = deadline <= op_deadline;
        let effective = if caller_bound { deadline } else { op_deadline };

        match tokio::time::timeout_at(effective.instant(), fut).await {
            Ok(result) => result,
            Err(_) if caller_bound => Err(StoreError::Timeout { op: op.to_string() }.into()),
            Err(_) => {
                warn!(op, timeout_ms = self.op_timeout.as_millis() as u64, "⏱️ 存储操作超时");
                Err(StoreError::Unavailable {
                    op: op.to_string(),
                    reason: format!("timed out after {}ms", self.op_timeout.as_millis()),
                }
                .into())
            }
        }
    }
}
