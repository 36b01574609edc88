//! 可脚本化的存储后端，用于测试超时、故障和重试路径。
//!
//! # 示例
//!
//! ```rust
//! use investigation_state::store::{Deadline, StateStore, StoreBackend};
//! use investigation_state::testing::{MockStoreBackend, StoreOp};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let backend = Arc::new(MockStoreBackend::new());
//! backend.fail_next(StoreOp::Get, "connection reset");
//!
//! let store = StateStore::new(backend.clone(), Duration::from_secs(1));
//! let deadline = Deadline::after(Duration::from_secs(5));
//! assert!(store.get("inv:state:s1", deadline).await.is_err());
//! assert!(store.get("inv:state:s1", deadline).await.unwrap().is_none());
//! assert_eq!(backend.calls_for(StoreOp::Get), 2);
//! # }
//! ```

use crate::error::{Result, StoreError};
use crate::store::{InMemoryStateStore, ScanPage, StoreBackend};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Set,
    Delete,
    ScanExpired,
    ScanPrefix,
    Ttl,
    Expire,
}

impl StoreOp {
    fn name(self) -> &'static str {
        match self {
            StoreOp::Get => "get",
            StoreOp::Set => "set",
            StoreOp::Delete => "delete",
            StoreOp::ScanExpired => "scan_expired_candidates",
            StoreOp::ScanPrefix => "scan_prefix",
            StoreOp::Ttl => "ttl",
            StoreOp::Expire => "expire",
        }
    }
}

/// 包装 [`InMemoryStateStore`]，可注入延迟、一次性故障和整体离线
pub struct MockStoreBackend {
    inner: InMemoryStateStore,
    latency: Mutex<Option<Duration>>,
    failures: Mutex<HashMap<StoreOp, VecDeque<String>>>,
    key_failures: Mutex<HashMap<(StoreOp, String), String>>,
    offline: AtomicBool,
    /// 每次调用的操作和 key（扫描为前缀），按顺序记录
    calls: Mutex<Vec<(StoreOp, String)>>,
}

impl Default for MockStoreBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStoreBackend {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            latency: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            key_failures: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用前等待固定时长（基于 tokio 时钟，可配合 `start_paused`）
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// 追加一次性故障：下一次 `op` 调用返回 `Unavailable`
    pub fn fail_next(&self, op: StoreOp, reason: impl Into<String>) {
        lock(&self.failures)
            .entry(op)
            .or_default()
            .push_back(reason.into());
    }

    pub fn with_failure(self, op: StoreOp, reason: impl Into<String>) -> Self {
        self.fail_next(op, reason);
        self
    }

    /// 持续故障：`op` 作用于 `key` 的每次调用都返回 `Unavailable`，直到 [`clear_key_failures`](Self::clear_key_failures)
    pub fn fail_key(&self, op: StoreOp, key: impl Into<String>, reason: impl Into<String>) {
        lock(&self.key_failures).insert((op, key.into()), reason.into());
    }

    pub fn clear_key_failures(&self) {
        lock(&self.key_failures).clear();
    }

    /// 离线期间所有调用都返回 `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 底层内存存储，可绕过故障注入直接读写
    pub fn inner(&self) -> &InMemoryStateStore {
        &self.inner
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_for(&self, op: StoreOp) -> usize {
        lock(&self.calls).iter().filter(|(o, _)| *o == op).count()
    }

    /// 所有历史调用（按时序排列）
    pub fn calls(&self) -> Vec<(StoreOp, String)> {
        lock(&self.calls).clone()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    async fn enter(&self, op: StoreOp, key: &str) -> Result<()> {
        lock(&self.calls).push((op, key.to_string()));

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(unavailable(op, "backend offline"));
        }
        if let Some(reason) = lock(&self.key_failures).get(&(op, key.to_string())) {
            return Err(unavailable(op, reason));
        }
        let scripted = lock(&self.failures)
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(reason) => Err(unavailable(op, &reason)),
            None => Ok(()),
        }
    }
}

fn unavailable(op: StoreOp, reason: &str) -> crate::error::InvestigationError {
    StoreError::Unavailable {
        op: op.name().to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl StoreBackend for MockStoreBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.enter(StoreOp::Get, key).await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.enter(StoreOp::Set, key).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter(StoreOp::Delete, key).await?;
        self.inner.delete(key).await
    }

    async fn scan_expired_candidates(
        &self,
        prefix: &str,
        batch_size: usize,
    ) -> Result<Vec<String>> {
        self.enter(StoreOp::ScanExpired, prefix).await?;
        self.inner.scan_expired_candidates(prefix, batch_size).await
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<ScanPage> {
        self.enter(StoreOp::ScanPrefix, prefix).await?;
        self.inner.scan_prefix(prefix, cursor, batch_size).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.enter(StoreOp::Ttl, key).await?;
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.enter(StoreOp::Expire, key).await?;
        self.inner.expire(key, ttl).await
    }
}
