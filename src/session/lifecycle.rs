//! 会话生命周期：创建或恢复、心跳、关闭
//!
//! ```text
//! create_or_resume(user, Some(client))
//!   └─ index.lookup ──▶ 有 session_id ──▶ repository.load
//!         │                                ├─ Ok        → 刷新 TTL，resumed = true
//!         │                                ├─ NotFound  → 自愈：新建并重新绑定
//!         │                                └─ 损坏      → 删除损坏状态，新建
//!         └─ 无 ─────────────────────────────▶ 新建并绑定，resumed = false
//! ```
//!
//! 存储不可用时直接返回错误，不会创建未持久化的会话。

use crate::config::StateConfig;
use crate::error::{InvestigationError, Result, StateError};
use crate::investigation::{Investigation, Session};
use crate::session::client_index::ClientSessionIndex;
use crate::session::repository::InvestigationStateRepository;
use crate::store::{Deadline, validate_identifier};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `create_or_resume` 的结果
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub session_id: String,
    pub resumed: bool,
    pub investigation: Investigation,
}

// ── 统计 ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LifecycleStats {
    created: AtomicU64,
    resumed: AtomicU64,
    index_self_heals: AtomicU64,
    corrupt_recoveries: AtomicU64,
    read_retries: AtomicU64,
    closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStatsSnapshot {
    pub created: u64,
    pub resumed: u64,
    pub index_self_heals: u64,
    pub corrupt_recoveries: u64,
    pub read_retries: u64,
    pub closed: u64,
}

impl LifecycleStats {
    pub fn snapshot(&self) -> LifecycleStatsSnapshot {
        LifecycleStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            index_self_heals: self.index_self_heals.load(Ordering::Relaxed),
            corrupt_recoveries: self.corrupt_recoveries.load(Ordering::Relaxed),
            read_retries: self.read_retries.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ── SessionLifecycleManager ──────────────────────────────────────────────────

pub struct SessionLifecycleManager {
    repository: InvestigationStateRepository,
    index: ClientSessionIndex,
    session_ttl: Duration,
    index_ttl: Duration,
    read_retry_backoff: Duration,
    stats: LifecycleStats,
}

impl SessionLifecycleManager {
    pub fn new(
        repository: InvestigationStateRepository,
        index: ClientSessionIndex,
        config: &StateConfig,
    ) -> Self {
        Self {
            repository,
            index,
            session_ttl: config.session_ttl(),
            index_ttl: config.client_index_ttl(),
            read_retry_backoff: config.read_retry_backoff(),
            stats: LifecycleStats::default(),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn stats(&self) -> LifecycleStatsSnapshot {
        self.stats.snapshot()
    }

    /// 恢复 `(user_id, client_id)` 对应的会话，或新建一个
    ///
    /// 无 `client_id` 时总是新建且不写索引。在索引 TTL 内以相同参数重复调用
    /// 总是收敛到同一个 `session_id`。
    pub async fn create_or_resume(
        &self,
        user_id: &str,
        client_id: Option<&str>,
        deadline: Deadline,
    ) -> Result<ResumeOutcome> {
        validate_identifier("user_id", user_id)?;
        let Some(client_id) = client_id else {
            return self.create(user_id, None, deadline).await;
        };
        validate_identifier("client_id", client_id)?;

        let found = self
            .with_read_retry("index.lookup", deadline, move || {
                self.index.lookup(user_id, client_id, deadline)
            })
            .await?;

        if let Some(session_id) = found {
            match self.resolve(user_id, client_id, &session_id, deadline).await {
                Ok(mut investigation) => {
                    self.repository
                        .save(&mut investigation, self.session_ttl, deadline)
                        .await?;
                    self.index
                        .bind(user_id, client_id, &session_id, self.index_ttl, deadline)
                        .await?;
                    LifecycleStats::bump(&self.stats.resumed);
                    info!(session_id = %session_id, user_id, client_id, "♻️ 会话已恢复");
                    return Ok(ResumeOutcome {
                        session_id,
                        resumed: true,
                        investigation,
                    });
                }
                Err(e) if e.is_recoverable_state() => {}
                Err(e) => return Err(e),
            }
        }

        self.create(user_id, Some(client_id), deadline).await
    }

    /// 加载索引指向的会话；不存在、损坏或归属不符时返回可恢复错误
    async fn resolve(
        &self,
        user_id: &str,
        client_id: &str,
        session_id: &str,
        deadline: Deadline,
    ) -> Result<Investigation> {
        let inconsistency = || -> InvestigationError {
            StateError::IndexInconsistency {
                user_id: user_id.to_string(),
                client_id: client_id.to_string(),
                session_id: session_id.to_string(),
            }
            .into()
        };

        match self.load(session_id, deadline).await {
            Ok(investigation)
                if investigation.session.user_id == user_id
                    && investigation.session.client_id.as_deref() == Some(client_id) =>
            {
                Ok(investigation)
            }
            Ok(_) => {
                let err = inconsistency();
                LifecycleStats::bump(&self.stats.index_self_heals);
                warn!(error = %err, "⚠️ 索引指向其他客户端的会话，重新创建");
                Err(StateError::NotFound(session_id.to_string()).into())
            }
            Err(e) if e.is_not_found() => {
                let err = inconsistency();
                LifecycleStats::bump(&self.stats.index_self_heals);
                info!(error = %err, "🩹 索引指向的会话已不存在，重新创建");
                Err(e)
            }
            Err(e) if e.is_recoverable_state() => {
                LifecycleStats::bump(&self.stats.corrupt_recoveries);
                warn!(session_id, error = %e, "⚠️ 会话状态损坏，删除后重新创建");
                self.repository.delete(session_id, deadline).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        user_id: &str,
        client_id: Option<&str>,
        deadline: Deadline,
    ) -> Result<ResumeOutcome> {
        let mut investigation =
            Investigation::new(Session::new(user_id, client_id, self.session_ttl));
        let session_id = investigation.session_id().to_string();

        self.repository
            .save(&mut investigation, self.session_ttl, deadline)
            .await?;
        if let Some(client_id) = client_id {
            self.index
                .bind(user_id, client_id, &session_id, self.index_ttl, deadline)
                .await?;
        }
        LifecycleStats::bump(&self.stats.created);
        info!(session_id = %session_id, user_id, client_id = ?client_id, "🆕 会话已创建");
        Ok(ResumeOutcome {
            session_id,
            resumed: false,
            investigation,
        })
    }

    /// 刷新会话 TTL，不读取也不改写调查状态
    ///
    /// 与同一会话的 `save` 并发时不会覆盖新写入的内容。
    /// `last_activity` 只随 `save` 推进，只有心跳的会话仍受最长空闲时长约束。
    pub async fn heartbeat(&self, session_id: &str, deadline: Deadline) -> Result<()> {
        self.repository
            .refresh_ttl(session_id, self.session_ttl, deadline)
            .await?;
        debug!(session_id, "💓 心跳");
        Ok(())
    }

    /// 删除状态并解绑索引；幂等，返回状态此前是否存在
    pub async fn close(&self, session_id: &str, deadline: Deadline) -> Result<bool> {
        let existed = self.repository.delete(session_id, deadline).await?;
        self.index.unbind(session_id, deadline).await?;
        if existed {
            LifecycleStats::bump(&self.stats.closed);
            info!(session_id, "👋 会话已关闭");
        }
        Ok(existed)
    }

    /// 读取会话，存储短暂不可用时退避重试一次
    pub async fn load(&self, session_id: &str, deadline: Deadline) -> Result<Investigation> {
        self.with_read_retry("load", deadline, move || {
            self.repository.load(session_id, deadline)
        })
        .await
    }

    /// 写回会话并刷新 TTL；写入从不自动重试
    pub async fn save(&self, investigation: &mut Investigation, deadline: Deadline) -> Result<()> {
        self.repository
            .save(investigation, self.session_ttl, deadline)
            .await
    }

    async fn with_read_retry<T, F, Fut>(&self, op: &str, deadline: Deadline, read: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match read().await {
            Err(e) if e.is_unavailable() && deadline.remaining() > self.read_retry_backoff => {
                LifecycleStats::bump(&self.stats.read_retries);
                warn!(
                    op,
                    error = %e,
                    backoff_ms = self.read_retry_backoff.as_millis() as u64,
                    "🔁 存储暂不可用，重试读取"
                );
                tokio::time::sleep(self.read_retry_backoff).await;
                read().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{MemoryCompressor, TurnRecord};
    use crate::investigation::{Phase, encode_record};
    use crate::store::{
        InMemoryStateStore, StateStore, StoreBackend, client_index_key, client_owner_key,
        state_key,
    };
    use crate::testing::{MockStoreBackend, StoreOp};
    use std::sync::Arc;

    fn config() -> StateConfig {
        StateConfig {
            read_retry_backoff_ms: 50,
            ..StateConfig::default()
        }
    }

    fn manager_on(backend: Arc<dyn StoreBackend>) -> SessionLifecycleManager {
        let store = Arc::new(StateStore::new(backend, Duration::from_secs(2)));
        SessionLifecycleManager::new(
            InvestigationStateRepository::new(store.clone()),
            ClientSessionIndex::new(store),
            &config(),
        )
    }

    fn manager() -> (Arc<InMemoryStateStore>, SessionLifecycleManager) {
        let backend = Arc::new(InMemoryStateStore::new());
        (backend.clone(), manager_on(backend))
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_resumption_is_idempotent() {
        let (_, manager) = manager();
        let first = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert!(!first.resumed);
        assert_eq!(first.investigation.state.phase(), Phase::Intake);

        let second = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert!(second.resumed);
        assert_eq!(second.session_id, first.session_id);

        let third = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert_eq!(third.session_id, first.session_id);

        let stats = manager.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.resumed, 2);
    }

    #[tokio::test]
    async fn test_no_resumption_without_client_id() {
        let (backend, manager) = manager();
        let a = manager.create_or_resume("alice", None, deadline()).await.unwrap();
        let b = manager.create_or_resume("alice", None, deadline()).await.unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert!(!a.resumed && !b.resumed);
        // 只有两条状态，没有索引
        assert_eq!(backend.len().await, 2);
    }

    #[tokio::test]
    async fn test_resume_carries_saved_progress() {
        let (_, manager) = manager();
        let mut outcome = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        let inv = &mut outcome.investigation;
        inv.state.transition_to(Phase::Timeline).unwrap();
        MemoryCompressor::from_config(&config()).record_turn(
            &mut inv.state,
            TurnRecord::new(Phase::Timeline, "started 10:42", "noted"),
        );
        manager.save(inv, deadline()).await.unwrap();

        let resumed = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.investigation.state.phase(), Phase::Timeline);
        assert_eq!(resumed.investigation.state.memory.turn_counter(), 1);
    }

    #[tokio::test]
    async fn test_index_self_heals_when_state_missing() {
        let (backend, manager) = manager();
        let first = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        backend.delete(&state_key(&first.session_id)).await.unwrap();

        let second = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert!(!second.resumed);
        assert_ne!(second.session_id, first.session_id);
        assert_eq!(
            backend.get(&client_index_key("alice", "laptop")).await.unwrap(),
            Some(second.session_id.as_bytes().to_vec())
        );
        assert_eq!(manager.stats().index_self_heals, 1);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_replaced() {
        let (backend, manager) = manager();
        let first = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        backend
            .set(
                &state_key(&first.session_id),
                b"{garbage".to_vec(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let second = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert!(!second.resumed);
        assert_eq!(backend.get(&state_key(&first.session_id)).await.unwrap(), None);
        assert_eq!(manager.stats().corrupt_recoveries, 1);
    }

    #[tokio::test]
    async fn test_index_pointing_at_foreign_session_is_not_resumed() {
        let (backend, manager) = manager();
        let bob = manager
            .create_or_resume("bob", Some("desktop"), deadline())
            .await
            .unwrap();
        backend
            .set(
                &client_index_key("alice", "laptop"),
                bob.session_id.as_bytes().to_vec(),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let alice = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert!(!alice.resumed);
        assert_ne!(alice.session_id, bob.session_id);
        // bob 的会话不受影响
        assert!(manager.load(&bob.session_id, deadline()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refreshes_ttl_without_changing_state() {
        let (backend, manager) = manager();
        let outcome = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        let key = state_key(&outcome.session_id);

        tokio::time::advance(Duration::from_secs(3000)).await;
        manager.heartbeat(&outcome.session_id, deadline()).await.unwrap();
        assert_eq!(
            backend.ttl(&key).await.unwrap(),
            Some(Duration::from_secs(3600))
        );

        tokio::time::advance(Duration::from_secs(3000)).await;
        let loaded = manager.load(&outcome.session_id, deadline()).await.unwrap();
        assert_eq!(loaded.state, outcome.investigation.state);
    }

    #[tokio::test]
    async fn test_heartbeat_never_rewrites_content() {
        let backend = Arc::new(MockStoreBackend::new());
        let manager = manager_on(backend.clone());
        let mut outcome = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        let key = state_key(&outcome.session_id);

        // 一个回合的写入落在心跳之前，心跳不得把它覆盖回旧内容
        outcome.investigation.state.transition_to(Phase::Timeline).unwrap();
        manager
            .save(&mut outcome.investigation, deadline())
            .await
            .unwrap();
        let saved = backend.inner().get(&key).await.unwrap();

        backend.reset_calls();
        manager.heartbeat(&outcome.session_id, deadline()).await.unwrap();
        assert_eq!(backend.calls(), vec![(StoreOp::Expire, key.clone())]);
        assert_eq!(backend.inner().get(&key).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_heartbeat_on_missing_session_is_not_found() {
        let (_, manager) = manager();
        let err = manager.heartbeat("nope", deadline()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unbinds() {
        let (backend, manager) = manager();
        let outcome = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();

        assert!(manager.close(&outcome.session_id, deadline()).await.unwrap());
        assert!(!manager.close(&outcome.session_id, deadline()).await.unwrap());
        assert!(backend.is_empty().await);
        assert_eq!(
            backend.get(&client_owner_key(&outcome.session_id)).await.unwrap(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_is_retried_once() {
        let backend = Arc::new(MockStoreBackend::new());
        let manager = manager_on(backend.clone());
        let outcome = manager.create_or_resume("alice", None, deadline()).await.unwrap();

        backend.fail_next(StoreOp::Get, "connection reset");
        assert!(manager.load(&outcome.session_id, deadline()).await.is_ok());
        assert_eq!(manager.stats().read_retries, 1);

        backend.fail_next(StoreOp::Get, "connection reset");
        backend.fail_next(StoreOp::Get, "connection reset");
        let err = manager.load(&outcome.session_id, deadline()).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_write_is_not_retried() {
        let backend = Arc::new(MockStoreBackend::new());
        let manager = manager_on(backend.clone());
        let mut outcome = manager.create_or_resume("alice", None, deadline()).await.unwrap();

        backend.reset_calls();
        backend.fail_next(StoreOp::Set, "connection reset");
        let err = manager
            .save(&mut outcome.investigation, deadline())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(backend.calls_for(StoreOp::Set), 1);
    }

    #[tokio::test]
    async fn test_outage_during_create_or_resume_surfaces() {
        let backend = Arc::new(MockStoreBackend::new());
        let manager = manager_on(backend.clone());
        backend.set_offline(true);

        let err = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("temporarily unavailable"));
        backend.set_offline(false);
        assert!(backend.inner().is_empty().await);
        assert_eq!(manager.stats().created, 0);
    }

    #[tokio::test]
    async fn test_unsupported_schema_recovers_as_new_session() {
        let (backend, manager) = manager();
        let first = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&encode_record(&first.investigation).unwrap()).unwrap();
        value["schema_version"] = serde_json::json!(99);
        backend
            .set(
                &state_key(&first.session_id),
                serde_json::to_vec(&value).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let second = manager
            .create_or_resume("alice", Some("laptop"), deadline())
            .await
            .unwrap();
        assert!(!second.resumed);
        assert_ne!(second.session_id, first.session_id);
    }

    #[tokio::test]
    async fn test_rejects_invalid_identifiers() {
        let (_, manager) = manager();
        assert!(manager.create_or_resume("", None, deadline()).await.is_err());
        assert!(
            manager
                .create_or_resume("alice", Some("a:b"), deadline())
                .await
                .is_err()
        );
    }
}
