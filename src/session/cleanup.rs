//! 后台清理任务
//!
//! 每次运行依次执行：
//!
//! 1. 回收 TTL 已过的会话状态，并解绑指向它们的索引（分批，批内并发）
//! 2. 超过最大空闲时长的会话（按游标每次一页），损坏的记录一并删除
//! 3. 修复指向不存在会话的悬挂索引（按游标每次一页）
//! 4. 回收已过期的索引和反向记录
//!
//! 单个条目失败只计数，不会中断本次运行；失败的 key 在本次运行内不再重试。取消信号在批次之间检查，
//! 并与正在执行的批次竞争，停机时当前批次会被放弃而不是等待完成。

use crate::config::StateConfig;
use crate::error::Result;
use crate::investigation::now_secs;
use crate::session::client_index::ClientSessionIndex;
use crate::session::repository::InvestigationStateRepository;
use crate::store::{
    CLIENT_INDEX_PREFIX, CLIENT_OWNER_PREFIX, Deadline, STATE_KEY_PREFIX, StateStore, state_key,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 单次运行的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupRunReport {
    /// TTL 已过的会话
    pub expired_removed: u64,
    /// 超过最大空闲时长的会话
    pub stale_removed: u64,
    /// 无法解码的会话
    pub corrupt_removed: u64,
    pub dangling_index_repaired: u64,
    /// 过期的索引和反向记录
    pub index_entries_purged: u64,
    pub errors: u64,
    pub batches: u64,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CleanupRunReport {
    /// 本次删除的会话数
    pub fn removed_sessions(&self) -> u64 {
        self.expired_removed + self.stale_removed + self.corrupt_removed
    }
}

/// 可观测状态，计数跨运行累计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStatus {
    /// 最近一次运行结束时间（Unix 秒）
    pub last_run_at: Option<u64>,
    pub removed_count: u64,
    pub error_count: u64,
    pub runs: u64,
    pub last_report: Option<CleanupRunReport>,
}

enum SweepOutcome {
    Kept,
    Stale,
    Corrupt,
}

pub struct CleanupScheduler {
    store: Arc<StateStore>,
    repository: InvestigationStateRepository,
    index: ClientSessionIndex,
    interval: Duration,
    batch_size: usize,
    max_batches: usize,
    max_age: Option<Duration>,
    batch_timeout: Duration,
    shutdown_grace: Duration,
    status: RwLock<CleanupStatus>,
    stale_cursor: Mutex<Option<String>>,
    index_cursor: Mutex<Option<String>>,
    running: Mutex<()>,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<StateStore>,
        repository: InvestigationStateRepository,
        index: ClientSessionIndex,
        config: &StateConfig,
    ) -> Self {
        Self {
            // 每个条目最多 5 次串行存储调用
            batch_timeout: store.op_timeout().saturating_mul(5),
            store,
            repository,
            index,
            interval: config.cleanup_interval(),
            batch_size: config.cleanup_batch_size,
            max_batches: config.cleanup_max_batches_per_run,
            max_age: config.session_max_age(),
            shutdown_grace: config.shutdown_grace(),
            status: RwLock::new(CleanupStatus::default()),
            stale_cursor: Mutex::new(None),
            index_cursor: Mutex::new(None),
            running: Mutex::new(()),
        }
    }

    pub async fn status(&self) -> CleanupStatus {
        self.status.read().await.clone()
    }

    /// 执行一次完整清理；已有运行在进行时直接返回空报告
    pub async fn run_once(&self, cancel: &CancellationToken) -> CleanupRunReport {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("⏭️ 上一次清理仍在运行，跳过");
            return CleanupRunReport::default();
        };

        let started = Instant::now();
        let mut report = CleanupRunReport::default();

        self.sweep_expired_states(cancel, &mut report).await;
        if !report.cancelled {
            self.sweep_stale_sessions(cancel, &mut report).await;
        }
        if !report.cancelled {
            self.repair_dangling_index(cancel, &mut report).await;
        }
        for prefix in [CLIENT_INDEX_PREFIX, CLIENT_OWNER_PREFIX] {
            if report.cancelled {
                break;
            }
            self.purge_expired(prefix, cancel, &mut report).await;
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        {
            let mut status = self.status.write().await;
            status.last_run_at = Some(now_secs());
            status.removed_count += report.removed_sessions();
            status.error_count += report.errors;
            status.runs += 1;
            status.last_report = Some(report.clone());
        }

        info!(
            removed = report.removed_sessions(),
            expired = report.expired_removed,
            stale = report.stale_removed,
            corrupt = report.corrupt_removed,
            dangling = report.dangling_index_repaired,
            purged = report.index_entries_purged,
            errors = report.errors,
            batches = report.batches,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "🧹 清理完成"
        );
        report
    }

    // ── 1. TTL 已过的会话 ──

    async fn sweep_expired_states(&self, cancel: &CancellationToken, report: &mut CleanupRunReport) {
        let mut failed = HashSet::new();
        for _ in 0..self.max_batches {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return;
            }
            let deadline = Deadline::after(self.batch_timeout);
            let (keys, exhausted) = match self
                .next_expired_batch(STATE_KEY_PREFIX, &failed, deadline)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "⚠️ 扫描过期会话失败");
                    report.errors += 1;
                    return;
                }
            };
            if keys.is_empty() {
                return;
            }
            report.batches += 1;

            let batch = join_all(keys.iter().map(|key| self.remove_expired(key, deadline)));
            let results = tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    return;
                }
                results = batch => results,
            };
            for (key, result) in keys.iter().zip(results) {
                match result {
                    Ok(true) => report.expired_removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %key, error = %e, "⚠️ 删除过期会话失败");
                        report.errors += 1;
                        failed.insert(key.clone());
                    }
                }
            }
            if exhausted {
                return;
            }
        }
    }

    /// 取下一批过期 key，跳过本次运行中已失败的 key
    ///
    /// 第二个返回值表示扫描已到达末尾。
    async fn next_expired_batch(
        &self,
        prefix: &str,
        failed: &HashSet<String>,
        deadline: Deadline,
    ) -> Result<(Vec<String>, bool)> {
        let wanted = self.batch_size.saturating_add(failed.len());
        let scanned = self
            .store
            .scan_expired_candidates(prefix, wanted, deadline)
            .await?;
        let exhausted = scanned.len() < wanted;
        let keys = scanned
            .into_iter()
            .filter(|key| !failed.contains(key))
            .take(self.batch_size)
            .collect();
        Ok((keys, exhausted))
    }

    async fn remove_expired(&self, key: &str, deadline: Deadline) -> Result<bool> {
        let Some(session_id) = key.strip_prefix(STATE_KEY_PREFIX) else {
            return Ok(false);
        };
        let removed = self.store.delete(key, deadline).await?;
        self.index.unbind(session_id, deadline).await?;
        debug!(session_id, "🗑️ 回收过期会话");
        Ok(removed)
    }

    // ── 2. 超过最大空闲时长的会话 ──

    async fn sweep_stale_sessions(&self, cancel: &CancellationToken, report: &mut CleanupRunReport) {
        let Some(max_age) = self.max_age else {
            return;
        };
        let mut cursor = self.stale_cursor.lock().await;
        let deadline = Deadline::after(self.batch_timeout);
        let page = match self
            .store
            .scan_prefix(STATE_KEY_PREFIX, cursor.as_deref(), self.batch_size, deadline)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "⚠️ 扫描会话失败");
                report.errors += 1;
                return;
            }
        };
        if page.keys.is_empty() {
            *cursor = None;
            return;
        }
        report.batches += 1;

        let now = now_secs();
        let batch = join_all(
            page.keys
                .iter()
                .map(|key| self.sweep_stale(key, now, max_age, deadline)),
        );
        let results = tokio::select! {
            _ = cancel.cancelled() => {
                report.cancelled = true;
                return;
            }
            results = batch => results,
        };
        for (key, result) in page.keys.iter().zip(results) {
            match result {
                Ok(SweepOutcome::Kept) => {}
                Ok(SweepOutcome::Stale) => report.stale_removed += 1,
                Ok(SweepOutcome::Corrupt) => report.corrupt_removed += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "⚠️ 检查会话失败");
                    report.errors += 1;
                }
            }
        }
        *cursor = page.next_cursor;
    }

    async fn sweep_stale(
        &self,
        key: &str,
        now: u64,
        max_age: Duration,
        deadline: Deadline,
    ) -> Result<SweepOutcome> {
        let Some(session_id) = key.strip_prefix(STATE_KEY_PREFIX) else {
            return Ok(SweepOutcome::Kept);
        };
        let outcome = match self.repository.load(session_id, deadline).await {
            Ok(inv) if inv.session.is_stale(now, max_age) => SweepOutcome::Stale,
            Ok(_) => return Ok(SweepOutcome::Kept),
            Err(e) if e.is_not_found() => return Ok(SweepOutcome::Kept),
            Err(e) if e.is_recoverable_state() => {
                warn!(session_id, error = %e, "⚠️ 删除无法解码的会话");
                SweepOutcome::Corrupt
            }
            Err(e) => return Err(e),
        };
        self.store.delete(key, deadline).await?;
        self.index.unbind(session_id, deadline).await?;
        Ok(outcome)
    }

    // ── 3. 悬挂索引 ──

    async fn repair_dangling_index(
        &self,
        cancel: &CancellationToken,
        report: &mut CleanupRunReport,
    ) {
        let mut cursor = self.index_cursor.lock().await;
        let deadline = Deadline::after(self.batch_timeout);
        let page = match self
            .store
            .scan_prefix(CLIENT_INDEX_PREFIX, cursor.as_deref(), self.batch_size, deadline)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "⚠️ 扫描客户端索引失败");
                report.errors += 1;
                return;
            }
        };
        if page.keys.is_empty() {
            *cursor = None;
            return;
        }
        report.batches += 1;

        let batch = join_all(page.keys.iter().map(|key| self.repair_entry(key, deadline)));
        let results = tokio::select! {
            _ = cancel.cancelled() => {
                report.cancelled = true;
                return;
            }
            results = batch => results,
        };
        for (key, result) in page.keys.iter().zip(results) {
            match result {
                Ok(true) => report.dangling_index_repaired += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "⚠️ 修复索引失败");
                    report.errors += 1;
                }
            }
        }
        *cursor = page.next_cursor;
    }

    async fn repair_entry(&self, index_key: &str, deadline: Deadline) -> Result<bool> {
        let session_id = self.index.read_index(index_key, deadline).await?;
        if let Some(session_id) = &session_id
            && self.store.ttl(&state_key(session_id), deadline).await?.is_some()
        {
            return Ok(false);
        }
        let removed = self
            .index
            .remove_entry(index_key, session_id.as_deref(), deadline)
            .await?;
        if removed {
            debug!(index_key, session_id = ?session_id, "🩹 移除悬挂索引");
        }
        Ok(removed)
    }

    // ── 4. 过期索引 ──

    async fn purge_expired(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
        report: &mut CleanupRunReport,
    ) {
        let mut failed = HashSet::new();
        for _ in 0..self.max_batches {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return;
            }
            let deadline = Deadline::after(self.batch_timeout);
            let (keys, exhausted) = match self.next_expired_batch(prefix, &failed, deadline).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(prefix, error = %e, "⚠️ 扫描过期索引失败");
                    report.errors += 1;
                    return;
                }
            };
            if keys.is_empty() {
                return;
            }
            report.batches += 1;

            let batch = join_all(keys.iter().map(|key| self.store.delete(key, deadline)));
            let results = tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    return;
                }
                results = batch => results,
            };
            for (key, result) in keys.iter().zip(results) {
                match result {
                    Ok(true) => report.index_entries_purged += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %key, error = %e, "⚠️ 删除过期索引失败");
                        report.errors += 1;
                        failed.insert(key.clone());
                    }
                }
            }
            if exhausted {
                return;
            }
        }
    }

    // ── 后台运行 ──

    /// 启动周期任务；`cancel` 被取消或调用 [`CleanupHandle::shutdown`] 时停止
    ///
    /// 第一次运行在启动后立即执行。
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> CleanupHandle {
        let token = cancel.child_token();
        let task_token = token.clone();
        let grace = self.shutdown_grace;
        let interval = self.interval;

        info!(
            interval_secs = interval.as_secs(),
            batch_size = self.batch_size,
            "⏰ 清理任务已启动"
        );
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once(&task_token).await;
                    }
                }
            }
            info!("🛑 清理任务已停止");
        });

        CleanupHandle {
            cancel: token,
            task,
            grace,
        }
    }
}

/// 后台清理任务句柄
pub struct CleanupHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    grace: Duration,
}

impl CleanupHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 发出取消信号，在宽限期内等待任务退出，超时则强制中止
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        match tokio::time::timeout(self.grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "⚠️ 清理任务异常退出"),
            Err(_) => {
                warn!(grace_ms = self.grace.as_millis() as u64, "⚠️ 清理任务未在宽限期内退出，强制中止");
                self.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::investigation::{Investigation, Session, encode_record};
    use crate::store::{InMemoryStateStore, StoreBackend, client_index_key, client_owner_key};
    use crate::testing::{MockStoreBackend, StoreOp};

    const DAY: Duration = Duration::from_secs(24 * 3600);

    struct Fixture {
        backend: Arc<dyn StoreBackend>,
        repository: InvestigationStateRepository,
        index: ClientSessionIndex,
        scheduler: Arc<CleanupScheduler>,
    }

    fn fixture_on(backend: Arc<dyn StoreBackend>, config: StateConfig) -> Fixture {
        let store = Arc::new(StateStore::new(backend.clone(), Duration::from_secs(2)));
        let repository = InvestigationStateRepository::new(store.clone());
        let index = ClientSessionIndex::new(store.clone());
        let scheduler = Arc::new(CleanupScheduler::new(
            store,
            repository.clone(),
            index.clone(),
            &config,
        ));
        Fixture {
            backend,
            repository,
            index,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        fixture_on(Arc::new(InMemoryStateStore::new()), StateConfig::default())
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    async fn seed(f: &Fixture, client_id: &str, ttl: Duration) -> String {
        let mut inv = Investigation::new(Session::new("alice", Some(client_id), ttl));
        f.repository.save(&mut inv, ttl, deadline()).await.unwrap();
        f.index
            .bind("alice", client_id, inv.session_id(), DAY, deadline())
            .await
            .unwrap();
        inv.session_id().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_removes_exactly_the_expired_sessions() {
        let f = fixture();
        let mut expired = Vec::new();
        let mut live = Vec::new();
        for i in 0..5 {
            let client = format!("c{i}");
            let ttl = if i < 2 {
                Duration::from_secs(60)
            } else {
                Duration::from_secs(3600)
            };
            let sid = seed(&f, &client, ttl).await;
            if i < 2 {
                expired.push((client, sid));
            } else {
                live.push((client, sid));
            }
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let report = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.expired_removed, 2);
        assert_eq!(report.removed_sessions(), 2);
        assert_eq!(report.errors, 0);

        for (client, sid) in &expired {
            assert_eq!(f.backend.get(&state_key(sid)).await.unwrap(), None);
            assert_eq!(f.backend.ttl(&state_key(sid)).await.unwrap(), None);
            assert_eq!(
                f.backend.get(&client_index_key("alice", client)).await.unwrap(),
                None
            );
            assert_eq!(f.backend.get(&client_owner_key(sid)).await.unwrap(), None);
        }
        for (client, sid) in &live {
            assert!(f.repository.load(sid, deadline()).await.is_ok());
            assert_eq!(
                f.index.lookup("alice", client, deadline()).await.unwrap().as_deref(),
                Some(sid.as_str())
            );
        }

        // 再次运行没有可回收的内容
        let again = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(again.removed_sessions(), 0);

        let status = f.scheduler.status().await;
        assert_eq!(status.runs, 2);
        assert_eq!(status.removed_count, 2);
        assert_eq!(status.error_count, 0);
        assert!(status.last_run_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_bounded() {
        let config = StateConfig {
            cleanup_batch_size: 2,
            cleanup_max_batches_per_run: 2,
            ..StateConfig::default()
        };
        let f = fixture_on(Arc::new(InMemoryStateStore::new()), config);
        for i in 0..7 {
            seed(&f, &format!("c{i}"), Duration::from_secs(10)).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let first = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(first.expired_removed, 4);
        let second = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(second.expired_removed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_failure_is_counted_not_raised() {
        let backend = Arc::new(MockStoreBackend::new());
        let f = fixture_on(backend.clone(), StateConfig::default());
        for i in 0..3 {
            seed(&f, &format!("c{i}"), Duration::from_secs(10)).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        backend.fail_next(StoreOp::Delete, "connection reset");
        let report = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.expired_removed, 2);

        let retry = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(retry.expired_removed, 1);
        assert_eq!(f.scheduler.status().await.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_keys_do_not_block_later_batches() {
        let backend = Arc::new(MockStoreBackend::new());
        let config = StateConfig {
            cleanup_batch_size: 2,
            cleanup_max_batches_per_run: 3,
            session_max_age_hours: 0,
            ..StateConfig::default()
        };
        let f = fixture_on(backend.clone(), config);
        for i in 0..4 {
            backend
                .inner()
                .set(&state_key(&format!("s{i}")), b"{}".to_vec(), Duration::from_secs(10))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        // 按 key 排序最靠前的两条持续失败
        backend.fail_key(StoreOp::Delete, state_key("s0"), "locked");
        backend.fail_key(StoreOp::Delete, state_key("s1"), "locked");

        let report = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.expired_removed, 2);
        assert_eq!(report.errors, 2);
        assert_eq!(f.backend.get(&state_key("s2")).await.unwrap(), None);
        assert_eq!(
            f.backend
                .scan_expired_candidates(STATE_KEY_PREFIX, 10)
                .await
                .unwrap(),
            vec![state_key("s0"), state_key("s1")]
        );

        let deletes_of = |key: String| {
            backend
                .calls()
                .into_iter()
                .filter(|(op, k)| *op == StoreOp::Delete && *k == key)
                .count()
        };
        assert_eq!(deletes_of(state_key("s0")), 1);
        assert_eq!(deletes_of(state_key("s1")), 1);

        backend.clear_key_failures();
        let retry = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(retry.expired_removed, 2);
        assert_eq!(retry.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_does_not_abort_other_passes() {
        let backend = Arc::new(MockStoreBackend::new());
        let f = fixture_on(backend.clone(), StateConfig::default());
        backend
            .inner()
            .set(
                &client_index_key("alice", "ghost"),
                b"missing-session".to_vec(),
                DAY,
            )
            .await
            .unwrap();

        backend.fail_next(StoreOp::ScanExpired, "connection reset");
        let report = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.dangling_index_repaired, 1);
    }

    #[tokio::test]
    async fn test_stale_and_corrupt_sessions_are_swept() {
        let f = fixture();
        let fresh = seed(&f, "fresh", Duration::from_secs(3600)).await;

        let mut stale = Investigation::new(Session::new(
            "alice",
            Some("stale"),
            Duration::from_secs(3600),
        ));
        stale.session.last_activity = now_secs() - 3 * 24 * 3600;
        f.backend
            .set(
                &state_key(stale.session_id()),
                encode_record(&stale).unwrap(),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        f.index
            .bind("alice", "stale", stale.session_id(), DAY, deadline())
            .await
            .unwrap();
        f.backend
            .set(&state_key("corrupt"), b"{oops".to_vec(), Duration::from_secs(3600))
            .await
            .unwrap();

        let report = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.stale_removed, 1);
        assert_eq!(report.corrupt_removed, 1);
        assert_eq!(report.removed_sessions(), 2);
        assert!(f.repository.load(&fresh, deadline()).await.is_ok());
        assert_eq!(f.index.lookup("alice", "stale", deadline()).await.unwrap(), None);
        assert_eq!(f.backend.get(&state_key("corrupt")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dangling_index_is_repaired() {
        let f = fixture();
        let sid = seed(&f, "laptop", Duration::from_secs(3600)).await;
        f.backend.delete(&state_key(&sid)).await.unwrap();

        let report = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.dangling_index_repaired, 1);
        assert_eq!(report.removed_sessions(), 0);
        assert_eq!(
            f.backend.get(&client_index_key("alice", "laptop")).await.unwrap(),
            None
        );
        assert_eq!(f.backend.get(&client_owner_key(&sid)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_index_entries_are_purged() {
        let f = fixture();
        f.index
            .bind("alice", "laptop", "s1", Duration::from_secs(30), deadline())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let report = f.scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.index_entries_purged, 2);
        assert_eq!(
            f.backend.scan_expired_candidates("", 10).await.unwrap(),
            Vec::<String>::new()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_stops_before_first_batch() {
        let f = fixture();
        seed(&f, "laptop", Duration::from_secs(10)).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = f.scheduler.run_once(&cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.removed_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_runs_on_interval_and_shuts_down() {
        let config = StateConfig {
            cleanup_interval_minutes: 1,
            ..StateConfig::default()
        };
        let f = fixture_on(Arc::new(InMemoryStateStore::new()), config);
        let handle = f.scheduler.clone().spawn(CancellationToken::new());

        // 第一次立即运行，之后每分钟一次
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.scheduler.status().await.runs, 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.scheduler.status().await.runs, 2);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.scheduler.status().await.runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_slow_batch_within_grace() {
        let backend = Arc::new(MockStoreBackend::new());
        let config = StateConfig {
            shutdown_grace_ms: 1_000,
            ..StateConfig::default()
        };
        let f = fixture_on(backend.clone(), config);
        for i in 0..3 {
            seed(&f, &format!("c{i}"), Duration::from_secs(10)).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        backend.set_latency(Some(Duration::from_millis(1_500)));

        let handle = f.scheduler.clone().spawn(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(1_600)).await;

        let started = tokio::time::Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() <= Duration::from_secs(1));
        let status = f.scheduler.status().await;
        assert!(status.last_report.is_some_and(|r| r.cancelled));
        assert_eq!(status.removed_count, 0);
    }
}
