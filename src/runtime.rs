//! 组件装配
//!
//! 进程启动时由一份 [`StateConfig`] 构造所有组件，停机时显式拆除。
//! 不使用任何全局单例，测试可以在同一进程中并行创建多套实例。
//!
//! ```rust,no_run
//! use investigation_state::config::StateConfig;
//! use investigation_state::runtime::StateServices;
//! use investigation_state::store::{Deadline, InMemoryStateStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> investigation_state::error::Result<()> {
//! let services = StateServices::new(StateConfig::from_env()?, Arc::new(InMemoryStateStore::new()))?;
//! services.start_cleanup().await;
//!
//! let outcome = services
//!     .lifecycle()
//!     .create_or_resume("alice", Some("laptop"), Deadline::after(Duration::from_secs(5)))
//!     .await?;
//! println!("session {} resumed={}", outcome.session_id, outcome.resumed);
//!
//! services.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::compression::MemoryCompressor;
use crate::config::StateConfig;
use crate::error::Result;
use crate::session::{
    CleanupHandle, CleanupScheduler, CleanupStatus, ClientSessionIndex,
    InvestigationStateRepository, SessionLifecycleManager,
};
use crate::store::{StateStore, StoreBackend};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct StateServices {
    config: StateConfig,
    store: Arc<StateStore>,
    lifecycle: Arc<SessionLifecycleManager>,
    compressor: Arc<MemoryCompressor>,
    cleanup: Arc<CleanupScheduler>,
    shutdown: CancellationToken,
    cleanup_handle: Mutex<Option<CleanupHandle>>,
}

impl StateServices {
    /// 校验配置并构造所有组件
    pub fn new(config: StateConfig, backend: Arc<dyn StoreBackend>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(StateStore::new(backend, config.store_timeout()));
        let repository = InvestigationStateRepository::new(store.clone());
        let index = ClientSessionIndex::new(store.clone());

        let lifecycle = Arc::new(SessionLifecycleManager::new(
            repository.clone(),
            index.clone(),
            &config,
        ));
        let cleanup = Arc::new(CleanupScheduler::new(
            store.clone(),
            repository,
            index,
            &config,
        ));
        let compressor = Arc::new(MemoryCompressor::from_config(&config));

        info!(
            session_ttl_secs = config.session_ttl_seconds,
            index_ttl_hours = config.client_index_ttl_hours,
            store_timeout_ms = config.store_timeout_ms,
            memory_budget = config.memory.total(),
            "🚀 调查状态服务已初始化"
        );
        Ok(Self {
            config,
            store,
            lifecycle,
            compressor,
            cleanup,
            shutdown: CancellationToken::new(),
            cleanup_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<SessionLifecycleManager> {
        &self.lifecycle
    }

    pub fn compressor(&self) -> &Arc<MemoryCompressor> {
        &self.compressor
    }

    pub fn cleanup(&self) -> &Arc<CleanupScheduler> {
        &self.cleanup
    }

    pub async fn cleanup_status(&self) -> CleanupStatus {
        self.cleanup.status().await
    }

    /// 进程级停机信号，可传给其他后台任务
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 启动后台清理；已在运行时返回 false
    pub async fn start_cleanup(&self) -> bool {
        let mut handle = self.cleanup_handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        *handle = Some(self.cleanup.clone().spawn(self.shutdown.clone()));
        true
    }

    /// 停止后台任务并关闭存储
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            handle.shutdown().await;
        }
        self.shutdown.cancel();
        self.store.close().await?;
        info!("👋 调查状态服务已停止");
        Ok(())
    }
}
