//! 调查状态持久化
//!
//! 按 `session_id` 将 [`Investigation`] 序列化到 `inv:state:{session_id}`。
//! 每次 `save` 都会刷新 TTL；[`refresh_ttl`](InvestigationStateRepository::refresh_ttl)
//! 只刷新 TTL，不改写内容。
//!
//! 仓储本身不对同一会话的并发写入排序，"一个会话同一时刻只有一个回合"
//! 由调用层保证。

use crate::error::{Result, StateError};
use crate::investigation::{Investigation, decode_record, encode_record};
use crate::store::{Deadline, StateStore, state_key, validate_identifier};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct InvestigationStateRepository {
    store: Arc<StateStore>,
}

impl InvestigationStateRepository {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// 读取并解码
    ///
    /// - 不存在或已过期：`StateError::NotFound`
    /// - 负载损坏：`StateError::Serialization`，不会返回部分填充的对象
    /// - 版本未知：`StateError::UnsupportedSchema`
    pub async fn load(&self, session_id: &str, deadline: Deadline) -> Result<Investigation> {
        validate_identifier("session_id", session_id)?;
        let Some(bytes) = self.store.get(&state_key(session_id), deadline).await? else {
            debug!(session_id, "🔍 会话状态不存在");
            return Err(StateError::NotFound(session_id.to_string()).into());
        };
        let investigation = decode_record(&bytes)?;
        if investigation.session_id() != session_id {
            return Err(StateError::Serialization(format!(
                "record under {} belongs to session {}",
                session_id,
                investigation.session_id()
            ))
            .into());
        }
        Ok(investigation)
    }

    /// 记录一次活动、序列化并以 `ttl` 写入
    pub async fn save(
        &self,
        investigation: &mut Investigation,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        validate_identifier("session_id", investigation.session_id())?;
        investigation.session.touch(ttl);
        let bytes = encode_record(investigation)?;
        let size = bytes.len();
        self.store
            .set(&state_key(investigation.session_id()), bytes, ttl, deadline)
            .await?;
        debug!(
            session_id = %investigation.session_id(),
            bytes = size,
            ttl_secs = ttl.as_secs(),
            phase = %investigation.state.phase(),
            "💾 会话状态已保存"
        );
        Ok(())
    }

    /// 只刷新 TTL，不读取也不改写状态；会话不存在时返回 `StateError::NotFound`
    pub async fn refresh_ttl(
        &self,
        session_id: &str,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        validate_identifier("session_id", session_id)?;
        if !self.store.expire(&state_key(session_id), ttl, deadline).await? {
            debug!(session_id, "🔍 会话状态不存在");
            return Err(StateError::NotFound(session_id.to_string()).into());
        }
        Ok(())
    }

    /// 幂等删除，返回删除前是否存在
    pub async fn delete(&self, session_id: &str, deadline: Deadline) -> Result<bool> {
        validate_identifier("session_id", session_id)?;
        let existed = self.store.delete(&state_key(session_id), deadline).await?;
        debug!(session_id, existed, "🗑️ 会话状态已删除");
        Ok(existed)
    }

    /// 状态是否仍然存活（不解码）
    pub async fn exists(&self, session_id: &str, deadline: Deadline) -> Result<bool> {
        Ok(self.ttl(session_id, deadline).await?.is_some())
    }

    /// 剩余存活时间
    pub async fn ttl(&self, session_id: &str, deadline: Deadline) -> Result<Option<Duration>> {
        validate_identifier("session_id", session_id)?;
        self.store.ttl(&state_key(session_id), deadline).await
    }
}
