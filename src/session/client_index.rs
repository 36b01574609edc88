//! 客户端会话索引
//!
//! `(user_id, client_id) → session_id`，TTL 独立于（通常长于）会话 TTL。
//! 每条索引都伴随一条反向记录 `client:owner:{session_id}`，
//! 使按会话解绑只需一次读取。
//!
//! 索引指向的会话不存在时视为过期索引，由调用方自愈，不是错误。

use crate::error::Result;
use crate::store::{
    CLIENT_INDEX_PREFIX, Deadline, StateStore, client_index_key, client_owner_key,
    validate_identifier,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ClientSessionIndex {
    store: Arc<StateStore>,
}

impl ClientSessionIndex {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(
        &self,
        user_id: &str,
        client_id: &str,
        deadline: Deadline,
    ) -> Result<Option<String>> {
        validate_identifier("user_id", user_id)?;
        validate_identifier("client_id", client_id)?;
        self.read_index(&client_index_key(user_id, client_id), deadline)
            .await
    }

    /// 绑定（或覆盖）索引，同时刷新两条记录的 TTL
    ///
    /// 并发绑定同一 `(user_id, client_id)` 时后写者胜出。
    pub async fn bind(
        &self,
        user_id: &str,
        client_id: &str,
        session_id: &str,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        validate_identifier("user_id", user_id)?;
        validate_identifier("client_id", client_id)?;
        validate_identifier("session_id", session_id)?;

        let index_key = client_index_key(user_id, client_id);
        self.store
            .set(&index_key, session_id.as_bytes().to_vec(), ttl, deadline)
            .await?;
        self.store
            .set(
                &client_owner_key(session_id),
                index_key.clone().into_bytes(),
                ttl,
                deadline,
            )
            .await?;
        debug!(index_key = %index_key, session_id, "🔗 客户端索引已绑定");
        Ok(())
    }

    /// 移除指向 `session_id` 的索引，返回是否删除了索引条目
    ///
    /// 索引已被其他会话重新绑定时只删除反向记录。
    pub async fn unbind(&self, session_id: &str, deadline: Deadline) -> Result<bool> {
        validate_identifier("session_id", session_id)?;
        let owner_key = client_owner_key(session_id);
        let Some(index_key) = self
            .store
            .get(&owner_key, deadline)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
        else {
            self.store.delete(&owner_key, deadline).await?;
            return Ok(false);
        };

        let removed = if !index_key.starts_with(CLIENT_INDEX_PREFIX) {
            warn!(owner_key = %owner_key, index_key = %index_key, "⚠️ 反向记录内容异常");
            false
        } else if self.read_index(&index_key, deadline).await?.as_deref() == Some(session_id) {
            self.store.delete(&index_key, deadline).await?
        } else {
            false
        };
        self.store.delete(&owner_key, deadline).await?;
        debug!(session_id, removed, "🔓 客户端索引已解绑");
        Ok(removed)
    }

    /// 读取索引 key 的值；内容不是合法会话 id 时视为不存在
    pub(crate) async fn read_index(
        &self,
        index_key: &str,
        deadline: Deadline,
    ) -> Result<Option<String>> {
        let Some(bytes) = self.store.get(index_key, deadline).await? else {
            return Ok(None);
        };
        match String::from_utf8(bytes) {
            Ok(session_id) if validate_identifier("session_id", &session_id).is_ok() => {
                Ok(Some(session_id))
            }
            _ => {
                warn!(index_key, "⚠️ 客户端索引内容无法解析，视为不存在");
                Ok(None)
            }
        }
    }

    /// 删除悬挂索引及 `session_id` 的反向记录（清理任务使用）
    ///
    /// `session_id` 是调用方先前读到的索引值。删除前重新读取，
    /// 索引已被重新绑定到其他会话时保留索引条目。
    pub(crate) async fn remove_entry(
        &self,
        index_key: &str,
        session_id: Option<&str>,
        deadline: Deadline,
    ) -> Result<bool> {
        let current = self.read_index(index_key, deadline).await?;
        let removed = if current.as_deref() == session_id {
            self.store.delete(index_key, deadline).await?
        } else {
            debug!(index_key, current = ?current, "↪️ 索引已被重新绑定，保留");
            false
        };
        if let Some(session_id) = session_id {
            self.store
                .delete(&client_owner_key(session_id), deadline)
                .await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStateStore, StoreBackend};

    fn index() -> (Arc<InMemoryStateStore>, ClientSessionIndex) {
        let backend = Arc::new(InMemoryStateStore::new());
        let store = Arc::new(StateStore::new(backend.clone(), Duration::from_secs(3)));
        (backend, ClientSessionIndex::new(store))
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[tokio::test]
    async fn test_bind_then_lookup() {
        let (backend, index) = index();
        assert_eq!(index.lookup("u1", "c1", deadline()).await.unwrap(), None);

        index.bind("u1", "c1", "s1", DAY, deadline()).await.unwrap();
        assert_eq!(
            index.lookup("u1", "c1", deadline()).await.unwrap().as_deref(),
            Some("s1")
        );
        assert_eq!(
            backend.get("client:owner:s1").await.unwrap(),
            Some(b"client:session:u1:c1".to_vec())
        );
        assert_eq!(index.lookup("u1", "c2", deadline()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unbind_removes_entry_and_owner() {
        let (backend, index) = index();
        index.bind("u1", "c1", "s1", DAY, deadline()).await.unwrap();

        assert!(index.unbind("s1", deadline()).await.unwrap());
        assert_eq!(index.lookup("u1", "c1", deadline()).await.unwrap(), None);
        assert!(backend.is_empty().await);
        assert!(!index.unbind("s1", deadline()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbind_keeps_rebound_entry() {
        let (_, index) = index();
        index.bind("u1", "c1", "s1", DAY, deadline()).await.unwrap();
        index.bind("u1", "c1", "s2", DAY, deadline()).await.unwrap();

        assert!(!index.unbind("s1", deadline()).await.unwrap());
        assert_eq!(
            index.lookup("u1", "c1", deadline()).await.unwrap().as_deref(),
            Some("s2")
        );
    }

    #[tokio::test]
    async fn test_garbage_index_value_reads_as_absent() {
        let (backend, index) = index();
        backend
            .set("client:session:u1:c1", vec![0xff, 0xfe], DAY)
            .await
            .unwrap();
        assert_eq!(index.lookup("u1", "c1", deadline()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_entry_keeps_concurrent_rebind() {
        let (backend, index) = index();
        index.bind("u1", "c1", "s-dead", DAY, deadline()).await.unwrap();
        let seen = index
            .read_index("client:session:u1:c1", deadline())
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("s-dead"));

        index.bind("u1", "c1", "s-new", DAY, deadline()).await.unwrap();
        let removed = index
            .remove_entry("client:session:u1:c1", seen.as_deref(), deadline())
            .await
            .unwrap();
        assert!(!removed);
        assert_eq!(
            index.lookup("u1", "c1", deadline()).await.unwrap().as_deref(),
            Some("s-new")
        );
        assert_eq!(backend.get("client:owner:s-dead").await.unwrap(), None);
        assert!(backend.get("client:owner:s-new").await.unwrap().is_some());

        assert!(
            index
                .remove_entry("client:session:u1:c1", Some("s-new"), deadline())
                .await
                .unwrap()
        );
        assert_eq!(index.lookup("u1", "c1", deadline()).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_expires_independently() {
        let (_, index) = index();
        index
            .bind("u1", "c1", "s1", Duration::from_secs(30), deadline())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(index.lookup("u1", "c1", deadline()).await.unwrap(), None);
    }
}
