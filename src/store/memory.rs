use crate::error::Result;
use crate::store::{ScanPage, StoreBackend};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 超出 `Instant` 表示范围的 TTL 按一百年处理
fn far_instant(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

/// 进程内存后端，不持久化，适合测试和单实例部署
///
/// 过期时间基于 `tokio::time::Instant`，测试中可用 `tokio::time::pause` 控制。
pub struct InMemoryStateStore {
    data: RwLock<BTreeMap<String, Entry>>,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// 当前条目数（含已过期未回收的）
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl StoreBackend for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: far_instant(ttl),
        };
        self.data.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn scan_expired_candidates(
        &self,
        prefix: &str,
        batch_size: usize,
    ) -> Result<Vec<String>> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .take(batch_size)
            .collect())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<ScanPage> {
        let now = Instant::now();
        let data = self.data.read().await;
        let start = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Included(prefix),
        };
        let mut keys = Vec::with_capacity(batch_size);
        let mut more = false;
        for (key, entry) in data
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            if entry.is_expired(now) {
                continue;
            }
            if keys.len() == batch_size {
                more = true;
                break;
            }
            keys.push(key.clone());
        }
        let next_cursor = if more { keys.last().cloned() } else { None };
        Ok(ScanPage { keys, next_cursor })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = far_instant(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let store = InMemoryStateStore::new();
        store
            .set("inv:state:a", b"payload".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            store.get("inv:state:a").await.unwrap(),
            Some(b"payload".to_vec())
        );

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(store.get("inv:state:a").await.unwrap(), None);
        assert_eq!(store.ttl("inv:state:a").await.unwrap(), None);
        // 过期条目保留到被扫描回收
        assert_eq!(
            store
                .scan_expired_candidates("inv:state:", 10)
                .await
                .unwrap(),
            vec!["inv:state:a".to_string()]
        );
        assert!(store.delete("inv:state:a").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires() {
        let store = InMemoryStateStore::new();
        store
            .set("inv:state:a", b"v".to_vec(), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(store.get("inv:state:a").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.ttl("inv:state:a").await.unwrap().unwrap() > Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_only_touches_live_keys() {
        let store = InMemoryStateStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(store.expire("k", Duration::from_secs(2)).await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.expire("k", Duration::from_secs(2)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(2)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_refreshes_ttl() {
        let store = InMemoryStateStore::new();
        store
            .set("k", b"v1".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        store
            .set("k", b"v2".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_expired_respects_prefix_and_batch() {
        let store = InMemoryStateStore::new();
        for i in 0..5 {
            store
                .set(&format!("inv:state:{i}"), vec![], Duration::from_secs(1))
                .await
                .unwrap();
        }
        store
            .set("client:session:u:c", vec![], Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set("inv:state:live", vec![], Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let batch = store
            .scan_expired_candidates("inv:state:", 3)
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|k| k.starts_with("inv:state:")));
        assert!(!batch.contains(&"inv:state:live".to_string()));
    }

    #[tokio::test]
    async fn test_scan_prefix_pages_in_key_order() {
        let store = InMemoryStateStore::new();
        for key in ["client:session:a", "client:session:b", "client:session:c"] {
            store
                .set(key, vec![], Duration::from_secs(60))
                .await
                .unwrap();
        }
        store
            .set("inv:state:z", vec![], Duration::from_secs(60))
            .await
            .unwrap();

        let first = store.scan_prefix("client:session:", None, 2).await.unwrap();
        assert_eq!(first.keys, vec!["client:session:a", "client:session:b"]);
        let cursor = first.next_cursor.unwrap();

        let second = store
            .scan_prefix("client:session:", Some(&cursor), 2)
            .await
            .unwrap();
        assert_eq!(second.keys, vec!["client:session:c"]);
        assert!(second.next_cursor.is_none());
    }
}
