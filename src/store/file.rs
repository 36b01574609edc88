//! 基于 JSON 文件的持久化后端
//!
//! 写时立即落盘，读时从内存缓存返回。过期时间使用墙钟（Unix 毫秒），
//! 因此重启后 TTL 仍然有效。
//!
//! 存储格式：
//! ```json
//! {
//!   "inv:state:3f2c...": { "value": [123, 34, ...], "expires_at_ms": 1760000000000 }
//! }
//! ```

use crate::error::{Result, StoreError};
use crate::store::{ScanPage, StoreBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    value: Vec<u8>,
    expires_at_ms: u64,
}

impl FileEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

pub struct FileStateStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, FileEntry>>,
    /// 串行化落盘，避免并发写同一个临时文件
    flush_lock: Mutex<()>,
}

impl FileStateStore {
    /// 打开或创建存储文件，自动建父目录
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| unavailable("open", format!("创建目录失败: {e}")))?;
        }
        let data: BTreeMap<String, FileEntry> = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| unavailable("open", format!("读取存储文件失败: {e}")))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("存储文件解析失败，从空状态开始: {e}");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), keys = data.len(), "🗄️ FileStateStore 初始化");
        Ok(Self {
            path,
            data: RwLock::new(data),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let json = {
            let data = self.data.read().await;
            serde_json::to_string(&*data).map_err(|e| unavailable("flush", e.to_string()))?
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| unavailable("flush", format!("写入存储文件失败: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| unavailable("flush", format!("替换存储文件失败: {e}")))?;
        debug!(path = %self.path.display(), "💾 存储已持久化");
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = now_ms();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let entry = FileEntry {
            value,
            expires_at_ms: now_ms()
                .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
        };
        self.data.write().await.insert(key.to_string(), entry);
        self.flush().await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let found = self.data.write().await.remove(key).is_some();
        if found {
            self.flush().await?;
        }
        Ok(found)
    }

    async fn scan_expired_candidates(
        &self,
        prefix: &str,
        batch_size: usize,
    ) -> Result<Vec<String>> {
        let now = now_ms();
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
        let now = now_ms();
        let data = self.data.read().await;
        let start = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Included(prefix),
        };
        let mut live = data
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone());
        let keys: Vec<String> = live.by_ref().take(batch_size).collect();
        let next_cursor = if live.next().is_some() {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ScanPage { keys, next_cursor })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = now_ms();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| Duration::from_millis(e.expires_at_ms - now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let refreshed = match self.data.write().await.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at_ms =
                    now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
                true
            }
            _ => false,
        };
        if refreshed {
            self.flush().await?;
        }
        Ok(refreshed)
    }

    async fn close(&self) -> Result<()> {
        self.flush().await?;
        info!(path = %self.path.display(), "🔒 FileStateStore 已关闭");
        Ok(())
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

fn unavailable(op: &str, reason: String) -> StoreError {
    StoreError::Unavailable {
        op: op.to_string(),
        reason,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/")
        && let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
    {
        return PathBuf::from(home).join(&s[2..]);
    }
    path.to_path_buf()
}
