//! 状态管理配置
//!
//! 两种来源：
//!
//! - 环境变量（[`StateConfig::from_env`]，启动时先读取 `.env`）
//! - YAML 文件（[`StateConfig::load`]）
//!
//! ```text
//! SESSION_TTL_SECONDS=3600
//! CLIENT_INDEX_TTL_HOURS=24
//! CLEANUP_INTERVAL_MINUTES=15
//! CLEANUP_BATCH_SIZE=50
//! MEMORY_BUDGET_HOT=500
//! MEMORY_BUDGET_WARM=300
//! MEMORY_BUDGET_COLD=100
//! MEMORY_BUDGET_PERSISTENT=100
//! ```
//!
//! 未设置的项使用默认值。

use crate::compression::{MEMORY_ENVELOPE_TOKENS, TierBudgets};
use crate::error::{ConfigError, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// 所有时长类配置的上限（十年）
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// 会话状态 TTL（秒）
    pub session_ttl_seconds: u64,
    /// 客户端索引 TTL（小时），独立于会话 TTL
    pub client_index_ttl_hours: u64,
    /// 清理任务的执行间隔（分钟）
    pub cleanup_interval_minutes: u64,
    /// 单批处理的 key 数
    pub cleanup_batch_size: usize,
    /// 单次清理最多处理的批数
    pub cleanup_max_batches_per_run: usize,
    /// 最长未刷新时间（小时），超过即视为过期；0 = 不启用
    pub session_max_age_hours: u64,
    /// 单次存储操作超时（毫秒）
    pub store_timeout_ms: u64,
    /// 读失败后重试前的等待（毫秒）
    pub read_retry_backoff_ms: u64,
    /// 停机时等待清理任务收尾的时间（毫秒）
    pub shutdown_grace_ms: u64,
    /// 各记忆层的 token 预算
    pub memory: TierBudgets,
    /// cold 层条目的存活轮数
    pub cold_horizon_turns: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: 3600,
            client_index_ttl_hours: 24,
            cleanup_interval_minutes: 15,
            cleanup_batch_size: 50,
            cleanup_max_batches_per_run: 20,
            session_max_age_hours: 24,
            store_timeout_ms: 3000,
            read_retry_backoff_ms: 100,
            shutdown_grace_ms: 5000,
            memory: TierBudgets::default(),
            cold_horizon_turns: 20,
        }
    }
}

impl StateConfig {
    /// 从环境变量加载（会先读取 `.env`）
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 按给定查找函数加载，未给出的项保留默认值
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        read_var(&lookup, "SESSION_TTL_SECONDS", &mut config.session_ttl_seconds)?;
        read_var(
            &lookup,
            "CLIENT_INDEX_TTL_HOURS",
            &mut config.client_index_ttl_hours,
        )?;
        read_var(
            &lookup,
            "CLEANUP_INTERVAL_MINUTES",
            &mut config.cleanup_interval_minutes,
        )?;
        read_var(&lookup, "CLEANUP_BATCH_SIZE", &mut config.cleanup_batch_size)?;
        read_var(
            &lookup,
            "CLEANUP_MAX_BATCHES_PER_RUN",
            &mut config.cleanup_max_batches_per_run,
        )?;
        read_var(
            &lookup,
            "SESSION_MAX_AGE_HOURS",
            &mut config.session_max_age_hours,
        )?;
        read_var(&lookup, "STORE_TIMEOUT_MS", &mut config.store_timeout_ms)?;
        read_var(
            &lookup,
            "READ_RETRY_BACKOFF_MS",
            &mut config.read_retry_backoff_ms,
        )?;
        read_var(
            &lookup,
            "CLEANUP_SHUTDOWN_GRACE_MS",
            &mut config.shutdown_grace_ms,
        )?;
        read_var(&lookup, "MEMORY_BUDGET_HOT", &mut config.memory.hot)?;
        read_var(&lookup, "MEMORY_BUDGET_WARM", &mut config.memory.warm)?;
        read_var(&lookup, "MEMORY_BUDGET_COLD", &mut config.memory.cold)?;
        read_var(
            &lookup,
            "MEMORY_BUDGET_PERSISTENT",
            &mut config.memory.persistent,
        )?;
        read_var(
            &lookup,
            "MEMORY_COLD_HORIZON_TURNS",
            &mut config.cold_horizon_turns,
        )?;
        config.validate()?;
        Ok(config)
    }

    /// 从 YAML 文件加载
    pub fn load(path: &str) -> Result<Self> {
        let file =
            std::fs::File::open(path).map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: StateConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验：TTL、间隔、批大小、预算都必须大于 0，hot 预算须容纳记忆容器开销，
    /// 时长不得超过 [`MAX_CONFIG_DURATION`]
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("session_ttl_seconds", self.session_ttl_seconds),
            ("client_index_ttl_hours", self.client_index_ttl_hours),
            ("cleanup_interval_minutes", self.cleanup_interval_minutes),
            ("cleanup_batch_size", self.cleanup_batch_size as u64),
            (
                "cleanup_max_batches_per_run",
                self.cleanup_max_batches_per_run as u64,
            ),
            ("store_timeout_ms", self.store_timeout_ms),
            ("memory.hot", self.memory.hot as u64),
            ("memory.warm", self.memory.warm as u64),
            ("memory.cold", self.memory.cold as u64),
            ("memory.persistent", self.memory.persistent as u64),
            ("cold_horizon_turns", self.cold_horizon_turns),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be greater than 0".to_string(),
                }
                .into());
            }
        }
        if self.memory.hot <= MEMORY_ENVELOPE_TOKENS {
            return Err(ConfigError::InvalidValue {
                field: "memory.hot".to_string(),
                message: format!("must be greater than {MEMORY_ENVELOPE_TOKENS}"),
            }
            .into());
        }

        let max_ms = MAX_CONFIG_DURATION.as_millis() as u64;
        let durations_ms = [
            ("session_ttl_seconds", self.session_ttl_seconds.checked_mul(1_000)),
            (
                "client_index_ttl_hours",
                self.client_index_ttl_hours.checked_mul(3_600_000),
            ),
            (
                "cleanup_interval_minutes",
                self.cleanup_interval_minutes.checked_mul(60_000),
            ),
            (
                "session_max_age_hours",
                self.session_max_age_hours.checked_mul(3_600_000),
            ),
            ("store_timeout_ms", Some(self.store_timeout_ms)),
            ("read_retry_backoff_ms", Some(self.read_retry_backoff_ms)),
            ("shutdown_grace_ms", Some(self.shutdown_grace_ms)),
        ];
        for (field, millis) in durations_ms {
            if millis.is_none_or(|ms| ms > max_ms) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("must not exceed {}s", MAX_CONFIG_DURATION.as_secs()),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn client_index_ttl(&self) -> Duration {
        Duration::from_secs(self.client_index_ttl_hours.saturating_mul(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes.saturating_mul(60))
    }

    /// `None` 表示不启用最长存活检查
    pub fn session_max_age(&self) -> Option<Duration> {
        (self.session_max_age_hours > 0)
            .then(|| Duration::from_secs(self.session_max_age_hours.saturating_mul(3600)))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn read_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            field: key.to_string(),
            message: format!("'{}': {}", raw, e),
        })?;
    }
    Ok(())
}
