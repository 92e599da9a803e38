// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 上游服务状态缓存
//!
//! `provider:state` 哈希上的集中式、时间有界的上游健康缓存，由工作器在
//! 每次上游调用后回报，并由带锁的刷新器周期性校准。短时互斥锁只用于
//! 合并刷新风暴，从不跨上游调用持有。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::settings::ProviderStateSettings;
use crate::domain::error::BrokerError;
use crate::infrastructure::redis::client::RedisStore;
use crate::infrastructure::redis::keys;
use crate::provider::probe::ProviderProbe;

/// 上游服务状况
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderCondition {
    /// 正常
    #[default]
    Active,
    /// 密钥未配置
    ApiKeyMissing,
    /// 密钥无效
    ApiKeyInvalid,
    /// 额度耗尽
    CreditsExhausted,
    /// 被上游限流
    RateLimited,
    /// 上游不可用
    ServiceUnavailable,
    /// 其他错误
    Error,
}

impl fmt::Display for ProviderCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ProviderCondition::Active => "active",
            ProviderCondition::ApiKeyMissing => "api_key_missing",
            ProviderCondition::ApiKeyInvalid => "api_key_invalid",
            ProviderCondition::CreditsExhausted => "credits_exhausted",
            ProviderCondition::RateLimited => "rate_limited",
            ProviderCondition::ServiceUnavailable => "service_unavailable",
            ProviderCondition::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProviderCondition {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ProviderCondition::Active),
            "api_key_missing" => Ok(ProviderCondition::ApiKeyMissing),
            "api_key_invalid" => Ok(ProviderCondition::ApiKeyInvalid),
            "credits_exhausted" => Ok(ProviderCondition::CreditsExhausted),
            "rate_limited" => Ok(ProviderCondition::RateLimited),
            "service_unavailable" => Ok(ProviderCondition::ServiceUnavailable),
            "error" => Ok(ProviderCondition::Error),
            _ => Err(()),
        }
    }
}

/// 工作器回报的失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 鉴权失败
    ApiKeyInvalid,
    /// 额度耗尽
    CreditsExhausted,
    /// 上游限流
    RateLimited,
    /// 上游不可用
    ServiceUnavailable,
    /// 超时
    Timeout,
    /// 网络错误
    NetworkError,
    /// 未知
    Unknown,
}

impl FailureKind {
    /// 指标与日志使用的稳定标识
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ApiKeyInvalid => "api_key_invalid",
            FailureKind::CreditsExhausted => "credits_exhausted",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServiceUnavailable => "service_unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::NetworkError => "network_error",
            FailureKind::Unknown => "unknown",
        }
    }

    /// 失败类别对应的上游状况
    pub fn condition(&self) -> ProviderCondition {
        match self {
            FailureKind::ApiKeyInvalid => ProviderCondition::ApiKeyInvalid,
            FailureKind::CreditsExhausted => ProviderCondition::CreditsExhausted,
            FailureKind::RateLimited => ProviderCondition::RateLimited,
            FailureKind::ServiceUnavailable => ProviderCondition::ServiceUnavailable,
            FailureKind::Timeout | FailureKind::NetworkError | FailureKind::Unknown => {
                ProviderCondition::Error
            }
        }
    }

    /// 该类别是否计入连续失败（推动状态熔断）
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(
            self.condition(),
            ProviderCondition::Error
                | ProviderCondition::ServiceUnavailable
                | ProviderCondition::RateLimited
        )
    }
}

/// 上游状态记录
#[derive(Debug, Clone)]
pub struct ProviderState {
    /// 当前状况
    pub state: ProviderCondition,
    /// 状况描述
    pub message: String,
    /// 上次检查时间
    pub last_check: DateTime<Utc>,
    /// 上次成功时间
    pub last_success: Option<DateTime<Utc>>,
    /// 连续失败计数
    pub consecutive_failures: u32,
    /// 状态熔断是否打开
    pub circuit_open: bool,
    /// 状态熔断解锁时间
    pub circuit_open_until: Option<DateTime<Utc>>,
    /// 余额提示
    pub balance_hint: Option<f64>,
    /// 用量提示
    pub usage_hint: Option<f64>,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            state: ProviderCondition::Active,
            message: "no provider activity recorded".to_string(),
            last_check: Utc::now(),
            last_success: None,
            consecutive_failures: 0,
            circuit_open: false,
            circuit_open_until: None,
            balance_hint: None,
            usage_hint: None,
        }
    }
}

/// 缓存读取结果
#[derive(Debug, Clone)]
pub struct ProviderStateView {
    /// 状态记录
    pub state: ProviderState,
    /// 是否直接来自缓存（未触发刷新）
    pub from_cache: bool,
    /// 是否因状态熔断而拒绝刷新
    pub circuit_blocked: bool,
}

/// 缓存是否足够新鲜
pub fn is_fresh(last_check: DateTime<Utc>, now: DateTime<Utc>, fresh_secs: u64) -> bool {
    (now - last_check).num_seconds() < fresh_secs as i64
}

impl ProviderState {
    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("state".to_string(), self.state.to_string()),
            ("message".to_string(), self.message.clone()),
            ("last_check".to_string(), self.last_check.to_rfc3339()),
            (
                "consecutive_failures".to_string(),
                self.consecutive_failures.to_string(),
            ),
            ("circuit_open".to_string(), self.circuit_open.to_string()),
        ];
        if let Some(t) = self.last_success {
            fields.push(("last_success".to_string(), t.to_rfc3339()));
        }
        if let Some(t) = self.circuit_open_until {
            fields.push(("circuit_open_until".to_string(), t.to_rfc3339()));
        }
        if let Some(b) = self.balance_hint {
            fields.push(("balance".to_string(), b.to_string()));
        }
        if let Some(u) = self.usage_hint {
            fields.push(("usage".to_string(), u.to_string()));
        }
        fields
    }

    fn from_hash(fields: &HashMap<String, String>) -> Option<Self> {
        let last_check = fields
            .get("last_check")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))?;
        let parse_opt_ts = |field: &str| {
            fields
                .get(field)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };
        Some(Self {
            state: fields
                .get("state")
                .and_then(|v| v.parse().ok())
                .unwrap_or(ProviderCondition::Error),
            message: fields.get("message").cloned().unwrap_or_default(),
            last_check,
            last_success: parse_opt_ts("last_success"),
            consecutive_failures: fields
                .get("consecutive_failures")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            circuit_open: fields
                .get("circuit_open")
                .map(|v| v == "true")
                .unwrap_or(false),
            circuit_open_until: parse_opt_ts("circuit_open_until"),
            balance_hint: fields.get("balance").and_then(|v| v.parse().ok()),
            usage_hint: fields.get("usage").and_then(|v| v.parse().ok()),
        })
    }

    /// 状态熔断当前是否生效
    pub fn circuit_active(&self, now: DateTime<Utc>) -> bool {
        if !self.circuit_open {
            return false;
        }
        match self.circuit_open_until {
            Some(until) => now < until,
            None => true,
        }
    }
}

/// 上游服务状态缓存
pub struct ProviderStateCache {
    store: Arc<RedisStore>,
    probe: Arc<dyn ProviderProbe>,
    settings: ProviderStateSettings,
}

impl ProviderStateCache {
    /// 创建状态缓存
    pub fn new(
        store: Arc<RedisStore>,
        probe: Arc<dyn ProviderProbe>,
        settings: &ProviderStateSettings,
    ) -> Self {
        Self {
            store,
            probe,
            settings: settings.clone(),
        }
    }

    /// 读取上游状态
    ///
    /// 缓存新鲜时直接返回；状态熔断打开时返回缓存并打标记；
    /// 否则持短锁刷新，抢锁失败的并发读者直接用缓存。
    ///
    /// # 参数
    ///
    /// * `force_refresh` - 无视新鲜度强制刷新
    pub async fn get_state(&self, force_refresh: bool) -> Result<ProviderStateView, BrokerError> {
        let now = Utc::now();
        let cached = self.read().await?;

        if let Some(state) = &cached {
            if !force_refresh && is_fresh(state.last_check, now, self.settings.fresh) {
                return Ok(ProviderStateView {
                    state: state.clone(),
                    from_cache: true,
                    circuit_blocked: false,
                });
            }
            if state.circuit_active(now) {
                return Ok(ProviderStateView {
                    state: state.clone(),
                    from_cache: true,
                    circuit_blocked: true,
                });
            }
        }

        let token = Uuid::new_v4().to_string();
        let lock_ttl = Duration::from_secs(self.settings.lock_timeout);
        if !self
            .store
            .acquire_lock(keys::PROVIDER_STATE_LOCK, &token, lock_ttl)
            .await?
        {
            // 其他进程正在刷新，直接用现有缓存
            debug!("Provider state refresh already in flight");
            return Ok(ProviderStateView {
                state: cached.unwrap_or_default(),
                from_cache: true,
                circuit_blocked: false,
            });
        }

        let refreshed = self.refresh(cached.unwrap_or_default()).await;
        if let Err(e) = self
            .store
            .release_lock(keys::PROVIDER_STATE_LOCK, &token)
            .await
        {
            warn!("Failed to release provider state lock: {}", e);
        }
        let state = refreshed?;
        Ok(ProviderStateView {
            state,
            from_cache: false,
            circuit_blocked: false,
        })
    }

    /// 工作器回报一次上游成功
    pub async fn report_success(&self) -> Result<(), BrokerError> {
        self.with_lock(|mut state| {
            let now = Utc::now();
            state.state = ProviderCondition::Active;
            state.message = "provider call succeeded".to_string();
            state.last_check = now;
            state.last_success = Some(now);
            state.consecutive_failures = 0;
            state.circuit_open = false;
            state.circuit_open_until = None;
            state
        })
        .await?;
        self.bump_metrics(None).await;
        Ok(())
    }

    /// 工作器回报一次上游失败
    ///
    /// # 参数
    ///
    /// * `kind` - 失败类别
    /// * `message` - 错误消息
    /// * `status` - 上游HTTP状态码
    pub async fn report_failure(
        &self,
        kind: FailureKind,
        message: &str,
        status: Option<u16>,
    ) -> Result<(), BrokerError> {
        let threshold = self.settings.circuit_threshold;
        let unlock_after = chrono::Duration::seconds(self.settings.stale as i64);
        let message = match status {
            Some(code) => format!("worker reported {} (HTTP {}): {}", kind.as_str(), code, message),
            None => format!("worker reported {}: {}", kind.as_str(), message),
        };
        self.with_lock(move |mut state| {
            let now = Utc::now();
            state.state = kind.condition();
            state.message = message;
            state.last_check = now;
            if kind.counts_toward_circuit() {
                state.consecutive_failures += 1;
            }
            if state.consecutive_failures >= threshold && !state.circuit_open {
                state.circuit_open = true;
                state.circuit_open_until = Some(now + unlock_after);
                info!(
                    "Provider state circuit opened after {} consecutive failures",
                    state.consecutive_failures
                );
            }
            state
        })
        .await?;
        self.bump_metrics(Some(kind)).await;
        Ok(())
    }

    async fn read(&self) -> Result<Option<ProviderState>, BrokerError> {
        let fields = self.store.hash_get_all(keys::PROVIDER_STATE).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(ProviderState::from_hash(&fields))
    }

    async fn write(&self, state: &ProviderState) -> Result<(), BrokerError> {
        let ttl = Duration::from_secs(self.settings.stale * 2);
        self.store
            .hash_set_with_ttl(keys::PROVIDER_STATE, &state.to_fields(), ttl)
            .await?;
        Ok(())
    }

    /// 带锁读改写；抢锁失败时放弃本次更新
    async fn with_lock<F>(&self, update: F) -> Result<(), BrokerError>
    where
        F: FnOnce(ProviderState) -> ProviderState,
    {
        let token = Uuid::new_v4().to_string();
        let lock_ttl = Duration::from_secs(self.settings.lock_timeout);
        if !self
            .store
            .acquire_lock(keys::PROVIDER_STATE_LOCK, &token, lock_ttl)
            .await?
        {
            debug!("Provider state update skipped, lock busy");
            return Ok(());
        }
        let result = async {
            let current = self.read().await?.unwrap_or_default();
            let updated = update(current);
            self.write(&updated).await
        }
        .await;
        if let Err(e) = self
            .store
            .release_lock(keys::PROVIDER_STATE_LOCK, &token)
            .await
        {
            warn!("Failed to release provider state lock: {}", e);
        }
        result
    }

    async fn refresh(&self, previous: ProviderState) -> Result<ProviderState, BrokerError> {
        let now = Utc::now();
        let threshold = self.settings.circuit_threshold;
        let state = match self.probe.check().await {
            Ok(report) => ProviderState {
                state: ProviderCondition::Active,
                message: report.message,
                last_check: now,
                last_success: Some(now),
                consecutive_failures: 0,
                circuit_open: false,
                circuit_open_until: None,
                balance_hint: report.balance,
                usage_hint: report.usage,
            },
            Err(failure) => {
                let mut state = previous;
                state.state = failure.kind.condition();
                state.message = failure.message;
                state.last_check = now;
                if failure.kind.counts_toward_circuit() {
                    state.consecutive_failures += 1;
                }
                if state.consecutive_failures >= threshold && !state.circuit_open {
                    state.circuit_open = true;
                    state.circuit_open_until =
                        Some(now + chrono::Duration::seconds(self.settings.stale as i64));
                }
                state
            }
        };
        self.write(&state).await?;
        Ok(state)
    }

    /// 更新每日聚合指标（尽力而为）
    async fn bump_metrics(&self, failure: Option<FailureKind>) {
        let key = keys::provider_metrics(Utc::now());
        let mut pipe = redis::pipe();
        pipe.hincr(&key, "total_calls", 1).ignore();
        match failure {
            None => {
                pipe.hincr(&key, "successful_calls", 1).ignore();
            }
            Some(kind) => {
                pipe.hincr(&key, "failed_calls", 1).ignore();
                pipe.hincr(&key, format!("kind_{}", kind.as_str()), 1)
                    .ignore();
            }
        }
        // keep daily metrics for 30 days
        pipe.expire(&key, 30 * 24 * 3600).ignore();
        if let Err(e) = self.store.pipeline(pipe).await {
            warn!("Failed to update provider metrics: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_to_condition() {
        assert_eq!(
            FailureKind::ApiKeyInvalid.condition(),
            ProviderCondition::ApiKeyInvalid
        );
        assert_eq!(
            FailureKind::CreditsExhausted.condition(),
            ProviderCondition::CreditsExhausted
        );
        assert_eq!(FailureKind::Timeout.condition(), ProviderCondition::Error);
        assert_eq!(
            FailureKind::NetworkError.condition(),
            ProviderCondition::Error
        );
    }

    #[test]
    fn test_circuit_counting_kinds() {
        assert!(FailureKind::ServiceUnavailable.counts_toward_circuit());
        assert!(FailureKind::RateLimited.counts_toward_circuit());
        assert!(FailureKind::Timeout.counts_toward_circuit());
        // 密钥与额度问题是确定性状态，不推动熔断
        assert!(!FailureKind::ApiKeyInvalid.counts_toward_circuit());
        assert!(!FailureKind::CreditsExhausted.counts_toward_circuit());
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        assert!(is_fresh(now - chrono::Duration::seconds(30), now, 60));
        assert!(!is_fresh(now - chrono::Duration::seconds(60), now, 60));
        assert!(!is_fresh(now - chrono::Duration::seconds(300), now, 60));
    }

    #[test]
    fn test_state_hash_round_trip() {
        let state = ProviderState {
            state: ProviderCondition::RateLimited,
            message: "429 from upstream".to_string(),
            last_check: Utc::now(),
            last_success: Some(Utc::now() - chrono::Duration::minutes(5)),
            consecutive_failures: 3,
            circuit_open: false,
            circuit_open_until: None,
            balance_hint: Some(12.5),
            usage_hint: None,
        };
        let map: HashMap<String, String> = state.to_fields().into_iter().collect();
        let parsed = ProviderState::from_hash(&map).unwrap();
        assert_eq!(parsed.state, ProviderCondition::RateLimited);
        assert_eq!(parsed.consecutive_failures, 3);
        assert!(!parsed.circuit_open);
        assert_eq!(parsed.balance_hint, Some(12.5));
        assert!(parsed.usage_hint.is_none());
        assert!(parsed.last_success.is_some());
    }

    #[test]
    fn test_circuit_active_respects_unlock_deadline() {
        let now = Utc::now();
        let mut state = ProviderState {
            circuit_open: true,
            circuit_open_until: Some(now + chrono::Duration::seconds(60)),
            ..ProviderState::default()
        };
        assert!(state.circuit_active(now));
        state.circuit_open_until = Some(now - chrono::Duration::seconds(1));
        assert!(!state.circuit_active(now));
        state.circuit_open = false;
        assert!(!state.circuit_active(now));
    }
}
