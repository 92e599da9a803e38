// Copyright 2025 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! 分布式令牌桶限流器
//!
//! 单个共享令牌桶协调所有工作器进程对上游的请求速率。补充与扣减在
//! 服务端脚本内原子完成，不存在多工作器之间的竞态。配置由上游公布，
//! 通过 `update_config` 在带外刷新；容量缩小时现有令牌被收缩。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::error::BrokerError;
use crate::infrastructure::redis::client::{RedisStore, StoreError};
use crate::infrastructure::redis::{keys, scripts};

/// 单次尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Acquire {
    /// 已授予，附带剩余令牌数
    Granted { remaining: f64 },
    /// 被拒绝，附带建议等待时间
    Denied { wait: Duration },
}

/// 桶状态快照，用于监控
#[derive(Debug, Clone)]
pub struct BucketStatus {
    /// 当前令牌数（含在途补充）
    pub tokens: f64,
    /// 桶容量
    pub capacity: f64,
    /// 补充速率（令牌/秒）
    pub refill_rate: f64,
    /// 上次补充时间（epoch秒）
    pub last_refill: f64,
    /// 利用率（0-100）
    pub utilization_percent: f64,
}

/// 纯补充计算，与服务端脚本保持同一算式
///
/// 经过 `elapsed` 秒后的令牌数，上限为容量，时间回拨按0处理
pub fn refill(tokens: f64, capacity: f64, refill_rate: f64, elapsed: f64) -> f64 {
    let elapsed = elapsed.max(0.0);
    (tokens + elapsed * refill_rate).min(capacity)
}

/// 分布式令牌桶
pub struct TokenBucketLimiter {
    store: Arc<RedisStore>,
}

impl TokenBucketLimiter {
    /// 创建限流器
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self { store }
    }

    /// 单次非阻塞获取尝试
    pub async fn try_acquire(&self, tokens: u32) -> Result<Acquire, StoreError> {
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let result: Vec<String> = self
            .store
            .run_script(
                &scripts::ACQUIRE_TOKENS,
                &[
                    keys::RATE_LIMIT_BUCKET.to_string(),
                    keys::RATE_LIMIT_CONFIG.to_string(),
                ],
                &[now.to_string(), tokens.to_string()],
            )
            .await?;

        let granted = result.first().map(|v| v == "1").unwrap_or(false);
        if granted {
            let remaining = result
                .get(1)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            Ok(Acquire::Granted { remaining })
        } else {
            let wait_secs: f64 = result
                .get(2)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.1)
                .max(0.01);
            Ok(Acquire::Denied {
                wait: Duration::from_secs_f64(wait_secs),
            })
        }
    }

    /// 阻塞获取令牌
    ///
    /// 循环尝试：被拒绝时按建议等待时间与剩余预算的较小值休眠后重试，
    /// 预算耗尽时返回 `RateLimitTimeout`。`timeout` 为零时只尝试一次。
    ///
    /// # 参数
    ///
    /// * `tokens` - 请求令牌数
    /// * `timeout` - 等待预算
    pub async fn acquire(&self, tokens: u32, timeout: Duration) -> Result<(), BrokerError> {
        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            match self.try_acquire(tokens).await? {
                Acquire::Granted { remaining } => {
                    histogram!("rate_limiter_wait_seconds")
                        .record(start.elapsed().as_secs_f64());
                    debug!(
                        "Acquired {} rate limit token(s), {:.2} remaining",
                        tokens, remaining
                    );
                    return Ok(());
                }
                Acquire::Denied { wait } => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        counter!("rate_limiter_timeouts_total").increment(1);
                        return Err(BrokerError::RateLimitTimeout);
                    }
                    tokio::time::sleep(wait.min(remaining)).await;
                }
            }
        }
    }

    /// 读取桶状态
    pub async fn status(&self) -> Result<BucketStatus, StoreError> {
        let bucket: HashMap<String, String> =
            self.store.hash_get_all(keys::RATE_LIMIT_BUCKET).await?;
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;

        let parse = |field: &str| -> f64 {
            bucket
                .get(field)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0)
        };
        let tokens = parse("tokens");
        let capacity = parse("capacity");
        let refill_rate = parse("refill_rate");
        let last_refill = bucket
            .get("last_refill")
            .and_then(|v| v.parse().ok())
            .unwrap_or(now);

        let current = if refill_rate > 0.0 {
            refill(tokens, capacity, refill_rate, now - last_refill)
        } else {
            tokens
        };
        let utilization = if capacity > 0.0 {
            (1.0 - current / capacity) * 100.0
        } else {
            0.0
        };

        Ok(BucketStatus {
            tokens: current,
            capacity,
            refill_rate,
            last_refill,
            utilization_percent: utilization,
        })
    }

    /// 刷新限流配置
    ///
    /// 上游公布新配额时调用。写入配置并原子地调整桶：
    /// 容量缩小时令牌被收缩到新容量以内
    ///
    /// # 参数
    ///
    /// * `requests` - 区间内允许的请求数
    /// * `interval_secs` - 区间长度（秒）
    pub async fn update_config(&self, requests: u64, interval_secs: u64) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let _: String = self
            .store
            .run_script(
                &scripts::UPDATE_LIMIT_CONFIG,
                &[
                    keys::RATE_LIMIT_CONFIG.to_string(),
                    keys::RATE_LIMIT_BUCKET.to_string(),
                ],
                &[
                    requests.to_string(),
                    interval_secs.max(1).to_string(),
                    now.to_string(),
                ],
            )
            .await?;
        info!(
            "Rate limit config updated: {} requests / {}s",
            requests, interval_secs
        );
        Ok(())
    }

    /// 清空桶状态，下次获取时按配置重新引导
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.delete(keys::RATE_LIMIT_BUCKET).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_caps_at_capacity() {
        assert!((refill(0.0, 5.0, 1.0, 3.0) - 3.0).abs() < 1e-9);
        assert!((refill(4.0, 5.0, 1.0, 30.0) - 5.0).abs() < 1e-9);
        assert!((refill(5.0, 5.0, 1.0, 1.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_refill_ignores_clock_rewind() {
        assert!((refill(2.0, 5.0, 1.0, -10.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_refill_is_monotone_in_elapsed() {
        let a = refill(1.0, 10.0, 0.5, 2.0);
        let b = refill(1.0, 10.0, 0.5, 4.0);
        assert!(b >= a);
    }

    #[test]
    fn test_grant_arithmetic_bounds() {
        // P5: 授出的令牌不超过 初始令牌 + 速率×时间
        let capacity = 5.0;
        let rate = 1.0;
        let mut tokens = capacity;
        let mut granted = 0u32;
        // 10 requests at t=0: only 5 should be grantable
        for _ in 0..10 {
            let available = refill(tokens, capacity, rate, 0.0);
            if available >= 1.0 {
                tokens = available - 1.0;
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        // After 3 seconds, 3 more tokens accrue
        let available = refill(tokens, capacity, rate, 3.0);
        assert!((available - 3.0).abs() < 1e-9);
    }
}
