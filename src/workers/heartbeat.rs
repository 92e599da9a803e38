// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 工作器心跳与存活监控
//!
//! 每个工作器周期性写入带TTL的心跳键；聚合侧扫描心跳并按年龄分级。
//! 心跳键TTL为周期的 `ttl_factor` 倍，进程消失后键自动过期。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::error::BrokerError;
use crate::infrastructure::redis::client::RedisStore;
use crate::infrastructure::redis::keys;
use crate::workers::circuit_breaker::CircuitBreaker;

/// 工作器存活状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// 心跳在一个周期内
    Healthy,
    /// 心跳在TTL窗口内但已超过一个周期
    Stale,
    /// 无心跳
    NoHeartbeat,
}

/// 按心跳年龄分级
pub fn classify_age(age_secs: f64, period: u64, ttl_factor: u64) -> WorkerStatus {
    if age_secs <= period as f64 {
        WorkerStatus::Healthy
    } else if age_secs <= (period * ttl_factor) as f64 {
        WorkerStatus::Stale
    } else {
        WorkerStatus::NoHeartbeat
    }
}

/// 单个工作器的健康信息
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    /// 工作器ID
    pub worker_id: String,
    /// 进程ID
    pub pid: u32,
    /// 在途任务数
    pub in_flight: usize,
    /// 熔断器状态
    pub breaker_state: String,
    /// 心跳年龄（秒）
    pub age_seconds: f64,
    /// 分级结果
    pub status: WorkerStatus,
}

/// 全体工作器存活汇总
#[derive(Debug, Clone, Serialize)]
pub struct LivenessSummary {
    /// 各工作器健康信息
    pub workers: Vec<WorkerHealth>,
    /// 总工作器数
    pub total_workers: usize,
    /// 整体状态
    pub overall_status: String,
}

/// 计算整体状态
fn overall_status(workers: &[WorkerHealth]) -> String {
    if workers.is_empty() {
        return "no_workers".to_string();
    }
    let healthy = workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Healthy)
        .count();
    if healthy == workers.len() {
        "healthy".to_string()
    } else if healthy > 0 {
        "degraded".to_string()
    } else {
        "unhealthy".to_string()
    }
}

/// 心跳任务
pub struct HeartbeatTask {
    store: Arc<RedisStore>,
    worker_id: String,
    period: Duration,
    ttl: Duration,
    in_flight: Arc<AtomicUsize>,
    breaker: Arc<CircuitBreaker>,
}

impl HeartbeatTask {
    /// 创建心跳任务
    ///
    /// # 参数
    ///
    /// * `store` - 存储
    /// * `worker_id` - 工作器标识
    /// * `period` - 心跳周期（秒）
    /// * `ttl_factor` - TTL倍数
    /// * `in_flight` - 在途任务计数器（调度器共享）
    /// * `breaker` - 熔断器，状态写入心跳供观察方读取
    pub fn new(
        store: Arc<RedisStore>,
        worker_id: String,
        period: u64,
        ttl_factor: u64,
        in_flight: Arc<AtomicUsize>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            worker_id,
            period: Duration::from_secs(period.max(1)),
            ttl: Duration::from_secs((period * ttl_factor).max(1)),
            in_flight,
            breaker,
        }
    }

    /// 写入一次心跳
    pub async fn beat(&self) {
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let fields = vec![
            ("worker_id".to_string(), self.worker_id.clone()),
            ("pid".to_string(), std::process::id().to_string()),
            (
                "in_flight".to_string(),
                self.in_flight.load(Ordering::Relaxed).to_string(),
            ),
            (
                "breaker_state".to_string(),
                self.breaker.state().to_string(),
            ),
            ("last_seen".to_string(), now.to_string()),
        ];
        if let Err(e) = self
            .store
            .hash_set_with_ttl(&keys::worker_heartbeat(&self.worker_id), &fields, self.ttl)
            .await
        {
            warn!("Failed to write heartbeat for {}: {}", self.worker_id, e);
        }
        // 镜像熔断器状态
        self.breaker.mirror(&self.store, &self.worker_id).await;
    }

    /// 启动后台心跳
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.beat().await,
                    _ = shutdown.changed() => {
                        debug!("Heartbeat task stopped for {}", self.worker_id);
                        break;
                    }
                }
            }
        })
    }
}

/// 聚合所有工作器的存活信息
///
/// # 参数
///
/// * `store` - 存储
/// * `period` - 心跳周期（秒）
/// * `ttl_factor` - TTL倍数
pub async fn liveness_summary(
    store: &RedisStore,
    period: u64,
    ttl_factor: u64,
) -> Result<LivenessSummary, BrokerError> {
    let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    let keys_found = store.scan_keys("worker:heartbeat:*").await?;

    let mut workers = Vec::with_capacity(keys_found.len());
    for key in keys_found {
        let fields = store.hash_get_all(&key).await?;
        if fields.is_empty() {
            continue;
        }
        let worker_id = fields
            .get("worker_id")
            .cloned()
            .unwrap_or_else(|| key.rsplit(':').next().unwrap_or("unknown").to_string());
        let last_seen: f64 = fields
            .get("last_seen")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let age = (now - last_seen).max(0.0);
        workers.push(WorkerHealth {
            worker_id,
            pid: fields.get("pid").and_then(|v| v.parse().ok()).unwrap_or(0),
            in_flight: fields
                .get("in_flight")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            breaker_state: fields
                .get("breaker_state")
                .cloned()
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            age_seconds: age,
            status: classify_age(age, period, ttl_factor),
        });
    }
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    Ok(LivenessSummary {
        overall_status: overall_status(&workers),
        total_workers: workers.len(),
        workers,
    })
}
