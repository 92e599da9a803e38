// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 工作器熔断器
//!
//! 每个工作器进程一个实例，在调度器之间共享，作为显式依赖传入。
//! 按失败率打开：观测量达到 `volume_threshold` 且失败率达到
//! `failure_ratio` 时进入OPEN，冷却 `open_duration` 后进入HALF_OPEN，
//! 放行 `half_open_probes` 次试探；全部成功则关闭，首次失败立即重开。

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};

use crate::config::settings::BreakerSettings;
use crate::infrastructure::redis::client::RedisStore;
use crate::infrastructure::redis::keys;

/// 熔断器配置
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// 评估失败率前的最小观测量
    pub volume_threshold: u32,
    /// 失败率阈值
    pub failure_ratio: f64,
    /// 打开状态冷却时间
    pub open_duration: Duration,
    /// 半开状态允许的试探次数
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 10,
            failure_ratio: 0.5,
            open_duration: Duration::from_secs(60),
            half_open_probes: 1,
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            volume_threshold: settings.volume_threshold,
            failure_ratio: settings.failure_ratio,
            open_duration: Duration::from_secs(settings.open_duration),
            half_open_probes: settings.half_open_probes.max(1),
        }
    }
}

/// 熔断器状态枚举
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakerState {
    /// 关闭（正常放行）
    Closed,
    /// 打开（快速失败）
    Open,
    /// 半开（限量试探）
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// 熔断器统计快照
#[derive(Clone, Debug)]
pub struct BreakerStats {
    /// 当前状态
    pub state: BreakerState,
    /// 当前窗口失败数
    pub failure_count: u32,
    /// 当前窗口成功数
    pub success_count: u32,
    /// 最近一次打开时间
    pub opened_at: Option<DateTime<Utc>>,
}

/// 熔断器内部状态
#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    probes_remaining: u32,
    probe_successes: u32,
}

/// 熔断器
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// 创建熔断器实例
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                opened_at_utc: None,
                probes_remaining: 0,
                probe_successes: 0,
            }),
        }
    }

    /// 调度门禁：当前是否允许发起处理
    ///
    /// OPEN状态冷却期满时就地切换到HALF_OPEN。本方法不消耗试探名额，
    /// 名额在 `try_acquire_probe` 中扣减。
    pub fn is_call_permitted(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.promote_if_cooled(&mut inner);
        if inner.state == BreakerState::Open {
            counter!("circuit_breaker_rejected_total").increment(1);
            return false;
        }
        true
    }

    /// 试探门禁：半开状态下限量放行
    ///
    /// # 返回值
    ///
    /// CLOSED恒为true；HALF_OPEN在剩余名额内为true并扣减名额；OPEN为false
    pub fn try_acquire_probe(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.promote_if_cooled(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probes_remaining == 0 {
                    return false;
                }
                inner.probes_remaining -= 1;
                true
            }
        }
    }

    /// 记录一次成功
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        counter!("circuit_breaker_requests_total").increment(1);
        counter!("circuit_breaker_successes_total").increment(1);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_probes {
                    self.close(&mut inner);
                }
            }
            _ => {
                inner.success_count += 1;
            }
        }
    }

    /// 记录一次失败
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        counter!("circuit_breaker_requests_total").increment(1);
        counter!("circuit_breaker_failures_total").increment(1);
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                let total = inner.failure_count + inner.success_count;
                if total >= self.config.volume_threshold {
                    let ratio = inner.failure_count as f64 / total as f64;
                    if ratio >= self.config.failure_ratio {
                        self.open(&mut inner);
                    }
                }
            }
            // 半开状态下首次失败立即重开
            BreakerState::HalfOpen => self.open(&mut inner),
            BreakerState::Open => {}
        }
    }

    /// 手动打开（控制广播）
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.open(&mut inner);
    }

    /// 手动复位到关闭（控制广播）
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.close(&mut inner);
    }

    /// 当前状态
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.promote_if_cooled(&mut inner);
        inner.state
    }

    /// 统计快照
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            opened_at: inner.opened_at_utc,
        }
    }

    /// 把当前状态镜像到存储，供观察方读取（尽力而为）
    pub async fn mirror(&self, store: &RedisStore, worker_id: &str) {
        let stats = self.stats();
        let fields = vec![
            ("state".to_string(), stats.state.to_string()),
            ("failure_count".to_string(), stats.failure_count.to_string()),
            ("success_count".to_string(), stats.success_count.to_string()),
            (
                "opened_at".to_string(),
                stats
                    .opened_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            ),
        ];
        if let Err(e) = store
            .hash_set(&keys::circuit_breaker(worker_id), &fields)
            .await
        {
            tracing::warn!("Failed to mirror circuit breaker state: {}", e);
        }
    }

    fn promote_if_cooled(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_remaining = self.config.half_open_probes;
                    inner.probe_successes = 0;
                    self.update_status_metric(BreakerState::HalfOpen);
                }
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_utc = Some(Utc::now());
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.probes_remaining = 0;
        inner.probe_successes = 0;
        self.update_status_metric(BreakerState::Open);
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.probes_remaining = 0;
        inner.probe_successes = 0;
        self.update_status_metric(BreakerState::Closed);
    }

    fn update_status_metric(&self, state: BreakerState) {
        let value = match state {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 0.5,
        };
        gauge!("circuit_breaker_status").set(value);
    }
}
