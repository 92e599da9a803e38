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

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// 应用程序配置设置
///
/// 包含存储、调度器、重试、熔断、限流、上游状态与心跳等所有配置项
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// 存储配置
    pub store: StoreSettings,
    /// 调度器（消费循环）配置
    pub dispatcher: DispatcherSettings,
    /// 重试与死信路由配置
    pub retry: RetrySettings,
    /// 熔断器配置
    pub breaker: BreakerSettings,
    /// 分布式限流配置
    pub limiter: LimiterSettings,
    /// 上游服务状态缓存配置
    pub provider_state: ProviderStateSettings,
    /// 延迟任务提升配置
    pub scheduler: SchedulerSettings,
    /// 工作器心跳配置
    pub heartbeat: HeartbeatSettings,
    /// 事件总线配置
    pub events: EventsSettings,
}

/// 存储配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Redis连接URL
    pub url: String,
    /// 最大连接数
    pub max_connections: u32,
    /// 短操作socket超时（秒）
    pub socket_timeout: u64,
    /// 阻塞弹出超时（秒），关停唤醒延迟的上界
    pub blocking_timeout: u64,
    /// 连接健康检查间隔（秒）
    pub health_check_interval: u64,
}

/// 调度器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    /// 单工作器并行在途任务数
    pub concurrency: usize,
    /// 任务软截止（秒），触发协作式取消
    pub soft_limit: u64,
    /// 任务硬截止（秒），强制放弃
    pub hard_limit: u64,
    /// 限流令牌等待上限（秒）
    pub token_wait: u64,
    /// 优雅关停等待在途任务的时间（秒）
    pub grace: u64,
    /// 熔断打开时的重入延迟（秒）
    pub circuit_requeue_delay: u64,
}

/// 重试调度表配置
#[derive(Debug, Clone, Deserialize)]
pub struct RetryScheduleSettings {
    /// 上游限流（429）
    pub rate_limit: Vec<u64>,
    /// 上游5xx
    pub service_unavailable: Vec<u64>,
    /// 额度耗尽
    pub credits: Vec<u64>,
    /// 网络错误
    pub network: Vec<u64>,
    /// 兜底调度表
    pub default: Vec<u64>,
}

/// 重试队列压力阈值
#[derive(Debug, Clone, Deserialize)]
pub struct RetryRatioThresholds {
    /// 警告深度，超过后重试消费比例降至0.20
    pub warn: u64,
    /// 严重深度，超过后降至0.10
    pub crit: u64,
}

/// 重试与死信路由配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// 缺省最大重试次数（提交时未指定时生效）
    pub max_retries: u32,
    /// 任务最大年龄（秒），超龄不再重试
    pub max_task_age: u64,
    /// 按失败类别的退避调度表（秒）
    pub schedule: RetryScheduleSettings,
    /// 自适应重试比例阈值
    pub ratio_thresholds: RetryRatioThresholds,
}

/// 熔断器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    /// 评估失败率前的最小观测量
    pub volume_threshold: u32,
    /// 失败率阈值（0.0-1.0）
    pub failure_ratio: f64,
    /// 打开状态冷却时间（秒）
    pub open_duration: u64,
    /// 半开状态允许的试探次数
    pub half_open_probes: u32,
}

/// 分布式限流配置设置
///
/// 桶容量/速率由上游公布的 `rate_limit:config` 决定，这里只提供引导缺省值
#[derive(Debug, Clone, Deserialize)]
pub struct LimiterSettings {
    /// 缺省请求配额
    pub default_requests: u64,
    /// 缺省配额区间（秒）
    pub default_interval: u64,
}

/// 上游服务状态缓存配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderStateSettings {
    /// 缓存新鲜阈值（秒）
    pub fresh: u64,
    /// 缓存失效阈值（秒），同时是状态熔断的解锁时长
    pub stale: u64,
    /// 连续失败达到此值后打开状态熔断
    pub circuit_threshold: u32,
    /// 刷新互斥锁TTL（秒）
    pub lock_timeout: u64,
}

/// 延迟任务提升配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// 提升周期（秒）
    pub tick: u64,
    /// 每轮最多提升的任务数
    pub batch: usize,
}

/// 工作器心跳配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    /// 心跳周期（秒）
    pub period: u64,
    /// TTL倍数，心跳键存活 period × ttl_factor 秒
    pub ttl_factor: u64,
}

/// 事件总线配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSettings {
    /// 全量快照发布间隔（秒）
    pub snapshot_interval: u64,
}

impl Settings {
    /// 创建新的配置实例
    ///
    /// 缺省值内置，可被 `config/default`、`config/{APP_ENVIRONMENT}` 文件
    /// 与 `TASKFLOW__` 前缀的环境变量逐层覆盖
    ///
    /// # Returns
    ///
    /// * `Ok(Settings)` - 成功加载的配置
    /// * `Err(ConfigError)` - 配置加载失败
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "default".to_string());
        let builder = Config::builder()
            // Store defaults
            .set_default("store.url", "redis://localhost:6379/0")?
            .set_default("store.max_connections", 50)?
            .set_default("store.socket_timeout", 30)?
            .set_default("store.blocking_timeout", 5)?
            .set_default("store.health_check_interval", 60)?
            // Dispatcher defaults
            .set_default("dispatcher.concurrency", 4)?
            .set_default("dispatcher.soft_limit", 600)?
            .set_default("dispatcher.hard_limit", 900)?
            .set_default("dispatcher.token_wait", 30)?
            .set_default("dispatcher.grace", 30)?
            .set_default("dispatcher.circuit_requeue_delay", 5)?
            // Retry defaults
            .set_default("retry.max_retries", 3)?
            .set_default("retry.max_task_age", 7200)?
            .set_default("retry.schedule.rate_limit", vec![60, 120, 300, 600])?
            .set_default("retry.schedule.service_unavailable", vec![5, 10, 30, 60, 120])?
            .set_default("retry.schedule.credits", vec![300, 600, 1800])?
            .set_default("retry.schedule.network", vec![2, 5, 10, 30, 60])?
            .set_default("retry.schedule.default", vec![5, 15, 60, 300])?
            .set_default("retry.ratio_thresholds.warn", 1000)?
            .set_default("retry.ratio_thresholds.crit", 5000)?
            // Circuit breaker defaults
            .set_default("breaker.volume_threshold", 10)?
            .set_default("breaker.failure_ratio", 0.5)?
            .set_default("breaker.open_duration", 60)?
            .set_default("breaker.half_open_probes", 1)?
            // Rate limiter bootstrap defaults
            .set_default("limiter.default_requests", 230)?
            .set_default("limiter.default_interval", 10)?
            // Provider state cache defaults
            .set_default("provider_state.fresh", 60)?
            .set_default("provider_state.stale", 300)?
            .set_default("provider_state.circuit_threshold", 5)?
            .set_default("provider_state.lock_timeout", 10)?
            // Scheduler defaults
            .set_default("scheduler.tick", 1)?
            .set_default("scheduler.batch", 100)?
            // Heartbeat defaults
            .set_default("heartbeat.period", 10)?
            .set_default("heartbeat.ttl_factor", 3)?
            // Event bus defaults
            .set_default("events.snapshot_interval", 5)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("TASKFLOW").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let settings = Settings::new().unwrap();
        assert_eq!(settings.store.blocking_timeout, 5);
        assert_eq!(settings.dispatcher.concurrency, 4);
        assert_eq!(settings.dispatcher.soft_limit, 600);
        assert_eq!(settings.dispatcher.hard_limit, 900);
        assert_eq!(settings.dispatcher.token_wait, 30);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.max_task_age, 7200);
        assert_eq!(settings.retry.ratio_thresholds.warn, 1000);
        assert_eq!(settings.retry.ratio_thresholds.crit, 5000);
        assert_eq!(settings.breaker.volume_threshold, 10);
        assert!((settings.breaker.failure_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(settings.provider_state.fresh, 60);
        assert_eq!(settings.provider_state.circuit_threshold, 5);
        assert_eq!(settings.scheduler.tick, 1);
        assert_eq!(settings.heartbeat.period, 10);
        assert_eq!(settings.heartbeat.ttl_factor, 3);
    }

    #[test]
    fn test_default_retry_schedules_match_policy() {
        let settings = Settings::new().unwrap();
        assert_eq!(settings.retry.schedule.rate_limit, vec![60, 120, 300, 600]);
        assert_eq!(
            settings.retry.schedule.service_unavailable,
            vec![5, 10, 30, 60, 120]
        );
        assert_eq!(settings.retry.schedule.credits, vec![300, 600, 1800]);
        assert_eq!(settings.retry.schedule.network, vec![2, 5, 10, 30, 60]);
        assert_eq!(settings.retry.schedule.default, vec![5, 15, 60, 300]);
    }
}
