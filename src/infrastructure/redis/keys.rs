// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! Redis键名布局
//!
//! 所有持久化键名的唯一定义处。键名格式与外部协作方（API层、仪表盘）约定，
//! 修改任何格式都会破坏兼容性。

use chrono::{DateTime, Utc};

/// 主队列（新提交任务），LPUSH入队 / BRPOP出队
pub const PRIMARY_QUEUE: &str = "tasks:pending:primary";

/// 重试队列（到期重试任务），LPUSH入队 / BRPOP出队
pub const RETRY_QUEUE: &str = "tasks:pending:retry";

/// 延迟重试有序集合，score为到期时间（epoch秒）
pub const SCHEDULED_SET: &str = "tasks:scheduled";

/// 死信队列列表
pub const DLQ_LIST: &str = "dlq:tasks";

/// 状态计数器键前缀，后接小写状态名
pub const STATE_COUNTER_PREFIX: &str = "metrics:tasks:state:";

/// 令牌桶状态哈希
pub const RATE_LIMIT_BUCKET: &str = "rate_limit:bucket";

/// 令牌桶配置哈希 {requests, interval, updated_at}
pub const RATE_LIMIT_CONFIG: &str = "rate_limit:config";

/// 上游服务状态哈希
pub const PROVIDER_STATE: &str = "provider:state";

/// 上游服务状态刷新锁
pub const PROVIDER_STATE_LOCK: &str = "provider:state:lock";

/// 上游服务每日指标键前缀，后接 YYYY-MM-DD
pub const PROVIDER_METRICS_PREFIX: &str = "provider:metrics:";

/// 事件发布频道
pub const EVENTS_CHANNEL: &str = "queue-updates";

/// 工作器控制广播频道（熔断器复位/强开指令）
pub const CONTROL_CHANNEL: &str = "worker:control";

/// 任务记录键
///
/// # 参数
///
/// * `task_id` - 任务ID
///
/// # 返回值
///
/// 返回 `task:{id}` 格式的键名
pub fn task(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// 死信副本键 `dlq:task:{id}`
pub fn dlq_task(task_id: &str) -> String {
    format!("dlq:task:{}", task_id)
}

/// 状态计数器键 `metrics:tasks:state:{state_lower}`
pub fn state_counter(state: &str) -> String {
    format!("{}{}", STATE_COUNTER_PREFIX, state.to_lowercase())
}

/// 工作器心跳键 `worker:heartbeat:{worker_id}`
pub fn worker_heartbeat(worker_id: &str) -> String {
    format!("worker:heartbeat:{}", worker_id)
}

/// 工作器在途任务集合键 `worker:active_tasks:{worker_id}`
pub fn worker_active_tasks(worker_id: &str) -> String {
    format!("worker:active_tasks:{}", worker_id)
}

/// 工作器熔断器状态键 `circuit_breaker:{worker_id}`
pub fn circuit_breaker(worker_id: &str) -> String {
    format!("circuit_breaker:{}", worker_id)
}

/// 上游服务每日指标键 `provider:metrics:{YYYY-MM-DD}`
pub fn provider_metrics(day: DateTime<Utc>) -> String {
    format!("{}{}", PROVIDER_METRICS_PREFIX, day.format("%Y-%m-%d"))
}
