// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 重试与死信路由
//!
//! 失败分类表、按类别的退避调度表与入死信的决策过程。
//! 熔断重入不消耗重试次数；永久失败、重试耗尽与超龄任务进入死信队列。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{info, warn};

use crate::config::settings::{RetryScheduleSettings, RetrySettings};
use crate::domain::error::{BrokerError, ErrorClass, PermanentKind, TransientKind};
use crate::domain::task::{Task, TaskState};
use crate::queue::repository::TaskRepository;

/// 根据重试队列深度计算自适应重试消费比例
///
/// 队列压力越大，越优先保障新任务的吞吐：
/// 正常0.30，超过警告阈值0.20，超过严重阈值0.10
pub fn adaptive_retry_ratio(retry_depth: u64, warn: u64, crit: u64) -> f64 {
    if retry_depth < warn {
        0.30
    } else if retry_depth < crit {
        0.20
    } else {
        0.10
    }
}

/// 按上游HTTP状态码分类失败
///
/// 分类表首项命中即返回
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        400 => ErrorClass::Permanent(PermanentKind::Validation),
        401 => ErrorClass::Permanent(PermanentKind::Auth),
        403 | 404 => ErrorClass::Permanent(PermanentKind::Forbidden),
        402 => ErrorClass::Transient(TransientKind::Credits),
        429 => ErrorClass::Transient(TransientKind::RateLimit),
        500..=599 => ErrorClass::Transient(TransientKind::ServiceUnavailable),
        _ => ErrorClass::Transient(TransientKind::Default),
    }
}

/// 按错误消息内容做兜底分类
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("content policy") || lower.contains("moderation") {
        ErrorClass::Permanent(PermanentKind::ContentPolicy)
    } else if lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("broken pipe")
        || lower.contains("network")
    {
        ErrorClass::Transient(TransientKind::Network)
    } else if lower.contains("rate limit") {
        ErrorClass::Transient(TransientKind::RateLimit)
    } else if lower.contains("credits") || lower.contains("quota") {
        ErrorClass::Transient(TransientKind::Credits)
    } else {
        ErrorClass::Transient(TransientKind::Default)
    }
}

/// 调度表查表：尝试序号越界时停在最后一档
pub fn schedule_delay(schedule: &[u64], attempt: u32) -> u64 {
    let idx = (attempt as usize).min(schedule.len().saturating_sub(1));
    schedule.get(idx).copied().unwrap_or(30)
}

/// 路由决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// 入死信队列
    DeadLetter,
    /// 调度延迟重试
    ///
    /// `retry_count` 为None时保持计数不变（熔断重入）
    Schedule {
        retry_count: Option<u32>,
        delay_secs: u64,
    },
}

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// 已入死信
    DeadLettered,
    /// 已调度重试
    Scheduled { delay: Duration },
}

/// 纯决策函数：失败后去向
///
/// # 参数
///
/// * `class` - 失败分类
/// * `retry_count` - 当前重试计数
/// * `max_retries` - 重试上限
/// * `age_secs` - 任务年龄（秒）
/// * `max_age_secs` - 年龄上限（秒）
/// * `base_delay_secs` - 类别调度表给出的基础延迟
pub fn decide(
    class: &ErrorClass,
    retry_count: u32,
    max_retries: u32,
    age_secs: i64,
    max_age_secs: u64,
    base_delay_secs: u64,
) -> RouteDecision {
    if age_secs >= max_age_secs as i64 {
        return RouteDecision::DeadLetter;
    }
    match class {
        ErrorClass::Permanent(_) | ErrorClass::Internal => RouteDecision::DeadLetter,
        ErrorClass::Transient(TransientKind::CircuitOpen) => RouteDecision::Schedule {
            retry_count: None,
            delay_secs: base_delay_secs,
        },
        ErrorClass::Transient(_) => {
            if retry_count >= max_retries {
                RouteDecision::DeadLetter
            } else {
                RouteDecision::Schedule {
                    retry_count: Some(retry_count + 1),
                    delay_secs: base_delay_secs,
                }
            }
        }
    }
}

/// 重试路由器
pub struct RetryRouter {
    repo: Arc<TaskRepository>,
    schedule: RetryScheduleSettings,
    max_task_age: u64,
    circuit_requeue_delay: u64,
}

impl RetryRouter {
    /// 创建路由器
    pub fn new(
        repo: Arc<TaskRepository>,
        retry: &RetrySettings,
        circuit_requeue_delay: u64,
    ) -> Self {
        Self {
            repo,
            schedule: retry.schedule.clone(),
            max_task_age: retry.max_task_age,
            circuit_requeue_delay,
        }
    }

    /// 第 `attempt` 次重试（0起）的基础延迟
    fn base_delay(&self, kind: TransientKind, attempt: u32) -> u64 {
        let schedule: &[u64] = match kind {
            TransientKind::RateLimit => &self.schedule.rate_limit,
            TransientKind::ServiceUnavailable => &self.schedule.service_unavailable,
            TransientKind::Credits => &self.schedule.credits,
            TransientKind::Network => &self.schedule.network,
            TransientKind::CircuitOpen => return self.circuit_requeue_delay,
            TransientKind::Timeout | TransientKind::Default => &self.schedule.default,
        };
        schedule_delay(schedule, attempt)
    }

    /// 对失败任务执行路由决策
    ///
    /// 依次执行：记录错误、ACTIVE→FAILED转换、按决策入死信或调度重试。
    /// 每一步都是独立的原子脚本，中途崩溃留下的FAILED记录可由手动重试恢复。
    ///
    /// # 参数
    ///
    /// * `task` - 派发时读取的任务快照
    /// * `class` - 失败分类
    /// * `message` - 错误消息
    pub async fn route_failure(
        &self,
        task: &Task,
        class: ErrorClass,
        message: &str,
    ) -> Result<RouteOutcome, BrokerError> {
        let tag = class.tag();
        self.repo.record_error(&task.task_id, &tag, message).await?;
        self.repo
            .transition(&task.task_id, TaskState::Active, TaskState::Failed, &[])
            .await?;

        let base = match class {
            ErrorClass::Transient(kind) => self.base_delay(kind, task.retry_count),
            _ => 0,
        };
        let decision = decide(
            &class,
            task.retry_count,
            task.max_retries,
            task.age(Utc::now()).num_seconds(),
            self.max_task_age,
            base,
        );

        match decision {
            RouteDecision::DeadLetter => {
                warn!(
                    "Task {} dead-lettered after {} retries: {} ({})",
                    task.task_id, task.retry_count, message, tag
                );
                self.repo.move_to_dlq(&task.task_id).await?;
                counter!("tasks_dead_lettered_total").increment(1);
                Ok(RouteOutcome::DeadLettered)
            }
            RouteDecision::Schedule {
                retry_count,
                delay_secs,
            } => {
                // jitter ∈ [0, 0.1]
                let jitter = rand::random_range(0.0..=0.1);
                let delay =
                    Duration::from_secs_f64(delay_secs as f64 * (1.0 + jitter));
                let retry_after = Utc::now()
                    + chrono::Duration::milliseconds(delay.as_millis() as i64);
                self.repo
                    .schedule_retry(&task.task_id, retry_count, retry_after)
                    .await?;
                counter!("tasks_retry_scheduled_total").increment(1);
                info!(
                    "Scheduled retry {}/{} for task {} in {:.1}s ({})",
                    retry_count.unwrap_or(task.retry_count),
                    task.max_retries,
                    task.task_id,
                    delay.as_secs_f64(),
                    tag
                );
                Ok(RouteOutcome::Scheduled { delay })
            }
        }
    }
}
