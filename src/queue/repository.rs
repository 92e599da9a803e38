// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 任务记录仓库
//!
//! 任务哈希、四个队列与状态计数器的唯一写入口。每个变更操作对应一个
//! 服务端脚本，状态CAS、队列成员变更、计数器增减与历史追加在脚本内
//! 一次性完成，任意时刻的计数器都与记录一致。
//!
//! 事件在脚本成功后发布，属于尽力而为，不参与不变式。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::error::BrokerError;
use crate::domain::event::{EventKind, QueueDepths};
use crate::domain::task::{format_ts, Task, TaskState};
use crate::events::bus::EventBus;
use crate::infrastructure::redis::client::RedisStore;
use crate::infrastructure::redis::{keys, scripts};

/// 提升结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// 成功提升到重试队列
    Promoted,
    /// 记录已不在SCHEDULED状态，仅做了集合清理
    Skipped(String),
    /// 记录已不存在，仅做了集合清理
    Gone,
}

/// 任务仓库
pub struct TaskRepository {
    store: Arc<RedisStore>,
    bus: Arc<EventBus>,
}

/// 解析脚本哨兵返回值
fn map_status(status: &str, expected: &str) -> Result<(), BrokerError> {
    match status {
        "OK" => Ok(()),
        "EXISTS" => Err(BrokerError::AlreadyExists),
        "NOT_FOUND" => Err(BrokerError::NotFound),
        s => {
            if let Some(actual) = s.strip_prefix("CONFLICT:") {
                Err(BrokerError::Conflict {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                })
            } else {
                Err(BrokerError::Internal(format!(
                    "unexpected script status: {}",
                    s
                )))
            }
        }
    }
}

impl TaskRepository {
    /// 创建任务仓库
    pub fn new(store: Arc<RedisStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// 创建任务记录并入主队列
    ///
    /// # 参数
    ///
    /// * `task` - 新任务（PENDING状态）
    ///
    /// # 返回值
    ///
    /// * `Ok(())` - 创建成功
    /// * `Err(BrokerError::AlreadyExists)` - 同ID记录已存在
    pub async fn create(&self, task: &Task) -> Result<(), BrokerError> {
        let now = format_ts(Utc::now());
        let mut args = vec![now, task.task_id.clone()];
        for (field, value) in task.to_create_fields() {
            args.push(field);
            args.push(value);
        }
        let status: String = self
            .store
            .run_script(
                &scripts::CREATE_TASK,
                &[
                    keys::task(&task.task_id),
                    keys::PRIMARY_QUEUE.to_string(),
                    keys::state_counter(&TaskState::Pending.to_string()),
                ],
                &args,
            )
            .await?;
        map_status(&status, "")?;

        self.bus
            .publish_task_event(
                EventKind::TaskCreated,
                &task.task_id,
                None,
                Some(TaskState::Pending),
            )
            .await;
        Ok(())
    }

    /// 状态CAS转换（不涉及队列成员变更）
    ///
    /// # 参数
    ///
    /// * `task_id` - 任务ID
    /// * `from` - 期望的当前状态
    /// * `to` - 目标状态
    /// * `patch` - 附带写入的哈希字段
    ///
    /// # 返回值
    ///
    /// * `Ok(())` - 转换成功
    /// * `Err(BrokerError::Conflict)` - 观察到的状态与期望不符
    pub async fn transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        patch: &[(String, String)],
    ) -> Result<(), BrokerError> {
        let now = format_ts(Utc::now());
        let mut args = vec![from.to_string(), to.to_string(), now];
        for (field, value) in patch {
            args.push(field.clone());
            args.push(value.clone());
        }
        let status: String = self
            .store
            .run_script(
                &scripts::TRANSITION,
                &[
                    keys::task(task_id),
                    keys::state_counter(&from.to_string()),
                    keys::state_counter(&to.to_string()),
                ],
                &args,
            )
            .await?;
        map_status(&status, &from.to_string())?;

        self.bus
            .publish_task_event(EventKind::TaskStateChanged, task_id, Some(from), Some(to))
            .await;
        Ok(())
    }

    /// PENDING -> ACTIVE
    pub async fn activate(&self, task_id: &str) -> Result<(), BrokerError> {
        self.transition(task_id, TaskState::Pending, TaskState::Active, &[])
            .await
    }

    /// ACTIVE -> COMPLETED，写入结果与完成时间
    pub async fn complete(&self, task_id: &str, result: &str) -> Result<(), BrokerError> {
        let now = format_ts(Utc::now());
        self.transition(
            task_id,
            TaskState::Active,
            TaskState::Completed,
            &[
                ("result".to_string(), result.to_string()),
                ("completed_at".to_string(), now),
            ],
        )
        .await
    }

    /// 记录任务错误：追加错误历史并更新最近错误字段
    pub async fn record_error(
        &self,
        task_id: &str,
        error_type: &str,
        message: &str,
    ) -> Result<(), BrokerError> {
        let status: String = self
            .store
            .run_script(
                &scripts::RECORD_ERROR,
                &[keys::task(task_id)],
                &[
                    error_type.to_string(),
                    message.to_string(),
                    format_ts(Utc::now()),
                ],
            )
            .await?;
        map_status(&status, "")
    }

    /// FAILED -> SCHEDULED，写入下次重试时间并加入延迟集合
    ///
    /// # 参数
    ///
    /// * `task_id` - 任务ID
    /// * `retry_count` - 新的重试计数；熔断重入时传None保持不变
    /// * `retry_after` - 到期时间
    pub async fn schedule_retry(
        &self,
        task_id: &str,
        retry_count: Option<u32>,
        retry_after: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let now = format_ts(Utc::now());
        let score = retry_after.timestamp().to_string();
        let mut args = vec![now, score, task_id.to_string()];
        args.push("retry_after".to_string());
        args.push(format_ts(retry_after));
        if let Some(count) = retry_count {
            args.push("retry_count".to_string());
            args.push(count.to_string());
        }
        let status: String = self
            .store
            .run_script(
                &scripts::SCHEDULE_RETRY,
                &[
                    keys::task(task_id),
                    keys::state_counter(&TaskState::Failed.to_string()),
                    keys::state_counter(&TaskState::Scheduled.to_string()),
                    keys::SCHEDULED_SET.to_string(),
                ],
                &args,
            )
            .await?;
        map_status(&status, &TaskState::Failed.to_string())?;

        self.bus
            .publish_task_event(
                EventKind::TaskStateChanged,
                task_id,
                Some(TaskState::Failed),
                Some(TaskState::Scheduled),
            )
            .await;
        Ok(())
    }

    /// FAILED -> DLQ，推入死信列表并保存完整副本
    pub async fn move_to_dlq(&self, task_id: &str) -> Result<(), BrokerError> {
        let now = format_ts(Utc::now());
        let status: String = self
            .store
            .run_script(
                &scripts::MOVE_TO_DLQ,
                &[
                    keys::task(task_id),
                    keys::state_counter(&TaskState::Failed.to_string()),
                    keys::state_counter(&TaskState::Dlq.to_string()),
                    keys::DLQ_LIST.to_string(),
                    keys::dlq_task(task_id),
                ],
                &[now, task_id.to_string()],
            )
            .await?;
        map_status(&status, &TaskState::Failed.to_string())?;

        self.bus
            .publish_task_event(
                EventKind::TaskStateChanged,
                task_id,
                Some(TaskState::Failed),
                Some(TaskState::Dlq),
            )
            .await;
        Ok(())
    }

    /// 提升到期的延迟任务到重试队列
    ///
    /// 幂等：记录不再处于SCHEDULED时只做集合清理，可在多个工作器上并发执行
    pub async fn promote_scheduled(&self, task_id: &str) -> Result<PromotionOutcome, BrokerError> {
        let now = format_ts(Utc::now());
        let status: String = self
            .store
            .run_script(
                &scripts::PROMOTE_SCHEDULED,
                &[
                    keys::task(task_id),
                    keys::SCHEDULED_SET.to_string(),
                    keys::RETRY_QUEUE.to_string(),
                    keys::state_counter(&TaskState::Scheduled.to_string()),
                    keys::state_counter(&TaskState::Pending.to_string()),
                ],
                &[task_id.to_string(), now],
            )
            .await?;

        match status.as_str() {
            "OK" => {
                self.bus
                    .publish_task_event(
                        EventKind::TaskStateChanged,
                        task_id,
                        Some(TaskState::Scheduled),
                        Some(TaskState::Pending),
                    )
                    .await;
                Ok(PromotionOutcome::Promoted)
            }
            "GONE" => Ok(PromotionOutcome::Gone),
            s => {
                if let Some(state) = s.strip_prefix("SKIPPED:") {
                    Ok(PromotionOutcome::Skipped(state.to_string()))
                } else {
                    Err(BrokerError::Internal(format!(
                        "unexpected script status: {}",
                        s
                    )))
                }
            }
        }
    }

    /// 手动重试：FAILED/DLQ -> PENDING，重置重试计数并入重试队列
    pub async fn manual_retry(&self, task_id: &str) -> Result<(), BrokerError> {
        let now = format_ts(Utc::now());
        let status: String = self
            .store
            .run_script(
                &scripts::MANUAL_RETRY,
                &[
                    keys::task(task_id),
                    keys::RETRY_QUEUE.to_string(),
                    keys::DLQ_LIST.to_string(),
                    keys::dlq_task(task_id),
                    keys::state_counter(&TaskState::Pending.to_string()),
                    keys::state_counter(&TaskState::Failed.to_string()),
                    keys::state_counter(&TaskState::Dlq.to_string()),
                ],
                &[task_id.to_string(), now],
            )
            .await?;

        if let Some(old_state) = status.strip_prefix("OK:") {
            let old = old_state.parse().ok();
            self.bus
                .publish_task_event(
                    EventKind::TaskStateChanged,
                    task_id,
                    old,
                    Some(TaskState::Pending),
                )
                .await;
            return Ok(());
        }
        map_status(&status, "FAILED|DLQ")
    }

    /// 删除任务：清除记录、全部队列成员资格与死信副本
    pub async fn delete(&self, task_id: &str) -> Result<(), BrokerError> {
        let status: String = self
            .store
            .run_script(
                &scripts::DELETE_TASK,
                &[
                    keys::task(task_id),
                    keys::PRIMARY_QUEUE.to_string(),
                    keys::RETRY_QUEUE.to_string(),
                    keys::SCHEDULED_SET.to_string(),
                    keys::DLQ_LIST.to_string(),
                    keys::dlq_task(task_id),
                ],
                &[task_id.to_string(), keys::STATE_COUNTER_PREFIX.to_string()],
            )
            .await?;

        if let Some(old_state) = status.strip_prefix("OK:") {
            let old = old_state.parse().ok();
            self.bus
                .publish_task_event(EventKind::TaskStateChanged, task_id, old, None)
                .await;
            return Ok(());
        }
        map_status(&status, "")
    }

    /// 读取任务记录
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, BrokerError> {
        let fields = self.store.hash_get_all(&keys::task(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Task::from_hash(&fields)
            .map(Some)
            .map_err(|e| BrokerError::Internal(e.to_string()))
    }

    /// 读取死信副本，缺失时回退到常规记录
    pub async fn get_dlq_record(&self, task_id: &str) -> Result<Option<Task>, BrokerError> {
        let fields = self.store.hash_get_all(&keys::dlq_task(task_id)).await?;
        if fields.is_empty() {
            return self.get(task_id).await;
        }
        match Task::from_hash(&fields) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!("Corrupt DLQ copy for {}: {}", task_id, e);
                self.get(task_id).await
            }
        }
    }

    /// 读取死信队列前 `limit` 个任务ID
    pub async fn dlq_ids(&self, limit: usize) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .store
            .list_range(keys::DLQ_LIST, 0, limit as isize - 1)
            .await?)
    }

    /// 读取到期的延迟任务ID（score ≤ now，最早优先，平局按字典序）
    pub async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .store
            .zset_range_by_score_limit(keys::SCHEDULED_SET, now.timestamp() as f64, limit)
            .await?)
    }

    /// 当前重试队列深度
    pub async fn retry_depth(&self) -> Result<u64, BrokerError> {
        Ok(self.store.list_len(keys::RETRY_QUEUE).await?)
    }

    /// 当前各队列深度
    pub async fn queue_depths(&self) -> Result<QueueDepths, BrokerError> {
        Ok(QueueDepths {
            primary: self.store.list_len(keys::PRIMARY_QUEUE).await?,
            retry: self.store.list_len(keys::RETRY_QUEUE).await?,
            scheduled: self.store.zset_len(keys::SCHEDULED_SET).await?,
            dlq: self.store.list_len(keys::DLQ_LIST).await?,
        })
    }

    /// 扫描全部任务记录键
    pub async fn scan_task_keys(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self.store.scan_keys("task:*").await?)
    }

    /// 读取所有队列中出现的任务ID集合
    ///
    /// 孤儿检测用。列表整体读取，规模大时应离线执行
    pub async fn queued_ids(&self) -> Result<HashSet<String>, BrokerError> {
        let mut ids: HashSet<String> = HashSet::new();
        ids.extend(self.store.list_range(keys::PRIMARY_QUEUE, 0, -1).await?);
        ids.extend(self.store.list_range(keys::RETRY_QUEUE, 0, -1).await?);
        ids.extend(self.store.zset_members(keys::SCHEDULED_SET).await?);
        ids.extend(self.store.list_range(keys::DLQ_LIST, 0, -1).await?);
        Ok(ids)
    }

    /// 把孤儿任务直接推回重试队列
    ///
    /// 任务已处于PENDING却不在任何队列中，只需恢复队列成员资格，
    /// 不涉及状态与计数器变更
    pub async fn push_to_retry(&self, task_id: &str) -> Result<(), BrokerError> {
        self.store
            .list_push_left(keys::RETRY_QUEUE, task_id)
            .await?;
        self.bus
            .publish_task_event(
                EventKind::TaskStateChanged,
                task_id,
                Some(TaskState::Pending),
                Some(TaskState::Pending),
            )
            .await;
        Ok(())
    }
}
