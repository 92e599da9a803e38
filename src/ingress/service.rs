// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 入口契约
//!
//! HTTP协作方调用的库接口：提交、查询、列表、重试、删除、孤儿回收、
//! 队列状态、死信列表与熔断器控制广播。所有错误都是带稳定错误码的
//! `BrokerError`。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::settings::Settings;
use crate::domain::error::BrokerError;
use crate::domain::event::{ControlCommand, QueueDepths};
use crate::domain::task::{Task, TaskState};
use crate::events::bus::EventBus;
use crate::handlers::registry::HandlerRegistry;
use crate::infrastructure::redis::client::RedisStore;
use crate::queue::repository::TaskRepository;
use crate::workers::heartbeat::{self, LivenessSummary};

/// 列表排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// 创建时间降序（默认）
    #[default]
    CreatedAtDesc,
    /// 创建时间升序
    CreatedAtAsc,
}

/// 任务列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct TaskListFilter {
    /// 按状态过滤
    pub state: Option<TaskState>,
    /// 按任务类型过滤
    pub task_type: Option<String>,
    /// 页码（1起）
    pub page: usize,
    /// 每页条数（1-100）
    pub page_size: usize,
    /// 排序
    pub sort: SortOrder,
}

/// 分页任务列表
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    /// 本页任务
    pub tasks: Vec<Task>,
    /// 过滤后总数
    pub total: usize,
    /// 页码
    pub page: usize,
    /// 每页条数
    pub page_size: usize,
}

/// 队列状态视图
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusView {
    /// 各队列深度
    pub queues: QueueDepths,
    /// 各状态任务计数
    pub states: HashMap<String, i64>,
    /// 当前自适应重试消费比例
    pub retry_ratio: f64,
}

/// 孤儿回收报告
#[derive(Debug, Clone, Serialize)]
pub struct RequeueReport {
    /// 发现的孤儿任务数
    pub found: usize,
    /// 成功回收数
    pub requeued: usize,
}

/// 过滤、排序并分页（内存中；记录规模由外层扫描决定）
fn sort_and_page(mut tasks: Vec<Task>, filter: &TaskListFilter) -> TaskPage {
    if let Some(state) = filter.state {
        tasks.retain(|t| t.state == state);
    }
    if let Some(task_type) = &filter.task_type {
        tasks.retain(|t| &t.task_type == task_type);
    }
    match filter.sort {
        SortOrder::CreatedAtDesc => {
            tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at))
        }
        SortOrder::CreatedAtAsc => tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
    }

    let total = tasks.len();
    let page = filter.page.max(1);
    let page_size = filter.page_size.clamp(1, 100);
    let start = (page - 1).saturating_mul(page_size);
    let tasks = if start >= total {
        Vec::new()
    } else {
        tasks[start..(start + page_size).min(total)].to_vec()
    };

    TaskPage {
        tasks,
        total,
        page,
        page_size,
    }
}

/// 入口服务
pub struct Ingress {
    repo: Arc<TaskRepository>,
    bus: Arc<EventBus>,
    store: Arc<RedisStore>,
    registry: Arc<HandlerRegistry>,
    default_max_retries: u32,
    heartbeat_period: u64,
    heartbeat_ttl_factor: u64,
}

impl Ingress {
    /// 创建入口服务
    pub fn new(
        repo: Arc<TaskRepository>,
        bus: Arc<EventBus>,
        store: Arc<RedisStore>,
        registry: Arc<HandlerRegistry>,
        settings: &Settings,
    ) -> Self {
        Self {
            repo,
            bus,
            store,
            registry,
            default_max_retries: settings.retry.max_retries,
            heartbeat_period: settings.heartbeat.period,
            heartbeat_ttl_factor: settings.heartbeat.ttl_factor,
        }
    }

    /// 提交任务
    ///
    /// # 参数
    ///
    /// * `task_type` - 任务类型，必须已注册处理器
    /// * `payload` - 不透明载荷
    /// * `max_retries` - 重试上限，缺省取配置值
    /// * `task_id` - 客户端自带ID，提供时按此ID幂等
    ///
    /// # 返回值
    ///
    /// * `Ok(String)` - 任务ID
    /// * `Err(BrokerError::Validation)` - 类型未注册或载荷为空
    /// * `Err(BrokerError::AlreadyExists)` - 同ID任务已存在
    pub async fn submit(
        &self,
        task_type: &str,
        payload: &str,
        max_retries: Option<u32>,
        task_id: Option<String>,
    ) -> Result<String, BrokerError> {
        if payload.is_empty() {
            return Err(BrokerError::Validation("payload must not be empty".into()));
        }
        if !self.registry.contains(task_type) {
            return Err(BrokerError::Validation(format!(
                "no handler registered for task type '{}'",
                task_type
            )));
        }
        if let Some(id) = &task_id {
            if id.trim().is_empty() {
                return Err(BrokerError::Validation("task_id must not be blank".into()));
            }
        }

        let retries = max_retries.unwrap_or(self.default_max_retries);
        let task = match task_id {
            Some(id) => Task::with_id(id, task_type, payload, retries),
            None => Task::new(task_type, payload, retries),
        };
        self.repo.create(&task).await?;
        info!("Submitted task {} (type {})", task.task_id, task_type);
        Ok(task.task_id)
    }

    /// 查询任务
    pub async fn get(&self, task_id: &str) -> Result<Task, BrokerError> {
        self.repo.get(task_id).await?.ok_or(BrokerError::NotFound)
    }

    /// 列表查询
    ///
    /// 全量扫描任务记录后在内存中过滤分页，适合管理面板量级的使用
    pub async fn list(&self, filter: &TaskListFilter) -> Result<TaskPage, BrokerError> {
        let keys = self.repo.scan_task_keys().await?;
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(task_id) = key.strip_prefix("task:") else {
                continue;
            };
            match self.repo.get(task_id).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable task record {}: {}", key, e),
            }
        }
        Ok(sort_and_page(tasks, filter))
    }

    /// 手动重试FAILED/DLQ任务
    ///
    /// 重试计数归零，任务进入重试队列。已排队的任务重复重试返回Conflict，
    /// 状态与队列均不变。
    pub async fn retry(&self, task_id: &str) -> Result<(), BrokerError> {
        self.repo.manual_retry(task_id).await
    }

    /// 删除任务及其全部痕迹
    pub async fn delete(&self, task_id: &str) -> Result<(), BrokerError> {
        self.repo.delete(task_id).await
    }

    /// 回收孤儿任务
    ///
    /// PENDING状态却不在任何队列中的记录（崩溃于弹出与激活之间留下）
    /// 被推回重试队列
    pub async fn requeue_orphaned(&self) -> Result<RequeueReport, BrokerError> {
        let queued = self.repo.queued_ids().await?;
        let keys = self.repo.scan_task_keys().await?;

        let mut found = 0usize;
        let mut requeued = 0usize;
        for key in keys {
            let Some(task_id) = key.strip_prefix("task:") else {
                continue;
            };
            let task = match self.repo.get(task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable task record {}: {}", key, e);
                    continue;
                }
            };
            if task.state != TaskState::Pending || queued.contains(task_id) {
                continue;
            }
            found += 1;
            match self.repo.push_to_retry(task_id).await {
                Ok(()) => requeued += 1,
                Err(e) => warn!("Failed to requeue orphaned task {}: {}", task_id, e),
            }
        }
        if found > 0 {
            info!("Requeued {}/{} orphaned tasks", requeued, found);
        }
        Ok(RequeueReport { found, requeued })
    }

    /// 队列状态
    pub async fn queue_status(&self) -> Result<QueueStatusView, BrokerError> {
        let (queues, states, retry_ratio) = self.bus.snapshot().await?;
        Ok(QueueStatusView {
            queues,
            states,
            retry_ratio,
        })
    }

    /// 死信队列任务列表
    ///
    /// 优先返回死信副本，副本缺失时回退常规记录
    pub async fn dlq_list(&self, limit: usize) -> Result<Vec<Task>, BrokerError> {
        let ids = self.repo.dlq_ids(limit.clamp(1, 1000)).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.repo.get_dlq_record(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// 广播复位所有工作器的熔断器
    pub async fn reset_all_circuits(&self) -> Result<(), BrokerError> {
        self.bus
            .publish_control(ControlCommand::ResetCircuits)
            .await?;
        Ok(())
    }

    /// 广播强开所有工作器的熔断器
    pub async fn open_all_circuits(&self) -> Result<(), BrokerError> {
        self.bus
            .publish_control(ControlCommand::OpenCircuits)
            .await?;
        Ok(())
    }

    /// 工作器存活汇总
    pub async fn worker_liveness(&self) -> Result<LivenessSummary, BrokerError> {
        heartbeat::liveness_summary(
            &self.store,
            self.heartbeat_period,
            self.heartbeat_ttl_factor,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task_at(id: &str, task_type: &str, state: TaskState, age_secs: i64) -> Task {
        let mut task = Task::with_id(id, task_type, "payload", 3);
        task.state = state;
        task.created_at = chrono::Utc::now() - Duration::seconds(age_secs);
        task
    }

    fn sample_tasks() -> Vec<Task> {
        vec![
            task_at("a", "echo", TaskState::Pending, 30),
            task_at("b", "echo", TaskState::Completed, 20),
            task_at("c", "summarize", TaskState::Completed, 10),
            task_at("d", "echo", TaskState::Dlq, 5),
        ]
    }

    #[test]
    fn test_filter_by_state() {
        let filter = TaskListFilter {
            state: Some(TaskState::Completed),
            page: 1,
            page_size: 20,
            ..Default::default()
        };
        let page = sort_and_page(sample_tasks(), &filter);
        assert_eq!(page.total, 2);
        assert!(page.tasks.iter().all(|t| t.state == TaskState::Completed));
    }

    #[test]
    fn test_filter_by_type() {
        let filter = TaskListFilter {
            task_type: Some("summarize".into()),
            page: 1,
            page_size: 20,
            ..Default::default()
        };
        let page = sort_and_page(sample_tasks(), &filter);
        assert_eq!(page.total, 1);
        assert_eq!(page.tasks[0].task_id, "c");
    }

    #[test]
    fn test_sort_desc_is_newest_first() {
        let filter = TaskListFilter {
            page: 1,
            page_size: 20,
            ..Default::default()
        };
        let page = sort_and_page(sample_tasks(), &filter);
        assert_eq!(page.tasks[0].task_id, "d");
        assert_eq!(page.tasks[3].task_id, "a");
    }

    #[test]
    fn test_sort_asc_is_oldest_first() {
        let filter = TaskListFilter {
            page: 1,
            page_size: 20,
            sort: SortOrder::CreatedAtAsc,
            ..Default::default()
        };
        let page = sort_and_page(sample_tasks(), &filter);
        assert_eq!(page.tasks[0].task_id, "a");
    }

    #[test]
    fn test_pagination_bounds() {
        let filter = TaskListFilter {
            page: 2,
            page_size: 3,
            ..Default::default()
        };
        let page = sort_and_page(sample_tasks(), &filter);
        assert_eq!(page.total, 4);
        assert_eq!(page.tasks.len(), 1);

        let filter = TaskListFilter {
            page: 9,
            page_size: 3,
            ..Default::default()
        };
        let page = sort_and_page(sample_tasks(), &filter);
        assert!(page.tasks.is_empty());
        assert_eq!(page.total, 4);
    }

    #[test]
    fn test_page_size_is_clamped() {
        let filter = TaskListFilter {
            page: 1,
            page_size: 0,
            ..Default::default()
        };
        let page = sort_and_page(sample_tasks(), &filter);
        assert_eq!(page.page_size, 1);
        assert_eq!(page.tasks.len(), 1);
    }
}
