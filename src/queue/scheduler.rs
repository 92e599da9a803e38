// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 延迟任务提升调度器
//!
//! 周期性地把到期的延迟重试任务从有序集合搬到重试队列。
//! 提升走CAS脚本，重复执行幂等，因此无需选主，每个工作器都可运行。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::settings::SchedulerSettings;
use crate::queue::repository::{PromotionOutcome, TaskRepository};

/// 任务调度器
pub struct Scheduler {
    repository: Arc<TaskRepository>,
    tick: Duration,
    batch: usize,
}

impl Scheduler {
    /// 创建调度器
    ///
    /// # 参数
    ///
    /// * `repository` - 任务仓库
    /// * `settings` - 调度配置
    pub fn new(repository: Arc<TaskRepository>, settings: &SchedulerSettings) -> Self {
        Self {
            repository,
            tick: Duration::from_secs(settings.tick.max(1)),
            batch: settings.batch,
        }
    }

    /// 执行一轮提升
    ///
    /// # 返回值
    ///
    /// 本轮成功提升的任务数
    pub async fn run_once(&self) -> usize {
        let due = match self
            .repository
            .due_scheduled(Utc::now(), self.batch)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to read due scheduled tasks: {}", e);
                return 0;
            }
        };

        let mut promoted = 0usize;
        for task_id in due {
            match self.repository.promote_scheduled(&task_id).await {
                Ok(PromotionOutcome::Promoted) => promoted += 1,
                Ok(PromotionOutcome::Skipped(state)) => {
                    // 另一个工作器赢得了这次提升，或任务已被手动处理
                    debug!("Skipped promotion of {} (state {})", task_id, state);
                }
                Ok(PromotionOutcome::Gone) => {
                    debug!("Scheduled entry {} no longer has a record", task_id);
                }
                Err(e) => {
                    error!("Failed to promote scheduled task {}: {}", task_id, e);
                }
            }
        }
        promoted
    }

    /// 启动后台提升任务
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let promoted = self.run_once().await;
                        if promoted > 0 {
                            info!("Promoted {} scheduled tasks to retry queue", promoted);
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Scheduler stopped");
                        break;
                    }
                }
            }
        })
    }
}
