// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 事件总线
//!
//! 每次状态转换与队列深度变化都在 `queue-updates` 频道发布一条消息，
//! 周期性地再发布一次带全量快照的消息供重连订阅者收敛。投递是尽力而为的：
//! 发布失败只记录告警，掉线的订阅者会错过消息。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::settings::Settings;
use crate::domain::event::{ControlCommand, EventKind, QueueDepths, QueueEvent};
use crate::domain::task::TaskState;
use crate::infrastructure::redis::client::{RedisStore, StoreError};
use crate::infrastructure::redis::keys;
use crate::queue::retry::adaptive_retry_ratio;

/// 事件总线
pub struct EventBus {
    store: Arc<RedisStore>,
    ratio_warn: u64,
    ratio_crit: u64,
    snapshot_interval: Duration,
}

impl EventBus {
    /// 创建事件总线
    pub fn new(store: Arc<RedisStore>, settings: &Settings) -> Self {
        Self {
            store,
            ratio_warn: settings.retry.ratio_thresholds.warn,
            ratio_crit: settings.retry.ratio_thresholds.crit,
            snapshot_interval: Duration::from_secs(settings.events.snapshot_interval),
        }
    }

    /// 采集当前队列深度、状态计数与自适应重试比例
    pub async fn snapshot(
        &self,
    ) -> Result<(QueueDepths, HashMap<String, i64>, f64), StoreError> {
        let depths = QueueDepths {
            primary: self.store.list_len(keys::PRIMARY_QUEUE).await?,
            retry: self.store.list_len(keys::RETRY_QUEUE).await?,
            scheduled: self.store.zset_len(keys::SCHEDULED_SET).await?,
            dlq: self.store.list_len(keys::DLQ_LIST).await?,
        };

        let mut counts = HashMap::new();
        for state in TaskState::ALL {
            let value = self
                .store
                .counter_get(&keys::state_counter(&state.to_string()))
                .await?;
            counts.insert(state.as_lower(), value);
        }

        let ratio = adaptive_retry_ratio(depths.retry, self.ratio_warn, self.ratio_crit);
        Ok((depths, counts, ratio))
    }

    /// 发布任务事件（尽力而为）
    ///
    /// # 参数
    ///
    /// * `kind` - 事件类型
    /// * `task_id` - 相关任务
    /// * `old_state` / `new_state` - 转换前后状态
    pub async fn publish_task_event(
        &self,
        kind: EventKind,
        task_id: &str,
        old_state: Option<TaskState>,
        new_state: Option<TaskState>,
    ) {
        let (depths, counts, ratio) = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to gather queue snapshot for event: {}", e);
                return;
            }
        };

        let event = QueueEvent {
            kind,
            task_id: Some(task_id.to_string()),
            old_state: old_state.map(|s| s.to_string()),
            new_state: new_state.map(|s| s.to_string()),
            queue_depths: depths,
            state_counts: counts,
            retry_ratio: ratio,
            timestamp: Utc::now(),
        };
        self.publish(&event).await;
    }

    /// 发布全量快照事件
    pub async fn publish_snapshot(&self, kind: EventKind) {
        let (depths, counts, ratio) = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to gather queue snapshot: {}", e);
                return;
            }
        };

        let event = QueueEvent {
            kind,
            task_id: None,
            old_state: None,
            new_state: None,
            queue_depths: depths,
            state_counts: counts,
            retry_ratio: ratio,
            timestamp: Utc::now(),
        };
        self.publish(&event).await;
    }

    async fn publish(&self, event: &QueueEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize queue event: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.publish(keys::EVENTS_CHANNEL, &payload).await {
            warn!("Failed to publish queue event: {}", e);
        }
    }

    /// 启动周期性心跳快照任务
    pub fn spawn_snapshot_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bus.snapshot_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => bus.publish_snapshot(EventKind::Heartbeat).await,
                    _ = shutdown.changed() => {
                        debug!("Snapshot task stopped");
                        break;
                    }
                }
            }
        })
    }

    /// 订阅事件流
    pub async fn subscribe(&self) -> Result<EventSubscriber, StoreError> {
        let pubsub = self.store.subscriber(keys::EVENTS_CHANNEL).await?;
        Ok(EventSubscriber { pubsub })
    }

    /// 广播工作器控制指令
    pub async fn publish_control(&self, command: ControlCommand) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&command)?;
        self.store.publish(keys::CONTROL_CHANNEL, &payload).await
    }

    /// 订阅控制指令流
    pub async fn subscribe_control(&self) -> Result<ControlSubscriber, StoreError> {
        let pubsub = self.store.subscriber(keys::CONTROL_CHANNEL).await?;
        Ok(ControlSubscriber { pubsub })
    }
}

/// 事件订阅者
///
/// 无法解析的消息被丢弃并告警，不中断流
pub struct EventSubscriber {
    pubsub: redis::aio::PubSub,
}

impl EventSubscriber {
    /// 等待下一条事件，连接关闭返回None
    pub async fn next_event(&mut self) -> Option<QueueEvent> {
        loop {
            let mut stream = self.pubsub.on_message();
            let message = stream.next().await?;
            drop(stream);
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to read event payload: {}", e);
                    continue;
                }
            };
            match serde_json::from_str(&payload) {
                Ok(event) => return Some(event),
                Err(e) => {
                    warn!("Discarding malformed queue event: {}", e);
                    continue;
                }
            }
        }
    }
}

/// 控制指令订阅者
pub struct ControlSubscriber {
    pubsub: redis::aio::PubSub,
}

impl ControlSubscriber {
    /// 等待下一条控制指令，连接关闭返回None
    pub async fn next_command(&mut self) -> Option<ControlCommand> {
        loop {
            let mut stream = self.pubsub.on_message();
            let message = stream.next().await?;
            drop(stream);
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to read control payload: {}", e);
                    continue;
                }
            };
            match serde_json::from_str(&payload) {
                Ok(command) => return Some(command),
                Err(e) => {
                    warn!("Discarding malformed control command: {}", e);
                    continue;
                }
            }
        }
    }
}
