// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 事件消息模型
//!
//! `queue-updates` 频道上发布的自描述消息。时间戳统一为UTC ISO-8601。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// 任务创建
    TaskCreated,
    /// 任务状态变更
    TaskStateChanged,
    /// 队列快照（周期性，供重连订阅者收敛）
    QueueSnapshot,
    /// 心跳
    Heartbeat,
    /// 致命事件
    Fatal,
}

/// 队列深度快照
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueDepths {
    /// 主队列深度
    pub primary: u64,
    /// 重试队列深度
    pub retry: u64,
    /// 延迟集合大小
    pub scheduled: u64,
    /// 死信队列深度
    pub dlq: u64,
}

/// 队列事件
///
/// 每次状态转换与每个影响队列深度的操作都会发布一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// 事件类型
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// 相关任务ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// 变更前状态
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<String>,
    /// 变更后状态
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<String>,
    /// 当前队列深度
    pub queue_depths: QueueDepths,
    /// 当前各状态任务计数
    pub state_counts: HashMap<String, i64>,
    /// 当前自适应重试消费比例
    pub retry_ratio: f64,
    /// 事件时间
    pub timestamp: DateTime<Utc>,
}

/// 工作器控制指令
///
/// 入口层通过 `worker:control` 频道广播，由每个工作器的控制监听任务消费
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum ControlCommand {
    /// 复位所有熔断器到CLOSED
    ResetCircuits,
    /// 强制打开所有熔断器
    OpenCircuits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_snake_case_type() {
        let event = QueueEvent {
            kind: EventKind::TaskStateChanged,
            task_id: Some("t1".into()),
            old_state: Some("PENDING".into()),
            new_state: Some("ACTIVE".into()),
            queue_depths: QueueDepths::default(),
            state_counts: HashMap::new(),
            retry_ratio: 0.3,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_state_changed");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["old_state"], "PENDING");
        assert_eq!(json["new_state"], "ACTIVE");
        assert!(json["queue_depths"]["primary"].is_number());
    }

    #[test]
    fn test_snapshot_omits_task_fields() {
        let event = QueueEvent {
            kind: EventKind::QueueSnapshot,
            task_id: None,
            old_state: None,
            new_state: None,
            queue_depths: QueueDepths::default(),
            state_counts: HashMap::new(),
            retry_ratio: 0.3,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "queue_snapshot");
        assert!(json.get("task_id").is_none());
    }

    #[test]
    fn test_control_command_round_trip() {
        let json = serde_json::to_string(&ControlCommand::ResetCircuits).unwrap();
        assert_eq!(json, r#"{"command":"reset_circuits"}"#);
        let parsed: ControlCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ControlCommand::ResetCircuits);
    }
}
