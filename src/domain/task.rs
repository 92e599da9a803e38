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

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// 任务状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// 等待派发
    #[default]
    Pending,
    /// 执行中
    Active,
    /// 已完成
    Completed,
    /// 已失败
    Failed,
    /// 延迟重试中
    Scheduled,
    /// 死信（终态）
    Dlq,
}

impl TaskState {
    /// 所有状态，用于计数器遍历
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Active,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Scheduled,
        TaskState::Dlq,
    ];

    /// 计数器键使用的小写形式
    pub fn as_lower(&self) -> String {
        self.to_string().to_lowercase()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "PENDING"),
            TaskState::Active => write!(f, "ACTIVE"),
            TaskState::Completed => write!(f, "COMPLETED"),
            TaskState::Failed => write!(f, "FAILED"),
            TaskState::Scheduled => write!(f, "SCHEDULED"),
            TaskState::Dlq => write!(f, "DLQ"),
        }
    }
}

impl FromStr for TaskState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "ACTIVE" => Ok(TaskState::Active),
            "COMPLETED" => Ok(TaskState::Completed),
            "FAILED" => Ok(TaskState::Failed),
            "SCHEDULED" => Ok(TaskState::Scheduled),
            "DLQ" => Ok(TaskState::Dlq),
            _ => Err(()),
        }
    }
}

/// 状态历史条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    /// 进入的状态
    pub state: String,
    /// 进入时间
    pub timestamp: String,
}

/// 错误历史条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHistoryEntry {
    /// 错误分类标识
    pub error_type: String,
    /// 错误消息
    pub message: String,
    /// 发生时间
    pub timestamp: String,
}

/// 任务记录解析错误
#[derive(Error, Debug)]
pub enum TaskRecordError {
    /// 缺失必要字段
    #[error("Task record missing field '{0}'")]
    MissingField(&'static str),

    /// 字段格式无效
    #[error("Task record field '{field}' is invalid: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// 任务实体
///
/// 代理中一个待处理的工作单元。载荷对核心不透明，由`task_type`选择处理器。
/// 持久化为 `task:{id}` 哈希，历史字段以JSON数组存储。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 任务唯一标识符
    pub task_id: String,
    /// 任务类型，路由到处理器
    pub task_type: String,
    /// 不透明载荷
    pub payload: String,
    /// 当前状态
    pub state: TaskState,
    /// 已重试次数
    pub retry_count: u32,
    /// 最大重试次数
    pub max_retries: u32,
    /// 最近一次错误消息
    pub last_error: Option<String>,
    /// 最近一次错误分类
    pub error_type: Option<String>,
    /// 下次重试时间（仅SCHEDULED状态）
    pub retry_after: Option<DateTime<Utc>>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
    /// 完成时间
    pub completed_at: Option<DateTime<Utc>>,
    /// 处理结果（仅COMPLETED状态）
    pub result: Option<String>,
    /// 状态变迁历史
    pub state_history: Vec<StateHistoryEntry>,
    /// 错误历史
    pub error_history: Vec<ErrorHistoryEntry>,
}

/// 格式化UTC时间为持久化使用的ISO-8601字符串
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(field: &'static str, value: &str) -> Result<DateTime<Utc>, TaskRecordError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TaskRecordError::InvalidField {
            field,
            value: value.to_string(),
        })
}

fn parse_optional_ts(
    field: &'static str,
    value: Option<&String>,
) -> Result<Option<DateTime<Utc>>, TaskRecordError> {
    match value {
        Some(v) if !v.is_empty() => Ok(Some(parse_ts(field, v)?)),
        _ => Ok(None),
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

impl Task {
    /// 创建一个新任务
    ///
    /// # 参数
    ///
    /// * `task_type` - 任务类型
    /// * `payload` - 不透明载荷
    /// * `max_retries` - 最大重试次数
    ///
    /// # 返回值
    ///
    /// 返回PENDING状态的新任务，ID为随机UUID
    pub fn new(task_type: impl Into<String>, payload: impl Into<String>, max_retries: u32) -> Self {
        Self::with_id(
            Uuid::new_v4().to_string(),
            task_type,
            payload,
            max_retries,
        )
    }

    /// 用指定ID创建任务
    ///
    /// 客户端自带ID时用于幂等提交
    pub fn with_id(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload: payload.into(),
            state: TaskState::Pending,
            retry_count: 0,
            max_retries,
            last_error: None,
            error_type: None,
            retry_after: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            state_history: Vec::new(),
            error_history: Vec::new(),
        }
    }

    /// 任务当前年龄
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// 序列化为创建脚本使用的哈希字段
    ///
    /// 状态历史由脚本初始化，不在此列
    pub fn to_create_fields(&self) -> Vec<(String, String)> {
        vec![
            ("task_id".into(), self.task_id.clone()),
            ("task_type".into(), self.task_type.clone()),
            ("payload".into(), self.payload.clone()),
            ("state".into(), TaskState::Pending.to_string()),
            ("retry_count".into(), "0".into()),
            ("max_retries".into(), self.max_retries.to_string()),
            ("last_error".into(), String::new()),
            ("error_type".into(), String::new()),
            ("retry_after".into(), String::new()),
            ("created_at".into(), format_ts(self.created_at)),
            ("updated_at".into(), format_ts(self.updated_at)),
            ("completed_at".into(), String::new()),
            ("result".into(), String::new()),
            ("error_history".into(), "[]".into()),
        ]
    }

    /// 从存储哈希解析任务记录
    ///
    /// # 参数
    ///
    /// * `fields` - `HGETALL task:{id}` 的结果
    ///
    /// # 返回值
    ///
    /// * `Ok(Task)` - 解析成功
    /// * `Err(TaskRecordError)` - 记录损坏或字段缺失
    pub fn from_hash(fields: &HashMap<String, String>) -> Result<Self, TaskRecordError> {
        let task_id = fields
            .get("task_id")
            .filter(|v| !v.is_empty())
            .ok_or(TaskRecordError::MissingField("task_id"))?
            .clone();
        let task_type = fields
            .get("task_type")
            .ok_or(TaskRecordError::MissingField("task_type"))?
            .clone();
        let state_raw = fields
            .get("state")
            .ok_or(TaskRecordError::MissingField("state"))?;
        let state = TaskState::from_str(state_raw).map_err(|_| TaskRecordError::InvalidField {
            field: "state",
            value: state_raw.clone(),
        })?;

        let retry_count = fields
            .get("retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let max_retries = fields
            .get("max_retries")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let created_at_raw = fields
            .get("created_at")
            .ok_or(TaskRecordError::MissingField("created_at"))?;
        let created_at = parse_ts("created_at", created_at_raw)?;
        let updated_at = fields
            .get("updated_at")
            .map(|v| parse_ts("updated_at", v))
            .transpose()?
            .unwrap_or(created_at);

        let state_history = fields
            .get("state_history")
            .filter(|v| !v.is_empty())
            .map(|v| serde_json::from_str(v))
            .transpose()
            .map_err(|e| TaskRecordError::InvalidField {
                field: "state_history",
                value: e.to_string(),
            })?
            .unwrap_or_default();
        let error_history = fields
            .get("error_history")
            .filter(|v| !v.is_empty())
            .map(|v| serde_json::from_str(v))
            .transpose()
            .map_err(|e| TaskRecordError::InvalidField {
                field: "error_history",
                value: e.to_string(),
            })?
            .unwrap_or_default();

        Ok(Self {
            task_id,
            task_type,
            payload: fields.get("payload").cloned().unwrap_or_default(),
            state,
            retry_count,
            max_retries,
            last_error: non_empty(fields.get("last_error")),
            error_type: non_empty(fields.get("error_type")),
            retry_after: parse_optional_ts("retry_after", fields.get("retry_after"))?,
            created_at,
            updated_at,
            completed_at: parse_optional_ts("completed_at", fields.get("completed_at"))?,
            result: non_empty(fields.get("result")),
            state_history,
            error_history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> HashMap<String, String> {
        let task = Task::new("echo", "hello", 3);
        let mut map: HashMap<String, String> = task.to_create_fields().into_iter().collect();
        map.insert(
            "state_history".into(),
            format!(
                r#"[{{"state":"PENDING","timestamp":"{}"}}]"#,
                format_ts(task.created_at)
            ),
        );
        map
    }

    #[test]
    fn test_state_display_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::from_str(&state.to_string()), Ok(state));
        }
        assert_eq!(TaskState::Dlq.to_string(), "DLQ");
        assert_eq!(TaskState::Dlq.as_lower(), "dlq");
    }

    #[test]
    fn test_from_hash_round_trip() {
        let map = sample_hash();
        let task = Task::from_hash(&map).unwrap();
        assert_eq!(task.task_type, "echo");
        assert_eq!(task.payload, "hello");
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert!(task.last_error.is_none());
        assert!(task.retry_after.is_none());
        assert!(task.completed_at.is_none());
        assert_eq!(task.state_history.len(), 1);
        assert_eq!(task.state_history[0].state, "PENDING");
    }

    #[test]
    fn test_from_hash_rejects_missing_state() {
        let mut map = sample_hash();
        map.remove("state");
        assert!(matches!(
            Task::from_hash(&map),
            Err(TaskRecordError::MissingField("state"))
        ));
    }

    #[test]
    fn test_from_hash_rejects_unknown_state() {
        let mut map = sample_hash();
        map.insert("state".into(), "RUNNING".into());
        assert!(matches!(
            Task::from_hash(&map),
            Err(TaskRecordError::InvalidField { field: "state", .. })
        ));
    }

    #[test]
    fn test_empty_optionals_parse_as_none() {
        let mut map = sample_hash();
        map.insert("retry_after".into(), String::new());
        map.insert("result".into(), String::new());
        let task = Task::from_hash(&map).unwrap();
        assert!(task.retry_after.is_none());
        assert!(task.result.is_none());
    }

    #[test]
    fn test_age() {
        let mut task = Task::new("echo", "x", 3);
        task.created_at = Utc::now() - chrono::Duration::seconds(90);
        assert!(task.age(Utc::now()).num_seconds() >= 90);
    }
}
