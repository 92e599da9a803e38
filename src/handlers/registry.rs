// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 处理器注册表
//!
//! `task_type` 到处理器实现的插件表。处理器契约：载荷对核心不透明，
//! 投递语义为至少一次，处理器必须对同一 `task_id` 幂等。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::error::{ErrorClass, PermanentKind, TransientKind};
use crate::handlers::context::HandlerContext;

/// 处理器错误
///
/// 携带分类标签、人读消息、可重试性建议（仅供参考，路由器有最终决定权）
/// 与可选的上游状态码
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct HandlerError {
    /// 失败分类
    pub class: ErrorClass,
    /// 错误消息
    pub message: String,
    /// 可重试性建议
    pub retryable: Option<bool>,
    /// 上游HTTP状态码
    pub status: Option<u16>,
}

impl HandlerError {
    /// 构造瞬时错误
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient(kind),
            message: message.into(),
            retryable: Some(true),
            status: None,
        }
    }

    /// 构造永久错误
    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent(kind),
            message: message.into(),
            retryable: Some(false),
            status: None,
        }
    }

    /// 构造内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Internal,
            message: message.into(),
            retryable: Some(false),
            status: None,
        }
    }

    /// 附加上游状态码
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// 任务处理器契约
///
/// 实现必须满足：
/// - 对同一 `task_id` 幂等（至少一次投递）
/// - 响应 `ctx` 的协作式取消信号
/// - 上游调用走 `ctx.call_provider` 以获得熔断与限流保护
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 处理任务载荷
    ///
    /// # 参数
    ///
    /// * `payload` - 不透明载荷
    /// * `ctx` - 执行上下文
    ///
    /// # 返回值
    ///
    /// * `Ok(String)` - 不透明结果，写入任务记录
    /// * `Err(HandlerError)` - 分类后的失败
    async fn handle(&self, payload: &str, ctx: &HandlerContext) -> Result<String, HandlerError>;
}

/// 处理器注册表
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器
    ///
    /// 同名重复注册时后注册者生效
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    /// 按任务类型查找处理器
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// 是否注册了指定类型
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// 已注册的任务类型
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}
