// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 错误分类体系
//!
//! `BrokerError` 是入口层可见的稳定错误集；`ErrorClass` 是重试路由使用的
//! 失败分类，其 `tag()` 形式会持久化到任务记录的 `error_type` 字段，
//! 属于对外兼容面，不可改动。

use thiserror::Error;

use crate::infrastructure::redis::client::StoreError;

/// 代理错误类型
///
/// 入口调用方收到的结构化错误，`code()` 给出稳定标识
#[derive(Error, Debug)]
pub enum BrokerError {
    /// 任务不存在
    #[error("Task not found")]
    NotFound,

    /// 状态冲突（CAS观察到的状态与期望不符）
    #[error("State conflict: expected {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    /// 任务已存在
    #[error("Task already exists")]
    AlreadyExists,

    /// 参数校验失败
    #[error("Validation error: {0}")]
    Validation(String),

    /// 限流令牌等待超时
    #[error("Rate limit acquire timed out")]
    RateLimitTimeout,

    /// 熔断器打开
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// 依赖缺失（处理器未注册等）
    #[error("Dependency missing: {0}")]
    DependencyMissing(String),

    /// 存储错误
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// 稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::NotFound => "NotFound",
            BrokerError::Conflict { .. } => "Conflict",
            BrokerError::AlreadyExists => "AlreadyExists",
            BrokerError::Validation(_) => "ValidationError",
            BrokerError::RateLimitTimeout => "RateLimitTimeout",
            BrokerError::CircuitOpen => "CircuitOpen",
            BrokerError::DependencyMissing(_) => "DependencyMissing",
            BrokerError::Store(_) | BrokerError::Internal(_) => "Internal",
        }
    }
}

/// 永久失败子类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// 载荷/参数不合法
    Validation,
    /// 上游鉴权失败（401）
    Auth,
    /// 上游拒绝或资源不存在（403/404）
    Forbidden,
    /// 内容策略违规
    ContentPolicy,
    /// 依赖缺失（外部工具、处理器未注册）
    Dependency,
}

impl PermanentKind {
    fn as_str(&self) -> &'static str {
        match self {
            PermanentKind::Validation => "Validation",
            PermanentKind::Auth => "Auth",
            PermanentKind::Forbidden => "Forbidden",
            PermanentKind::ContentPolicy => "ContentPolicy",
            PermanentKind::Dependency => "Dependency",
        }
    }
}

/// 瞬时失败子类，决定退避调度表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// 上游限流（429）
    RateLimit,
    /// 上游5xx
    ServiceUnavailable,
    /// 额度耗尽（402）
    Credits,
    /// 网络超时/连接重置
    Network,
    /// 本地熔断器打开，不计入重试次数
    CircuitOpen,
    /// 任务执行超出硬截止
    Timeout,
    /// 其他未知瞬时错误
    Default,
}

impl TransientKind {
    fn as_str(&self) -> &'static str {
        match self {
            TransientKind::RateLimit => "RateLimit",
            TransientKind::ServiceUnavailable => "ServiceUnavailable",
            TransientKind::Credits => "Credits",
            TransientKind::Network => "Network",
            TransientKind::CircuitOpen => "CircuitOpen",
            TransientKind::Timeout => "Timeout",
            TransientKind::Default => "Default",
        }
    }
}

/// 失败分类
///
/// 路由决策的输入：永久失败直接入死信，瞬时失败按子类调度表退避重试，
/// 内部错误入死信并上报
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 永久失败
    Permanent(PermanentKind),
    /// 瞬时失败
    Transient(TransientKind),
    /// 核心逻辑缺陷
    Internal,
}

impl ErrorClass {
    /// 持久化到 `error_type` 字段的稳定标识
    pub fn tag(&self) -> String {
        match self {
            ErrorClass::Permanent(kind) => format!("Permanent/{}", kind.as_str()),
            ErrorClass::Transient(kind) => format!("Transient/{}", kind.as_str()),
            ErrorClass::Internal => "Internal".to_string(),
        }
    }

    /// 是否允许重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(
            ErrorClass::Transient(TransientKind::RateLimit).tag(),
            "Transient/RateLimit"
        );
        assert_eq!(
            ErrorClass::Transient(TransientKind::CircuitOpen).tag(),
            "Transient/CircuitOpen"
        );
        assert_eq!(
            ErrorClass::Permanent(PermanentKind::ContentPolicy).tag(),
            "Permanent/ContentPolicy"
        );
        assert_eq!(ErrorClass::Internal.tag(), "Internal");
    }

    #[test]
    fn test_retryability() {
        assert!(ErrorClass::Transient(TransientKind::Network).is_retryable());
        assert!(!ErrorClass::Permanent(PermanentKind::Auth).is_retryable());
        assert!(!ErrorClass::Internal.is_retryable());
    }

    #[test]
    fn test_broker_error_codes() {
        assert_eq!(BrokerError::NotFound.code(), "NotFound");
        assert_eq!(
            BrokerError::Validation("bad".into()).code(),
            "ValidationError"
        );
        assert_eq!(BrokerError::Internal("x".into()).code(), "Internal");
    }
}
