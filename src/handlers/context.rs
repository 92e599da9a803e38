// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 处理器执行上下文
//!
//! 暴露给处理器的受控能力：协作式取消信号与上游调用包装。
//! `call_provider` 自动完成熔断试探、限流令牌获取与结果回报，
//! 处理器自身无需感知这些协调设施。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::domain::error::{BrokerError, ErrorClass, PermanentKind, TransientKind};
use crate::handlers::registry::HandlerError;
use crate::limiter::token_bucket::TokenBucketLimiter;
use crate::provider::state::{FailureKind, ProviderStateCache};
use crate::queue::retry::{classify_message, classify_status};
use crate::workers::circuit_breaker::CircuitBreaker;

/// 上游调用失败
///
/// 处理器内上游调用闭包的错误表示，由网关映射为 `HandlerError`
#[derive(Debug, Clone)]
pub struct ProviderCallError {
    /// 失败类别
    pub kind: FailureKind,
    /// 错误消息
    pub message: String,
    /// 上游HTTP状态码
    pub status: Option<u16>,
}

impl ProviderCallError {
    /// 构造失败
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// 附加状态码
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// 上游调用网关
///
/// 熔断与限流的统一执行点
#[derive(Clone)]
pub struct ProviderGateway {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<TokenBucketLimiter>,
    provider_state: Arc<ProviderStateCache>,
    token_wait: Duration,
}

impl ProviderGateway {
    /// 创建网关
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<TokenBucketLimiter>,
        provider_state: Arc<ProviderStateCache>,
        token_wait: Duration,
    ) -> Self {
        Self {
            breaker,
            limiter,
            provider_state,
            token_wait,
        }
    }

    async fn call<T, F, Fut>(
        &self,
        provider_used: &AtomicBool,
        operation: F,
    ) -> Result<T, HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderCallError>>,
    {
        if !self.breaker.try_acquire_probe() {
            return Err(HandlerError::transient(
                TransientKind::CircuitOpen,
                "circuit breaker is open",
            ));
        }

        match self.limiter.acquire(1, self.token_wait).await {
            Ok(()) => {}
            Err(BrokerError::RateLimitTimeout) => {
                return Err(HandlerError::transient(
                    TransientKind::RateLimit,
                    "rate limit token acquire timed out",
                ));
            }
            Err(e) => {
                return Err(HandlerError::internal(format!(
                    "rate limiter failure: {}",
                    e
                )));
            }
        }

        provider_used.store(true, Ordering::Relaxed);
        match operation().await {
            Ok(value) => {
                if let Err(e) = self.provider_state.report_success().await {
                    warn!("Failed to report provider success: {}", e);
                }
                Ok(value)
            }
            Err(call_err) => {
                if let Err(e) = self
                    .provider_state
                    .report_failure(call_err.kind, &call_err.message, call_err.status)
                    .await
                {
                    warn!("Failed to report provider failure: {}", e);
                }
                Err(map_call_error(call_err))
            }
        }
    }
}

/// 上游失败映射为处理器错误
fn map_call_error(err: ProviderCallError) -> HandlerError {
    let class = match err.kind {
        FailureKind::ApiKeyInvalid => ErrorClass::Permanent(PermanentKind::Auth),
        FailureKind::CreditsExhausted => ErrorClass::Transient(TransientKind::Credits),
        FailureKind::RateLimited => ErrorClass::Transient(TransientKind::RateLimit),
        FailureKind::ServiceUnavailable => {
            ErrorClass::Transient(TransientKind::ServiceUnavailable)
        }
        FailureKind::Timeout | FailureKind::NetworkError => {
            ErrorClass::Transient(TransientKind::Network)
        }
        FailureKind::Unknown => match err.status {
            Some(code) => classify_status(code),
            None => classify_message(&err.message),
        },
    };
    HandlerError {
        retryable: Some(class.is_retryable()),
        class,
        message: err.message,
        status: err.status,
    }
}

/// 处理器执行上下文
pub struct HandlerContext {
    task_id: String,
    cancel: watch::Receiver<bool>,
    provider_used: Arc<AtomicBool>,
    gateway: ProviderGateway,
}

impl HandlerContext {
    /// 创建上下文
    pub fn new(
        task_id: impl Into<String>,
        cancel: watch::Receiver<bool>,
        gateway: ProviderGateway,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            cancel,
            provider_used: Arc::new(AtomicBool::new(false)),
            gateway,
        }
    }

    /// 当前任务ID
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 是否已收到协作式取消信号（软截止已过）
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// 等待取消信号
    ///
    /// 处理器可在长操作中select本方法以及时让出
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 受保护的上游调用
    ///
    /// 自动消耗熔断试探名额、获取限流令牌并回报调用结果。
    /// 熔断打开或令牌等待超时时不执行 `operation`。
    pub async fn call_provider<T, F, Fut>(&self, operation: F) -> Result<T, HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderCallError>>,
    {
        self.gateway.call(&self.provider_used, operation).await
    }

    /// 本次执行是否发生过上游调用
    pub fn provider_was_used(&self) -> bool {
        self.provider_used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_call_error_by_kind() {
        let err = ProviderCallError::new(FailureKind::RateLimited, "429").with_status(429);
        assert_eq!(
            map_call_error(err).class,
            ErrorClass::Transient(TransientKind::RateLimit)
        );

        let err = ProviderCallError::new(FailureKind::ApiKeyInvalid, "401");
        assert_eq!(
            map_call_error(err).class,
            ErrorClass::Permanent(PermanentKind::Auth)
        );

        let err = ProviderCallError::new(FailureKind::Timeout, "deadline exceeded");
        assert_eq!(
            map_call_error(err).class,
            ErrorClass::Transient(TransientKind::Network)
        );
    }

    #[test]
    fn test_map_unknown_falls_back_to_status() {
        let err = ProviderCallError::new(FailureKind::Unknown, "boom").with_status(503);
        assert_eq!(
            map_call_error(err).class,
            ErrorClass::Transient(TransientKind::ServiceUnavailable)
        );

        let err = ProviderCallError::new(FailureKind::Unknown, "connection refused");
        assert_eq!(
            map_call_error(err).class,
            ErrorClass::Transient(TransientKind::Network)
        );
    }
}
