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

//! 任务派发循环
//!
//! 每个工作器运行 `dispatcher.concurrency` 个派发循环。循环按自适应比例
//! 在主队列与重试队列之间选择、阻塞弹出、CAS激活、过熔断与限流门禁、
//! 调用处理器并把结果交给路由器。
//!
//! 弹出用的阻塞连接有界超时（缺省5秒），关停信号最多在一个超时周期内
//! 被观察到。激活竞争输掉的一方直接放弃任务，赢家负责后续全部状态转换。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::settings::Settings;
use crate::domain::error::{BrokerError, ErrorClass, PermanentKind, TransientKind};
use crate::domain::task::Task;
use crate::handlers::context::{HandlerContext, ProviderGateway};
use crate::handlers::registry::{HandlerError, HandlerRegistry, TaskHandler};
use crate::infrastructure::redis::client::{BlockingPopClient, RedisStore};
use crate::infrastructure::redis::keys;
use crate::limiter::token_bucket::TokenBucketLimiter;
use crate::provider::state::ProviderStateCache;
use crate::queue::repository::TaskRepository;
use crate::queue::retry::{adaptive_retry_ratio, RetryRouter};
use crate::workers::circuit_breaker::CircuitBreaker;

/// 任务派发器
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<RedisStore>,
    repo: Arc<TaskRepository>,
    registry: Arc<HandlerRegistry>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<TokenBucketLimiter>,
    provider_state: Arc<ProviderStateCache>,
    router: Arc<RetryRouter>,
    settings: Arc<Settings>,
    worker_id: String,
    in_flight: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// 创建派发器
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RedisStore>,
        repo: Arc<TaskRepository>,
        registry: Arc<HandlerRegistry>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<TokenBucketLimiter>,
        provider_state: Arc<ProviderStateCache>,
        router: Arc<RetryRouter>,
        settings: Arc<Settings>,
        worker_id: String,
        in_flight: Arc<AtomicUsize>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            repo,
            registry,
            breaker,
            limiter,
            provider_state,
            router,
            settings,
            worker_id,
            in_flight,
            shutdown,
        }
    }

    /// 运行派发循环直到收到关停信号
    pub async fn run(self) {
        info!("Dispatcher started on {}", self.worker_id);
        let mut blocking = self.store.blocking_client();
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let popped = tokio::select! {
                result = self.next_task(&mut blocking) => result,
                _ = shutdown.changed() => break,
            };
            match popped {
                Ok(Some((queue, task_id))) => {
                    debug!("Received task {} from {}", task_id, queue);
                    self.process(&task_id).await;
                }
                Ok(None) => {
                    // 弹出超时，正常空转
                    continue;
                }
                Err(e) => {
                    error!("Queue poll failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("Dispatcher stopped on {}", self.worker_id);
    }

    /// 按自适应比例选择队列顺序并阻塞弹出
    ///
    /// 重试队列深度决定重试消费比例：压力越大越偏向新任务
    async fn next_task(
        &self,
        blocking: &mut BlockingPopClient,
    ) -> Result<Option<(String, String)>, BrokerError> {
        let retry_depth = self.repo.retry_depth().await?;
        let ratio = adaptive_retry_ratio(
            retry_depth,
            self.settings.retry.ratio_thresholds.warn,
            self.settings.retry.ratio_thresholds.crit,
        );
        let draw: f64 = rand::random_range(0.0..1.0);
        let queues: [&str; 2] = if draw > ratio {
            [keys::PRIMARY_QUEUE, keys::RETRY_QUEUE]
        } else {
            [keys::RETRY_QUEUE, keys::PRIMARY_QUEUE]
        };
        Ok(blocking.pop(&queues).await?)
    }

    /// 处理一个弹出的任务ID，带在途簿记
    async fn process(&self, task_id: &str) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let active_key = keys::worker_active_tasks(&self.worker_id);
        if let Err(e) = self.store.set_add(&active_key, task_id).await {
            warn!("Failed to track active task {}: {}", task_id, e);
        }

        if let Err(e) = self.process_inner(task_id).await {
            error!("Processing task {} failed: {}", task_id, e);
        }

        if let Err(e) = self.store.set_remove(&active_key, task_id).await {
            warn!("Failed to untrack active task {}: {}", task_id, e);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    #[instrument(skip(self), fields(worker = %self.worker_id))]
    async fn process_inner(&self, task_id: &str) -> Result<(), BrokerError> {
        let Some(task) = self.repo.get(task_id).await? else {
            warn!("Popped task {} has no record, dropping", task_id);
            return Ok(());
        };

        // CAS激活；输掉竞争直接放弃（对方会处理）
        match self.repo.activate(task_id).await {
            Ok(()) => {}
            Err(BrokerError::Conflict { actual, .. }) => {
                debug!("Lost activation race for {} (observed {})", task_id, actual);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        counter!("tasks_dispatched_total").increment(1);

        // 熔断门禁：打开时带小延迟重入，不消耗重试次数
        if !self.breaker.is_call_permitted() {
            debug!("Circuit open, rescheduling task {}", task_id);
            self.router
                .route_failure(
                    &task,
                    ErrorClass::Transient(TransientKind::CircuitOpen),
                    "circuit breaker is open",
                )
                .await?;
            return Ok(());
        }

        // 限流准入
        let token_wait = Duration::from_secs(self.settings.dispatcher.token_wait);
        match self.limiter.acquire(1, token_wait).await {
            Ok(()) => {}
            Err(BrokerError::RateLimitTimeout) => {
                self.router
                    .route_failure(
                        &task,
                        ErrorClass::Transient(TransientKind::RateLimit),
                        "rate limit token acquire timed out",
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // 处理器查找：未注册视为永久失败
        let Some(handler) = self.registry.get(&task.task_type) else {
            self.router
                .route_failure(
                    &task,
                    ErrorClass::Permanent(PermanentKind::Dependency),
                    &format!("no handler registered for task type '{}'", task.task_type),
                )
                .await?;
            return Ok(());
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let gateway = ProviderGateway::new(
            self.breaker.clone(),
            self.limiter.clone(),
            self.provider_state.clone(),
            token_wait,
        );
        let ctx = HandlerContext::new(task_id, cancel_rx, gateway);

        let outcome = self
            .invoke_with_deadlines(&handler, &task, &ctx, &cancel_tx)
            .await;

        match outcome {
            Ok(Ok(result)) => {
                self.repo.complete(task_id, &result).await?;
                self.breaker.record_success();
                counter!("tasks_completed_total").increment(1);
                info!("Task {} completed", task_id);
            }
            Ok(Err(handler_err)) => {
                if handler_err.class != ErrorClass::Transient(TransientKind::CircuitOpen) {
                    self.breaker.record_failure();
                }
                counter!("tasks_failed_total").increment(1);
                self.router
                    .route_failure(&task, handler_err.class, &handler_err.message)
                    .await?;
            }
            Err(()) => {
                // 硬截止：放弃在途工作
                error!("Task {} exceeded hard deadline, abandoning", task_id);
                self.breaker.record_failure();
                counter!("tasks_failed_total").increment(1);
                self.router
                    .route_failure(
                        &task,
                        ErrorClass::Transient(TransientKind::Timeout),
                        "task exceeded hard execution deadline",
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// 带软/硬截止地调用处理器
    ///
    /// 软截止通过取消信号通知处理器让出；硬截止直接放弃未决的处理器
    /// future（任务随后按 `timeout` 分类路由）
    async fn invoke_with_deadlines(
        &self,
        handler: &Arc<dyn TaskHandler>,
        task: &Task,
        ctx: &HandlerContext,
        cancel_tx: &watch::Sender<bool>,
    ) -> Result<Result<String, HandlerError>, ()> {
        let soft = tokio::time::sleep(Duration::from_secs(self.settings.dispatcher.soft_limit));
        let hard = tokio::time::sleep(Duration::from_secs(self.settings.dispatcher.hard_limit));
        tokio::pin!(soft);
        tokio::pin!(hard);
        let handle_fut = handler.handle(&task.payload, ctx);
        tokio::pin!(handle_fut);

        let mut soft_fired = false;
        loop {
            tokio::select! {
                result = &mut handle_fut => return Ok(result),
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    warn!("Task {} exceeded soft deadline, signalling cancellation", task.task_id);
                    let _ = cancel_tx.send(true);
                }
                _ = &mut hard => {
                    let _ = cancel_tx.send(true);
                    return Err(());
                }
            }
        }
    }
}
