// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 工作管理器
//!
//! 组装一个工作器进程的全部组件：派发循环、延迟提升调度、心跳、
//! 快照发布、控制监听与存储健康检查。派发循环受监督，panic后重启，
//! 在途任务由下次启动时的孤儿回收恢复。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::settings::Settings;
use crate::domain::event::ControlCommand;
use crate::events::bus::EventBus;
use crate::handlers::registry::HandlerRegistry;
use crate::infrastructure::redis::client::RedisStore;
use crate::limiter::token_bucket::TokenBucketLimiter;
use crate::provider::probe::ProviderProbe;
use crate::provider::state::ProviderStateCache;
use crate::queue::repository::TaskRepository;
use crate::queue::retry::RetryRouter;
use crate::queue::scheduler::Scheduler;
use crate::workers::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::workers::dispatcher::Dispatcher;
use crate::workers::heartbeat::HeartbeatTask;

/// 工作管理器
pub struct WorkerManager {
    settings: Arc<Settings>,
    store: Arc<RedisStore>,
    registry: Arc<HandlerRegistry>,
    repo: Arc<TaskRepository>,
    bus: Arc<EventBus>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<TokenBucketLimiter>,
    provider_state: Arc<ProviderStateCache>,
    router: Arc<RetryRouter>,
    worker_id: String,
    in_flight: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerManager {
    /// 创建工作管理器并组装全部组件
    ///
    /// # 参数
    ///
    /// * `settings` - 配置
    /// * `store` - 已连通的存储
    /// * `registry` - 处理器注册表
    /// * `probe` - 上游探测器（无真实探测时传 `NullProbe`）
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<RedisStore>,
        registry: Arc<HandlerRegistry>,
        probe: Arc<dyn ProviderProbe>,
    ) -> Self {
        let worker_id = format!(
            "worker-{}-{}",
            std::process::id(),
            Utc::now().timestamp()
        );
        let bus = Arc::new(EventBus::new(store.clone(), &settings));
        let repo = Arc::new(TaskRepository::new(store.clone(), bus.clone()));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::from(&settings.breaker)));
        let limiter = Arc::new(TokenBucketLimiter::new(store.clone()));
        let provider_state = Arc::new(ProviderStateCache::new(
            store.clone(),
            probe,
            &settings.provider_state,
        ));
        let router = Arc::new(RetryRouter::new(
            repo.clone(),
            &settings.retry,
            settings.dispatcher.circuit_requeue_delay,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings,
            store,
            registry,
            repo,
            bus,
            breaker,
            limiter,
            provider_state,
            router,
            worker_id,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// 工作器标识
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 任务仓库（入口层等协作方使用）
    pub fn repository(&self) -> Arc<TaskRepository> {
        self.repo.clone()
    }

    /// 事件总线
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// 启动全部后台任务与派发循环
    pub async fn start(&mut self) {
        let shutdown = self.shutdown_tx.subscribe();

        // 存储健康检查
        self.handles
            .push(self.store.spawn_health_task(shutdown.clone()));

        // 周期性全量快照
        self.handles
            .push(self.bus.spawn_snapshot_task(shutdown.clone()));

        // 心跳（先写一次，再进入周期）
        let heartbeat = HeartbeatTask::new(
            self.store.clone(),
            self.worker_id.clone(),
            self.settings.heartbeat.period,
            self.settings.heartbeat.ttl_factor,
            self.in_flight.clone(),
            self.breaker.clone(),
        );
        heartbeat.beat().await;
        self.handles.push(heartbeat.spawn(shutdown.clone()));

        // 延迟任务提升：提升幂等，每个工作器都可以运行
        let scheduler = Scheduler::new(self.repo.clone(), &self.settings.scheduler);
        self.handles.push(scheduler.spawn(shutdown.clone()));

        // 控制广播监听
        self.handles.push(self.spawn_control_listener());

        // 派发循环
        let concurrency = self.settings.dispatcher.concurrency.max(1);
        info!(
            "Starting {} dispatchers on {}",
            concurrency, self.worker_id
        );
        for index in 0..concurrency {
            self.handles.push(self.spawn_supervised_dispatcher(index));
        }
    }

    /// 受监督的派发循环：panic后延迟重启
    fn spawn_supervised_dispatcher(&self, index: usize) -> JoinHandle<()> {
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.repo.clone(),
            self.registry.clone(),
            self.breaker.clone(),
            self.limiter.clone(),
            self.provider_state.clone(),
            self.router.clone(),
            self.settings.clone(),
            self.worker_id.clone(),
            self.in_flight.clone(),
            self.shutdown_tx.subscribe(),
        );
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let instance = dispatcher.clone();
                let handle = tokio::spawn(instance.run());
                match handle.await {
                    Ok(()) => break,
                    Err(e) if e.is_panic() => {
                        error!("Dispatcher {} panicked, restarting: {:?}", index, e);
                        if *shutdown.borrow() {
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                    Err(_) => break,
                }
            }
        })
    }

    /// 控制广播监听：熔断器复位/强开指令
    fn spawn_control_listener(&self) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let breaker = self.breaker.clone();
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut subscriber = match bus.subscribe_control().await {
                    Ok(subscriber) => subscriber,
                    Err(e) => {
                        warn!("Control channel subscribe failed: {}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                };
                loop {
                    let command = tokio::select! {
                        command = subscriber.next_command() => command,
                        _ = shutdown.changed() => return,
                    };
                    match command {
                        Some(ControlCommand::ResetCircuits) => {
                            info!("Control: resetting circuit breaker on {}", worker_id);
                            breaker.force_close();
                            breaker.mirror(&store, &worker_id).await;
                        }
                        Some(ControlCommand::OpenCircuits) => {
                            info!("Control: forcing circuit breaker open on {}", worker_id);
                            breaker.force_open();
                            breaker.mirror(&store, &worker_id).await;
                        }
                        None => {
                            warn!("Control channel closed, resubscribing");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// 等待关停信号并优雅退出
    ///
    /// 停止接收新任务，在宽限期内等待在途任务排空，随后强制终止
    pub async fn wait_for_shutdown(&mut self) {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
        self.shutdown().await;
    }

    /// 执行关停流程
    pub async fn shutdown(&mut self) {
        info!("Shutting down worker {}...", self.worker_id);
        let _ = self.shutdown_tx.send(true);

        let grace = Duration::from_secs(self.settings.dispatcher.grace);
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(
                "Grace period elapsed with {} tasks in flight, cancelling; orphans are recovered by requeue_orphaned on next start",
                remaining
            );
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("Worker {} shut down", self.worker_id);
    }
}
