// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use taskflow::config::settings::Settings;
use taskflow::domain::error::{PermanentKind, TransientKind};
use taskflow::events::bus::EventBus;
use taskflow::handlers::context::HandlerContext;
use taskflow::handlers::echo::EchoHandler;
use taskflow::handlers::registry::{HandlerError, HandlerRegistry, TaskHandler};
use taskflow::infrastructure::redis::client::RedisStore;
use taskflow::ingress::service::Ingress;
use taskflow::queue::repository::TaskRepository;

/// 测试环境：独立DB + 每次用例前清空
pub struct TestBroker {
    pub settings: Arc<Settings>,
    pub store: Arc<RedisStore>,
    pub bus: Arc<EventBus>,
    pub repo: Arc<TaskRepository>,
    pub registry: Arc<HandlerRegistry>,
    pub ingress: Ingress,
}

/// 测试用Redis地址
pub fn test_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/15".to_string())
}

/// 建立测试环境并清空测试DB
///
/// # 参数
///
/// * `tweak` - 在连接前调整配置（缩短调度表、降低阈值等）
pub async fn test_broker<F>(tweak: F) -> TestBroker
where
    F: FnOnce(&mut Settings),
{
    let mut settings = Settings::new().expect("default settings");
    settings.store.url = test_redis_url();
    // 测试中关停要快
    settings.dispatcher.grace = 2;
    settings.store.blocking_timeout = 1;
    tweak(&mut settings);
    let settings = Arc::new(settings);

    // 清空测试DB
    let client = redis::Client::open(settings.store.url.as_str()).expect("redis url");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("redis reachable, set REDIS_URL to override");
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();

    let store = Arc::new(RedisStore::connect(&settings.store).await.unwrap());
    let bus = Arc::new(EventBus::new(store.clone(), &settings));
    let repo = Arc::new(TaskRepository::new(store.clone(), bus.clone()));

    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    let registry = Arc::new(registry);

    let ingress = Ingress::new(
        repo.clone(),
        bus.clone(),
        store.clone(),
        registry.clone(),
        &settings,
    );

    TestBroker {
        settings,
        store,
        bus,
        repo,
        registry,
        ingress,
    }
}

/// 固定失败的处理器
pub struct AlwaysFailHandler {
    pub transient: bool,
}

#[async_trait]
impl TaskHandler for AlwaysFailHandler {
    async fn handle(&self, _payload: &str, _ctx: &HandlerContext) -> Result<String, HandlerError> {
        if self.transient {
            Err(HandlerError::transient(
                TransientKind::ServiceUnavailable,
                "upstream unavailable",
            ))
        } else {
            Err(HandlerError::permanent(
                PermanentKind::ContentPolicy,
                "content rejected",
            ))
        }
    }
}

/// 先失败N次再成功的处理器
pub struct FlakyHandler {
    pub failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, payload: &str, _ctx: &HandlerContext) -> Result<String, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::transient(
                TransientKind::Network,
                "connection reset",
            ))
        } else {
            Ok(payload.to_string())
        }
    }
}
