// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::sync::Arc;

use taskflow::config::settings::Settings;
use taskflow::events::bus::EventBus;
use taskflow::handlers::echo::EchoHandler;
use taskflow::handlers::registry::HandlerRegistry;
use taskflow::infrastructure::redis::client::RedisStore;
use taskflow::ingress::service::Ingress;
use taskflow::provider::probe::NullProbe;
use taskflow::queue::repository::TaskRepository;
use taskflow::utils::telemetry;
use taskflow::workers::manager::WorkerManager;
use tracing::{error, info};

/// 工作器服务入口
///
/// 1. 初始化日志与指标
/// 2. 加载配置并连接存储
/// 3. 注册处理器
/// 4. 启动工作管理器（派发循环、调度、心跳、控制监听）
/// 5. 回收上次关停遗留的孤儿任务
/// 6. 等待关停信号并优雅退出
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_telemetry();
    info!("Starting taskflow...");

    taskflow::infrastructure::metrics::init_metrics();

    let settings = Arc::new(Settings::new()?);
    info!("Configuration loaded");

    let store = Arc::new(RedisStore::connect(&settings.store).await?);
    store.ping().await?;
    info!("Redis connection established");

    // 注册处理器；真实部署在这里挂载业务处理器
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    let registry = Arc::new(registry);
    info!("Registered handlers: {:?}", registry.task_types());

    let args: Vec<String> = std::env::args().collect();
    let service_type = args.get(1).map(String::as_str).unwrap_or("worker");

    match service_type {
        "worker" => {
            info!("Starting worker service...");
            let mut manager = WorkerManager::new(
                settings.clone(),
                store.clone(),
                registry.clone(),
                Arc::new(NullProbe),
            );

            // 上次关停可能留下PENDING却不在队列中的孤儿，启动时先回收
            let ingress = Ingress::new(
                manager.repository(),
                manager.bus(),
                store.clone(),
                registry.clone(),
                &settings,
            );
            match ingress.requeue_orphaned().await {
                Ok(report) if report.found > 0 => {
                    info!(
                        "Recovered {}/{} orphaned tasks at startup",
                        report.requeued, report.found
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Orphan recovery failed: {}", e),
            }

            manager.start().await;
            info!("Worker {} running", manager.worker_id());
            manager.wait_for_shutdown().await;
        }
        "status" => {
            let bus = Arc::new(EventBus::new(store.clone(), &settings));
            let repo = Arc::new(TaskRepository::new(store.clone(), bus.clone()));
            let ingress = Ingress::new(repo, bus, store.clone(), registry, &settings);
            let status = ingress.queue_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        _ => {
            error!(
                "Invalid service type: '{}'. Use 'worker' or 'status'.",
                service_type
            );
            std::process::exit(1);
        }
    }

    Ok(())
}
