// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 端到端场景：完整工作器进程驱动任务走完生命周期
//!
//! 需要可用的Redis，默认跳过

use std::sync::Arc;
use std::time::Duration;

use taskflow::domain::task::TaskState;
use taskflow::handlers::echo::EchoHandler;
use taskflow::handlers::registry::HandlerRegistry;
use taskflow::ingress::service::Ingress;
use taskflow::provider::probe::NullProbe;
use taskflow::workers::manager::WorkerManager;

use crate::integration::helpers::{test_broker, AlwaysFailHandler, FlakyHandler, TestBroker};

/// 启动一个带指定注册表的工作器
async fn start_worker(
    broker: &TestBroker,
    registry: Arc<HandlerRegistry>,
) -> (WorkerManager, Ingress) {
    let mut manager = WorkerManager::new(
        broker.settings.clone(),
        broker.store.clone(),
        registry.clone(),
        Arc::new(NullProbe),
    );
    manager.start().await;
    let ingress = Ingress::new(
        manager.repository(),
        manager.bus(),
        broker.store.clone(),
        registry,
        &broker.settings,
    );
    (manager, ingress)
}

/// 轮询等待任务进入目标状态
async fn wait_for_state(
    ingress: &Ingress,
    task_id: &str,
    state: TaskState,
    timeout: Duration,
) -> taskflow::domain::task::Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(task) = ingress.get(task_id).await {
            if task.state == state {
                return task;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {} did not reach {:?} within {:?}", task_id, state, timeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// 顺利路径：PENDING → ACTIVE → COMPLETED，结果为载荷回显，队列清空
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_happy_path_echo() {
    let broker = test_broker(|_| {}).await;
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    let (mut manager, ingress) = start_worker(&broker, Arc::new(registry)).await;

    let task_id = ingress
        .submit("echo", "hello", Some(3), None)
        .await
        .unwrap();
    let task = wait_for_state(&ingress, &task_id, TaskState::Completed, Duration::from_secs(15)).await;

    assert_eq!(task.result.as_deref(), Some("hello"));
    assert!(task.completed_at.is_some());
    assert_eq!(task.retry_count, 0);
    let states: Vec<&str> = task.state_history.iter().map(|e| e.state.as_str()).collect();
    assert_eq!(states, vec!["PENDING", "ACTIVE", "COMPLETED"]);

    let status = ingress.queue_status().await.unwrap();
    assert_eq!(status.queues.primary, 0);
    assert_eq!(status.queues.retry, 0);
    assert_eq!(status.states.get("completed"), Some(&1));
    assert_eq!(status.states.get("pending"), Some(&0));

    manager.shutdown().await;
}

/// 永久失败：一次尝试直接入死信，重试计数为0，死信副本存在
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_permanent_failure_goes_to_dlq() {
    let broker = test_broker(|_| {}).await;
    let mut registry = HandlerRegistry::new();
    registry.register("strict", Arc::new(AlwaysFailHandler { transient: false }));
    let (mut manager, ingress) = start_worker(&broker, Arc::new(registry)).await;

    let task_id = ingress
        .submit("strict", "payload", Some(3), None)
        .await
        .unwrap();
    let task = wait_for_state(&ingress, &task_id, TaskState::Dlq, Duration::from_secs(15)).await;

    assert_eq!(task.retry_count, 0);
    assert_eq!(task.error_type.as_deref(), Some("Permanent/ContentPolicy"));
    assert_eq!(task.error_history.len(), 1);

    let dlq = ingress.dlq_list(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].task_id, task_id);

    manager.shutdown().await;
}

/// 瞬时失败两次后成功：最终COMPLETED，retry_count=2，历史完整
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_transient_failures_then_success() {
    let broker = test_broker(|settings| {
        // 压缩重试延迟，让场景在秒级完成
        settings.retry.schedule.network = vec![1];
        settings.scheduler.tick = 1;
    })
    .await;
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", Arc::new(FlakyHandler::new(2)));
    let (mut manager, ingress) = start_worker(&broker, Arc::new(registry)).await;

    let task_id = ingress
        .submit("flaky", "hello", Some(3), None)
        .await
        .unwrap();
    let task = wait_for_state(&ingress, &task_id, TaskState::Completed, Duration::from_secs(30)).await;

    assert_eq!(task.retry_count, 2);
    assert_eq!(task.result.as_deref(), Some("hello"));
    assert_eq!(task.error_history.len(), 2);
    let states: Vec<&str> = task.state_history.iter().map(|e| e.state.as_str()).collect();
    assert_eq!(
        states,
        vec![
            "PENDING", "ACTIVE", "FAILED", "SCHEDULED", "PENDING", "ACTIVE", "FAILED",
            "SCHEDULED", "PENDING", "ACTIVE", "COMPLETED"
        ]
    );
    // 历史时间戳严格单调
    let stamps: Vec<&str> = task
        .state_history
        .iter()
        .map(|e| e.timestamp.as_str())
        .collect();
    let mut sorted = stamps.clone();
    sorted.sort();
    assert_eq!(stamps, sorted);

    manager.shutdown().await;
}

/// 重试耗尽：max_retries=1的任务第二次失败后入死信
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_retry_exhaustion_goes_to_dlq() {
    let broker = test_broker(|settings| {
        settings.retry.schedule.service_unavailable = vec![1];
        settings.scheduler.tick = 1;
    })
    .await;
    let mut registry = HandlerRegistry::new();
    registry.register("down", Arc::new(AlwaysFailHandler { transient: true }));
    let (mut manager, ingress) = start_worker(&broker, Arc::new(registry)).await;

    let task_id = ingress
        .submit("down", "payload", Some(1), None)
        .await
        .unwrap();
    let task = wait_for_state(&ingress, &task_id, TaskState::Dlq, Duration::from_secs(30)).await;

    assert_eq!(task.retry_count, 1);
    let active_episodes = task
        .state_history
        .iter()
        .filter(|e| e.state == "ACTIVE")
        .count();
    assert_eq!(active_episodes, 2);

    let status = ingress.queue_status().await.unwrap();
    assert_eq!(status.queues.dlq, 1);

    manager.shutdown().await;
}

/// 事件总线：订阅者能看到task_created与后续状态变更
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_events_are_published() {
    use taskflow::domain::event::EventKind;

    let broker = test_broker(|_| {}).await;
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    let (mut manager, ingress) = start_worker(&broker, Arc::new(registry)).await;

    let mut subscriber = manager.bus().subscribe().await.unwrap();
    let task_id = ingress
        .submit("echo", "hello", Some(3), None)
        .await
        .unwrap();

    let mut saw_created = false;
    let mut saw_completed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline && !(saw_created && saw_completed) {
        let event = tokio::select! {
            event = subscriber.next_event() => event,
            _ = tokio::time::sleep_until(deadline) => None,
        };
        let Some(event) = event else { break };
        if event.task_id.as_deref() != Some(task_id.as_str()) {
            continue;
        }
        match event.kind {
            EventKind::TaskCreated => saw_created = true,
            EventKind::TaskStateChanged => {
                if event.new_state.as_deref() == Some("COMPLETED") {
                    saw_completed = true;
                }
            }
            _ => {}
        }
    }
    assert!(saw_created, "missing task_created event");
    assert!(saw_completed, "missing COMPLETED state change event");

    manager.shutdown().await;
}
