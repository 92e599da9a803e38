// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 延迟任务提升的集成测试

use chrono::Utc;
use taskflow::domain::task::TaskState;
use taskflow::infrastructure::redis::keys;
use taskflow::queue::scheduler::Scheduler;

use super::helpers::test_broker;

/// 把任务驱动到SCHEDULED状态
async fn schedule_task(
    broker: &super::helpers::TestBroker,
    task_id: &str,
    due: chrono::DateTime<Utc>,
) {
    broker.repo.activate(task_id).await.unwrap();
    broker
        .repo
        .transition(task_id, TaskState::Active, TaskState::Failed, &[])
        .await
        .unwrap();
    broker
        .repo
        .schedule_retry(task_id, Some(1), due)
        .await
        .unwrap();
}

/// 到期任务被提升到重试队列并回到PENDING
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_due_tasks_are_promoted() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", Some(3), None)
        .await
        .unwrap();
    // 清出主队列，模拟任务已被派发过
    broker
        .store
        .list_remove(keys::PRIMARY_QUEUE, &task_id)
        .await
        .unwrap();
    schedule_task(&broker, &task_id, Utc::now() - chrono::Duration::seconds(1)).await;

    let scheduler = Scheduler::new(broker.repo.clone(), &broker.settings.scheduler);
    let promoted = scheduler.run_once().await;
    assert_eq!(promoted, 1);

    let task = broker.ingress.get(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert!(task.retry_after.is_none());
    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.retry, 1);
    assert_eq!(depths.scheduled, 0);
}

/// 未到期的任务不被提升
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_future_tasks_stay_scheduled() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", Some(3), None)
        .await
        .unwrap();
    broker
        .store
        .list_remove(keys::PRIMARY_QUEUE, &task_id)
        .await
        .unwrap();
    schedule_task(&broker, &task_id, Utc::now() + chrono::Duration::seconds(60)).await;

    let scheduler = Scheduler::new(broker.repo.clone(), &broker.settings.scheduler);
    assert_eq!(scheduler.run_once().await, 0);

    let task = broker.ingress.get(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Scheduled);
}

/// 同一到期时间的提升顺序按task_id字典序
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_simultaneous_due_promotes_in_lexicographic_order() {
    let broker = test_broker(|_| {}).await;
    let due = Utc::now() - chrono::Duration::seconds(1);
    for id in ["t-b", "t-a", "t-c"] {
        broker
            .ingress
            .submit("echo", "hello", Some(3), Some(id.to_string()))
            .await
            .unwrap();
        broker
            .store
            .list_remove(keys::PRIMARY_QUEUE, id)
            .await
            .unwrap();
        schedule_task(&broker, id, due).await;
    }

    let scheduler = Scheduler::new(broker.repo.clone(), &broker.settings.scheduler);
    assert_eq!(scheduler.run_once().await, 3);

    // LPUSH按提升顺序入队，左端是最后提升的成员
    let queued = broker
        .store
        .list_range(keys::RETRY_QUEUE, 0, -1)
        .await
        .unwrap();
    assert_eq!(queued, vec!["t-c", "t-b", "t-a"]);
}

/// 已不处于SCHEDULED的记录只做集合清理
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_promotion_is_idempotent_for_foreign_states() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", Some(3), None)
        .await
        .unwrap();
    broker
        .store
        .list_remove(keys::PRIMARY_QUEUE, &task_id)
        .await
        .unwrap();
    schedule_task(&broker, &task_id, Utc::now() - chrono::Duration::seconds(1)).await;

    let scheduler = Scheduler::new(broker.repo.clone(), &broker.settings.scheduler);
    assert_eq!(scheduler.run_once().await, 1);
    // 第二轮没有可提升项，重试队列深度不变
    assert_eq!(scheduler.run_once().await, 0);
    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.retry, 1);
}
