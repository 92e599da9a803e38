// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 任务生命周期与仓库不变式的集成测试
//!
//! 全部用例需要可用的Redis，默认跳过

use super::helpers::test_broker;
use taskflow::domain::error::BrokerError;
use taskflow::domain::task::TaskState;
use taskflow::infrastructure::redis::keys;

/// 创建任务后：记录存在、PENDING计数为1、主队列深度为1
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_submit_creates_record_and_queues() {
    let broker = test_broker(|_| {}).await;

    let task_id = broker
        .ingress
        .submit("echo", "hello", Some(3), None)
        .await
        .unwrap();

    let task = broker.ingress.get(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.max_retries, 3);
    assert_eq!(task.state_history.len(), 1);
    assert_eq!(task.state_history[0].state, "PENDING");

    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.primary, 1);
    assert_eq!(depths.retry, 0);

    let pending = broker
        .store
        .counter_get(&keys::state_counter("PENDING"))
        .await
        .unwrap();
    assert_eq!(pending, 1);
}

/// 同ID重复提交返回AlreadyExists且不产生第二条队列项
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_duplicate_submit_is_rejected() {
    let broker = test_broker(|_| {}).await;

    let task_id = broker
        .ingress
        .submit("echo", "hello", None, Some("fixed-id".to_string()))
        .await
        .unwrap();
    assert_eq!(task_id, "fixed-id");

    let err = broker
        .ingress
        .submit("echo", "hello", None, Some("fixed-id".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyExists));

    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.primary, 1);
}

/// 未注册的任务类型在提交时被拒绝
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_submit_unknown_type_is_rejected() {
    let broker = test_broker(|_| {}).await;
    let err = broker
        .ingress
        .submit("summarize", "text", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
}

/// 并发激活只有一方胜出（乐观CAS）
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_concurrent_activation_single_winner() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", None, None)
        .await
        .unwrap();

    let first = broker.repo.activate(&task_id).await;
    let second = broker.repo.activate(&task_id).await;

    assert!(first.is_ok());
    match second {
        Err(BrokerError::Conflict { actual, .. }) => assert_eq!(actual, "ACTIVE"),
        other => panic!("expected conflict, got {other:?}"),
    }

    let task = broker.ingress.get(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Active);
    // 激活只追加一条历史
    assert_eq!(task.state_history.len(), 2);
}

/// 删除任务不留痕迹：记录、队列成员、计数器全部归零
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_delete_leaves_no_trace() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", None, None)
        .await
        .unwrap();

    broker.ingress.delete(&task_id).await.unwrap();

    assert!(matches!(
        broker.ingress.get(&task_id).await,
        Err(BrokerError::NotFound)
    ));
    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.primary, 0);
    let pending = broker
        .store
        .counter_get(&keys::state_counter("PENDING"))
        .await
        .unwrap();
    assert_eq!(pending, 0);
}

/// FAILED任务手动重试：计数归零并进入重试队列；重复重试是冲突且无副作用
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_manual_retry_resets_and_is_single_shot() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", Some(3), None)
        .await
        .unwrap();

    broker.repo.activate(&task_id).await.unwrap();
    broker
        .repo
        .record_error(&task_id, "Transient/Network", "connection reset")
        .await
        .unwrap();
    broker
        .repo
        .transition(
            &task_id,
            TaskState::Active,
            TaskState::Failed,
            &[("retry_count".to_string(), "2".to_string())],
        )
        .await
        .unwrap();

    broker.ingress.retry(&task_id).await.unwrap();

    let task = broker.ingress.get(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.retry_count, 0);
    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.retry, 1);

    // 已排队状态下重复重试不产生第二条队列项
    let err = broker.ingress.retry(&task_id).await.unwrap_err();
    assert!(matches!(err, BrokerError::Conflict { .. }));
    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.retry, 1);
    let task = broker.ingress.get(&task_id).await.unwrap();
    assert_eq!(task.retry_count, 0);
}

/// DLQ任务手动重试会移除死信残留
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_retry_from_dlq_clears_residue() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", Some(0), None)
        .await
        .unwrap();

    broker.repo.activate(&task_id).await.unwrap();
    broker
        .repo
        .transition(&task_id, TaskState::Active, TaskState::Failed, &[])
        .await
        .unwrap();
    broker.repo.move_to_dlq(&task_id).await.unwrap();

    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.dlq, 1);
    assert!(broker.repo.get_dlq_record(&task_id).await.unwrap().is_some());

    broker.ingress.retry(&task_id).await.unwrap();

    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.dlq, 0);
    assert_eq!(depths.retry, 1);
    let task = broker.ingress.get(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
}

/// 孤儿回收：PENDING且不在任何队列中的任务被推回重试队列
#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn test_requeue_orphaned() {
    let broker = test_broker(|_| {}).await;
    let task_id = broker
        .ingress
        .submit("echo", "hello", None, None)
        .await
        .unwrap();

    // 模拟崩溃于弹出与激活之间：队列项消失，状态仍为PENDING
    broker
        .store
        .list_remove(keys::PRIMARY_QUEUE, &task_id)
        .await
        .unwrap();

    let report = broker.ingress.requeue_orphaned().await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.requeued, 1);

    let depths = broker.repo.queue_depths().await.unwrap();
    assert_eq!(depths.retry, 1);

    // 再次执行无事可做
    let report = broker.ingress.requeue_orphaned().await.unwrap();
    assert_eq!(report.found, 0);
}
