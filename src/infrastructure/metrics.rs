// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// 初始化指标系统
///
/// 安装Prometheus导出器并注册应用所需的各类监控指标
pub fn init_metrics() {
    let builder = PrometheusBuilder::new();
    builder
        .install()
        .expect("failed to install Prometheus recorder");

    describe_counter!(
        "tasks_dispatched_total",
        "Total number of tasks activated by dispatchers"
    );
    describe_counter!(
        "tasks_completed_total",
        "Total number of tasks completed successfully"
    );
    describe_counter!("tasks_failed_total", "Total number of task attempts failed");
    describe_counter!(
        "tasks_retry_scheduled_total",
        "Total number of retries scheduled"
    );
    describe_counter!(
        "tasks_dead_lettered_total",
        "Total number of tasks moved to the DLQ"
    );
    describe_counter!(
        "circuit_breaker_requests_total",
        "Total number of outcomes recorded by the circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_successes_total",
        "Total successes recorded by the circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Total failures recorded by the circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_rejected_total",
        "Calls rejected while the circuit breaker was open"
    );
    describe_gauge!(
        "circuit_breaker_status",
        "Circuit breaker state (0 closed, 0.5 half-open, 1 open)"
    );
    describe_counter!(
        "rate_limiter_timeouts_total",
        "Token acquisitions that timed out"
    );
    describe_histogram!(
        "rate_limiter_wait_seconds",
        "Time spent waiting for rate limit tokens"
    );

    info!("Prometheus metrics recorder installed");
}
