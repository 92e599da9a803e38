// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 配置模块
///
/// 处理应用程序的配置设置和环境变量
pub mod config;

/// 领域模块
///
/// 任务实体、状态机、事件消息与错误分类
pub mod domain;

/// 事件模块
///
/// 状态变更事件的发布与订阅
pub mod events;

/// 处理器模块
///
/// 任务处理器契约、注册表与执行上下文
pub mod handlers;

/// 基础设施模块
///
/// Redis存储适配与指标采集
pub mod infrastructure;

/// 入口模块
///
/// 暴露给HTTP协作方的任务管理接口
pub mod ingress;

/// 限流模块
///
/// 跨工作器共享的分布式令牌桶
pub mod limiter;

/// 上游服务模块
///
/// 集中式的上游健康状态缓存
pub mod provider;

/// 队列模块
///
/// 任务仓库、重试路由与延迟任务提升
pub mod queue;

/// 工具模块
///
/// 日志与遥测初始化
pub mod utils;

/// 工作器模块
///
/// 派发循环、熔断器、心跳与工作管理器
pub mod workers;
