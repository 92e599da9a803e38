// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 上游服务探测接口
//!
//! 实际的上游调用是协作方的事情，核心只定义探测契约。
//! 刷新器通过该接口询问上游健康状况。

use async_trait::async_trait;

use crate::provider::state::FailureKind;

/// 探测成功报告
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// 状态描述
    pub message: String,
    /// 账户余额提示
    pub balance: Option<f64>,
    /// 用量提示
    pub usage: Option<f64>,
}

/// 探测失败
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    /// 失败类别
    pub kind: FailureKind,
    /// 失败消息
    pub message: String,
    /// 上游HTTP状态码
    pub status: Option<u16>,
}

/// 上游服务探测器
#[async_trait]
pub trait ProviderProbe: Send + Sync {
    /// 探测上游当前状况
    async fn check(&self) -> Result<ProbeReport, ProbeFailure>;
}

/// 空探测器
///
/// 未配置真实探测时使用；状态完全由工作器的调用回报驱动
pub struct NullProbe;

#[async_trait]
impl ProviderProbe for NullProbe {
    async fn check(&self) -> Result<ProbeReport, ProbeFailure> {
        Ok(ProbeReport {
            message: "provider probe not configured".to_string(),
            balance: None,
            usage: None,
        })
    }
}
