// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 回显处理器
//!
//! 原样返回载荷的内置处理器，用于冒烟测试与管道验证。

use async_trait::async_trait;

use crate::handlers::context::HandlerContext;
use crate::handlers::registry::{HandlerError, TaskHandler};

/// 回显处理器
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, payload: &str, _ctx: &HandlerContext) -> Result<String, HandlerError> {
        Ok(payload.to_string())
    }
}
