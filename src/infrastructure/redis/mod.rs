// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 存储客户端与连接管理
pub mod client;

/// 持久化键名布局
pub mod keys;

/// 服务端原子脚本
pub mod scripts;
