// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! Redis存储适配器
//!
//! 整个代理的唯一共享状态。提供哈希、列表、有序集合、计数器、发布订阅与
//! 服务端脚本的类型化操作。连接层错误（IO、超时、连接中断）带指数退避
//! 自动重试；服务端返回的逻辑结果（冲突哨兵等）原样向上传播。

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, AsyncConnectionConfig, Script};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::settings::StoreSettings;

/// 连接层错误重试次数
const RETRY_ATTEMPTS: u32 = 5;

/// 重试退避基值
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// 重试退避上限
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// 存储层错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis命令错误
    #[error("Redis command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// 序列化错误
    #[error("Serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 判断是否为可重试的连接层错误
///
/// 服务端返回的逻辑错误（类型错误、脚本错误）不在重试范围内
fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
}

/// 计算第 `attempt` 次重试的退避时间
fn backoff_delay(attempt: u32) -> Duration {
    let delay = RETRY_BACKOFF_BASE * 2u32.saturating_pow(attempt);
    delay.min(RETRY_BACKOFF_CAP)
}

/// Redis存储
///
/// 内部持有一条共享的多路复用连接用于短操作、脚本与管道；阻塞弹出与
/// 订阅使用独立连接，避免长阻塞命令占住复用通道。
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    settings: StoreSettings,
}

impl RedisStore {
    /// 建立存储连接
    ///
    /// # 参数
    ///
    /// * `settings` - 存储配置
    ///
    /// # 返回值
    ///
    /// * `Ok(RedisStore)` - 连接就绪的存储实例
    /// * `Err(StoreError)` - 连接失败
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.url.as_str())?;
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(Duration::from_secs(settings.socket_timeout))
            .set_response_timeout(Duration::from_secs(settings.socket_timeout));
        let conn = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(Self {
            client,
            conn,
            settings: settings.clone(),
        })
    }

    /// 带退避重试执行一次操作
    ///
    /// 只重试连接层错误，逻辑错误立即返回
    async fn retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(self.conn.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_connection_error(&e) && attempt + 1 < RETRY_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "Redis operation '{}' failed (attempt {}), retrying in {:?}: {}",
                        op_name,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(StoreError::Command(e)),
            }
        }
    }

    /// 探活
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.retry("ping", |mut conn| async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }

    /// 设置哈希字段
    pub async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.retry("hset", |mut conn| {
            let key = key.to_string();
            let fields = fields.to_vec();
            async move { conn.hset_multiple(key, &fields).await }
        })
        .await
    }

    /// 设置哈希字段并附加过期时间
    pub async fn hash_set_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.retry("hset+expire", |mut conn| {
            let key = key.to_string();
            let fields = fields.to_vec();
            let secs = ttl.as_secs() as i64;
            async move {
                let mut pipe = redis::pipe();
                pipe.hset_multiple(&key, &fields).ignore();
                pipe.expire(&key, secs).ignore();
                pipe.query_async::<()>(&mut conn).await
            }
        })
        .await
    }

    /// 读取单个哈希字段
    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.retry("hget", |mut conn| {
            let key = key.to_string();
            let field = field.to_string();
            async move { conn.hget(key, field).await }
        })
        .await
    }

    /// 读取完整哈希
    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.retry("hgetall", |mut conn| {
            let key = key.to_string();
            async move { conn.hgetall(key).await }
        })
        .await
    }

    /// 左推入列表
    pub async fn list_push_left(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.retry("lpush", |mut conn| {
            let key = key.to_string();
            let value = value.to_string();
            async move { conn.lpush(key, value).await }
        })
        .await
    }

    /// 列表长度
    pub async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        self.retry("llen", |mut conn| {
            let key = key.to_string();
            async move { conn.llen(key).await }
        })
        .await
    }

    /// 读取列表区间
    pub async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.retry("lrange", |mut conn| {
            let key = key.to_string();
            async move { conn.lrange(key, start, stop).await }
        })
        .await
    }

    /// 移除列表中的指定成员（全部出现）
    pub async fn list_remove(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.retry("lrem", |mut conn| {
            let key = key.to_string();
            let value = value.to_string();
            async move { conn.lrem(key, 0, value).await }
        })
        .await
    }

    /// 有序集合长度
    pub async fn zset_len(&self, key: &str) -> Result<u64, StoreError> {
        self.retry("zcard", |mut conn| {
            let key = key.to_string();
            async move { conn.zcard(key).await }
        })
        .await
    }

    /// 按score区间读取有序集合成员
    ///
    /// Redis对相同score的成员按字典序返回，到期提升的平局顺序由此保证
    pub async fn zset_range_by_score_limit(
        &self,
        key: &str,
        max_score: f64,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.retry("zrangebyscore", |mut conn| {
            let key = key.to_string();
            async move {
                conn.zrangebyscore_limit(key, f64::MIN, max_score, 0, count as isize)
                    .await
            }
        })
        .await
    }

    /// 读取有序集合全部成员（按score升序）
    pub async fn zset_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.retry("zrange", |mut conn| {
            let key = key.to_string();
            async move { conn.zrange(key, 0, -1).await }
        })
        .await
    }

    /// 查询有序集合成员score
    pub async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.retry("zscore", |mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.zscore(key, member).await }
        })
        .await
    }

    /// 集合添加成员
    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.retry("sadd", |mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.sadd(key, member).await }
        })
        .await
    }

    /// 集合移除成员
    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.retry("srem", |mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.srem(key, member).await }
        })
        .await
    }

    /// 读取计数器当前值，键不存在视为0
    pub async fn counter_get(&self, key: &str) -> Result<i64, StoreError> {
        let value: Option<String> = self
            .retry("get", |mut conn| {
                let key = key.to_string();
                async move { conn.get(key).await }
            })
            .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// 发布消息
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.retry("publish", |mut conn| {
            let channel = channel.to_string();
            let payload = payload.to_string();
            async move { conn.publish(channel, payload).await }
        })
        .await
    }

    /// 建立一个订阅连接
    pub async fn subscriber(&self, channel: &str) -> Result<redis::aio::PubSub, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }

    /// 执行服务端脚本
    ///
    /// # 参数
    ///
    /// * `script` - 预编译脚本
    /// * `keys` - KEYS参数
    /// * `args` - ARGV参数
    ///
    /// # 返回值
    ///
    /// 脚本返回值，类型由调用方指定
    pub async fn run_script<T: redis::FromRedisValue>(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<T, StoreError> {
        self.retry("script", |mut conn| {
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(key.as_str());
            }
            for arg in args {
                invocation.arg(arg.as_str());
            }
            async move { invocation.invoke_async(&mut conn).await }
        })
        .await
    }

    /// 执行管道（尽力而为的批量往返）
    pub async fn pipeline(&self, pipe: redis::Pipeline) -> Result<(), StoreError> {
        self.retry("pipeline", |mut conn| {
            let pipe = pipe.clone();
            async move { pipe.query_async::<()>(&mut conn).await }
        })
        .await
    }

    /// 删除键
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.retry("del", |mut conn| {
            let key = key.to_string();
            async move { conn.del(key).await }
        })
        .await
    }

    /// 扫描匹配模式的键
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// 尝试获取短时互斥锁（SET NX EX）
    ///
    /// # 返回值
    ///
    /// 获取成功返回true；锁已被他人持有返回false
    pub async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.retry("lock", |mut conn| {
            let key = key.to_string();
            let token = token.to_string();
            let secs = ttl.as_secs().max(1);
            async move {
                let opts = redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(secs));
                conn.set_options(key, token, opts).await
            }
        })
        .await
    }

    /// 释放互斥锁，只释放令牌匹配的锁
    pub async fn release_lock(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let _: i64 = self
            .run_script(
                &super::scripts::UNLOCK,
                &[key.to_string()],
                &[token.to_string()],
            )
            .await?;
        Ok(())
    }

    /// 创建阻塞弹出客户端
    ///
    /// 每个调度器持有独立的阻塞客户端，长阻塞命令不会占用共享连接
    pub fn blocking_client(&self) -> BlockingPopClient {
        BlockingPopClient {
            client: self.client.clone(),
            conn: None,
            timeout: Duration::from_secs(self.settings.blocking_timeout),
            socket_timeout: Duration::from_secs(
                self.settings.blocking_timeout + self.settings.socket_timeout,
            ),
        }
    }

    /// 启动后台健康检查任务
    ///
    /// 按配置间隔探活，失败只记录告警；复用连接由驱动自动重建
    pub fn spawn_health_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.clone();
        let interval = Duration::from_secs(store.settings.health_check_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.ping().await {
                            Ok(()) => debug!("Redis health check ok"),
                            Err(e) => warn!("Redis health check failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Redis health task stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// 阻塞弹出客户端
///
/// BRPOP使用专用连接并配置更长的socket超时。连接层错误后丢弃连接，
/// 下次调用时重建。
pub struct BlockingPopClient {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
    timeout: Duration,
    socket_timeout: Duration,
}

impl BlockingPopClient {
    async fn connection(&mut self) -> Result<&mut MultiplexedConnection, StoreError> {
        if self.conn.is_none() {
            let config = AsyncConnectionConfig::new()
                .set_connection_timeout(self.socket_timeout)
                .set_response_timeout(self.socket_timeout);
            let conn = self
                .client
                .get_multiplexed_async_connection_with_config(&config)
                .await?;
            self.conn = Some(conn);
        }
        Ok(self.conn.as_mut().expect("connection just established"))
    }

    /// 从多个队列按优先顺序阻塞弹出
    ///
    /// # 参数
    ///
    /// * `queues` - 按偏好排序的队列键
    ///
    /// # 返回值
    ///
    /// * `Ok(Some((queue, value)))` - 弹出成功
    /// * `Ok(None)` - 超时无数据（正常情况）
    /// * `Err(StoreError)` - 连接错误
    pub async fn pop(&mut self, queues: &[&str]) -> Result<Option<(String, String)>, StoreError> {
        let timeout = self.timeout.as_secs_f64();
        let conn = self.connection().await?;
        let result: redis::RedisResult<Option<(String, String)>> =
            conn.brpop(queues.to_vec(), timeout).await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_error(&e) {
                    // Drop the broken connection so the next pop reconnects.
                    self.conn = None;
                }
                Err(StoreError::Command(e))
            }
        }
    }
}
