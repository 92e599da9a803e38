// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 服务端原子脚本
//!
//! 所有跨键不变式（队列成员唯一、状态计数一致、历史追加）都由这里的Lua脚本
//! 在服务端一次性完成。状态计数器只允许在这些脚本内部变更，任何客户端侧的
//! INCR/DECR都会造成计数漂移。
//!
//! 脚本以哨兵字符串报告逻辑结果（`OK` / `EXISTS` / `NOT_FOUND` /
//! `CONFLICT:<state>` / `SKIPPED:<state>` / `GONE`），由调用方映射为类型化错误。

use once_cell::sync::Lazy;
use redis::Script;

/// 创建任务记录
///
/// KEYS: [task键, 主队列, PENDING计数器]
/// ARGV: [now_iso, task_id, 字段/值对...]
///
/// 记录已存在时返回 `EXISTS`，否则写入哈希、初始化状态历史、
/// 计数器加一并推入主队列。
pub static CREATE_TASK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 'EXISTS'
end
for i = 3, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
local history = {}
table.insert(history, { state = 'PENDING', timestamp = ARGV[1] })
redis.call('HSET', KEYS[1], 'state_history', cjson.encode(history))
redis.call('INCR', KEYS[3])
redis.call('LPUSH', KEYS[2], ARGV[2])
return 'OK'
"#,
    )
});

/// 状态CAS转换（无队列操作）
///
/// KEYS: [task键, 源状态计数器, 目标状态计数器]
/// ARGV: [from_state, to_state, now_iso, 补丁字段/值对...]
///
/// 观察到的状态与 `from_state` 不一致时返回 `CONFLICT:<实际状态>`，
/// 保证并发调度器之间不会丢失更新。
pub static TRANSITION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 'NOT_FOUND'
end
if state ~= ARGV[1] then
    return 'CONFLICT:' .. state
end
redis.call('HSET', KEYS[1], 'state', ARGV[2], 'updated_at', ARGV[3])
for i = 4, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
local raw = redis.call('HGET', KEYS[1], 'state_history')
local history = cjson.decode(raw or '[]')
table.insert(history, { state = ARGV[2], timestamp = ARGV[3] })
redis.call('HSET', KEYS[1], 'state_history', cjson.encode(history))
redis.call('DECR', KEYS[2])
redis.call('INCR', KEYS[3])
return 'OK'
"#,
    )
});

/// 调度延迟重试：FAILED -> SCHEDULED 并加入有序集合
///
/// KEYS: [task键, FAILED计数器, SCHEDULED计数器, scheduled集合]
/// ARGV: [now_iso, 到期score, task_id, 补丁字段/值对...]
pub static SCHEDULE_RETRY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 'NOT_FOUND'
end
if state ~= 'FAILED' then
    return 'CONFLICT:' .. state
end
redis.call('HSET', KEYS[1], 'state', 'SCHEDULED', 'updated_at', ARGV[1])
for i = 4, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
local raw = redis.call('HGET', KEYS[1], 'state_history')
local history = cjson.decode(raw or '[]')
table.insert(history, { state = 'SCHEDULED', timestamp = ARGV[1] })
redis.call('HSET', KEYS[1], 'state_history', cjson.encode(history))
redis.call('DECR', KEYS[2])
redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[4], ARGV[2], ARGV[3])
return 'OK'
"#,
    )
});

/// 移入死信队列：FAILED -> DLQ，推入DLQ列表并保存完整副本
///
/// KEYS: [task键, FAILED计数器, DLQ计数器, dlq列表, dlq副本键]
/// ARGV: [now_iso, task_id, 补丁字段/值对...]
pub static MOVE_TO_DLQ: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 'NOT_FOUND'
end
if state ~= 'FAILED' then
    return 'CONFLICT:' .. state
end
redis.call('HSET', KEYS[1], 'state', 'DLQ', 'updated_at', ARGV[1], 'completed_at', ARGV[1])
for i = 3, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
local raw = redis.call('HGET', KEYS[1], 'state_history')
local history = cjson.decode(raw or '[]')
table.insert(history, { state = 'DLQ', timestamp = ARGV[1] })
redis.call('HSET', KEYS[1], 'state_history', cjson.encode(history))
redis.call('DECR', KEYS[2])
redis.call('INCR', KEYS[3])
redis.call('LPUSH', KEYS[4], ARGV[2])
local data = redis.call('HGETALL', KEYS[1])
redis.call('DEL', KEYS[5])
redis.call('HSET', KEYS[5], unpack(data))
return 'OK'
"#,
    )
});

/// 提升到期任务：SCHEDULED -> PENDING，移出有序集合并推入重试队列
///
/// KEYS: [task键, scheduled集合, 重试队列, SCHEDULED计数器, PENDING计数器]
/// ARGV: [task_id, now_iso]
///
/// 记录已不处于SCHEDULED时只做清理：记录不存在返回 `GONE`，
/// 状态不符返回 `SKIPPED:<state>`。重复提升因此是幂等的，
/// 调度例程可以安全地在每个工作器上并发运行。
pub static PROMOTE_SCHEDULED: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    redis.call('ZREM', KEYS[2], ARGV[1])
    return 'GONE'
end
if state ~= 'SCHEDULED' then
    redis.call('ZREM', KEYS[2], ARGV[1])
    return 'SKIPPED:' .. state
end
redis.call('HSET', KEYS[1], 'state', 'PENDING', 'retry_after', '', 'updated_at', ARGV[2])
local raw = redis.call('HGET', KEYS[1], 'state_history')
local history = cjson.decode(raw or '[]')
table.insert(history, { state = 'PENDING', timestamp = ARGV[2] })
redis.call('HSET', KEYS[1], 'state_history', cjson.encode(history))
redis.call('DECR', KEYS[4])
redis.call('INCR', KEYS[5])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[1])
return 'OK'
"#,
    )
});

/// 手动重试：FAILED/DLQ -> PENDING，重置重试计数并推入重试队列
///
/// KEYS: [task键, 重试队列, dlq列表, dlq副本键,
///        PENDING计数器, FAILED计数器, DLQ计数器]
/// ARGV: [task_id, now_iso]
pub static MANUAL_RETRY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 'NOT_FOUND'
end
if state ~= 'FAILED' and state ~= 'DLQ' then
    return 'CONFLICT:' .. state
end
if state == 'DLQ' then
    redis.call('LREM', KEYS[3], 0, ARGV[1])
    redis.call('DEL', KEYS[4])
    redis.call('DECR', KEYS[7])
else
    redis.call('DECR', KEYS[6])
end
redis.call('HSET', KEYS[1], 'state', 'PENDING', 'retry_count', '0', 'retry_after', '', 'updated_at', ARGV[2])
local raw = redis.call('HGET', KEYS[1], 'state_history')
local history = cjson.decode(raw or '[]')
table.insert(history, { state = 'PENDING', timestamp = ARGV[2] })
redis.call('HSET', KEYS[1], 'state_history', cjson.encode(history))
redis.call('INCR', KEYS[5])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 'OK:' .. state
"#,
    )
});

/// 记录任务错误：追加错误历史并刷新最近错误字段
///
/// KEYS: [task键]
/// ARGV: [error_type, message, now_iso]
pub static RECORD_ERROR: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 'NOT_FOUND'
end
local raw = redis.call('HGET', KEYS[1], 'error_history')
local history = cjson.decode(raw or '[]')
table.insert(history, { error_type = ARGV[1], message = ARGV[2], timestamp = ARGV[3] })
redis.call('HSET', KEYS[1], 'error_history', cjson.encode(history), 'last_error', ARGV[2], 'error_type', ARGV[1], 'updated_at', ARGV[3])
return 'OK'
"#,
    )
});

/// 删除任务：移除记录、所有队列成员资格、死信副本并修正计数器
///
/// KEYS: [task键, 主队列, 重试队列, scheduled集合, dlq列表, dlq副本键]
/// ARGV: [task_id, 计数器键前缀]
///
/// 计数器键在脚本内由当前状态拼出，避免客户端读状态与删除之间的竞态。
pub static DELETE_TASK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 'NOT_FOUND'
end
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('LREM', KEYS[5], 0, ARGV[1])
redis.call('DEL', KEYS[6])
redis.call('DEL', KEYS[1])
redis.call('DECR', ARGV[2] .. string.lower(state))
return 'OK:' .. state
"#,
    )
});

/// 令牌桶获取：原子补充+扣减
///
/// KEYS: [bucket哈希, config哈希]
/// ARGV: [当前epoch秒（小数）, 请求令牌数]
///
/// 桶未初始化时从配置键引导（缺省230请求/10秒）并以满桶起步。
/// 返回 `{granted, tokens, wait}`，全部编码为字符串以保留小数部分
/// （Lua数值经Redis返回会被截断为整数）。
pub static ACQUIRE_TOKENS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local bucket_key = KEYS[1]
local config_key = KEYS[2]
local current_time = tonumber(ARGV[1])
local tokens_requested = tonumber(ARGV[2])

local bucket_data = redis.call('HMGET', bucket_key, 'tokens', 'last_refill', 'capacity', 'refill_rate')
local tokens = tonumber(bucket_data[1]) or 0
local last_refill = tonumber(bucket_data[2]) or current_time
local capacity = tonumber(bucket_data[3]) or 0
local refill_rate = tonumber(bucket_data[4]) or 0

if capacity == 0 then
    local config_data = redis.call('HMGET', config_key, 'requests', 'interval')
    local requests = tonumber(config_data[1]) or 230
    local interval_seconds = 10
    if config_data[2] then
        local num = string.match(config_data[2], '(%d+)')
        if num then
            interval_seconds = tonumber(num)
        end
    end
    capacity = requests
    refill_rate = requests / interval_seconds
    tokens = capacity
end

local elapsed = current_time - last_refill
if elapsed < 0 then
    elapsed = 0
end
tokens = math.min(capacity, tokens + elapsed * refill_rate)

if tokens >= tokens_requested then
    tokens = tokens - tokens_requested
    redis.call('HSET', bucket_key,
        'tokens', tokens,
        'last_refill', current_time,
        'capacity', capacity,
        'refill_rate', refill_rate)
    redis.call('EXPIRE', bucket_key, 3600)
    return { '1', tostring(tokens), '0' }
else
    local wait_time = (tokens_requested - tokens) / refill_rate
    redis.call('HSET', bucket_key,
        'tokens', tokens,
        'last_refill', current_time,
        'capacity', capacity,
        'refill_rate', refill_rate)
    redis.call('EXPIRE', bucket_key, 3600)
    return { '0', tostring(tokens), tostring(wait_time) }
end
"#,
    )
});

/// 更新限流配置并收缩令牌桶
///
/// KEYS: [config哈希, bucket哈希]
/// ARGV: [requests, interval秒, now_epoch]
///
/// 容量缩小时现有令牌被收缩到新容量以内，令牌永不超额。
pub static UPDATE_LIMIT_CONFIG: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('HSET', KEYS[1], 'requests', ARGV[1], 'interval', ARGV[2], 'updated_at', ARGV[3])
local capacity = tonumber(ARGV[1])
local refill_rate = capacity / tonumber(ARGV[2])
local tokens = capacity
local current = redis.call('HGET', KEYS[2], 'tokens')
if current then
    tokens = math.min(tonumber(current), capacity)
end
redis.call('HSET', KEYS[2],
    'tokens', tokens,
    'capacity', capacity,
    'refill_rate', refill_rate,
    'last_refill', ARGV[3])
redis.call('EXPIRE', KEYS[2], 3600)
return 'OK'
"#,
    )
});

/// 持锁校验解锁：只释放自己持有的锁
///
/// KEYS: [锁键]
/// ARGV: [锁令牌]
pub static UNLOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});
