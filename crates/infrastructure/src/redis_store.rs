//! 基于Redis的协调存储
//!
//! 每个写操作都在一个Lua脚本里原子完成：递增全局修订版本、更新数据、
//! 把这次变化追加到事件流。监听就是从指定修订版本开始阻塞读取事件流。
//!
//! Redis本身没有租约，这里用有序集合记录每个租约的到期时间（取Redis服务器时间），
//! 连接到同一命名空间的所有进程都会定期执行清理脚本，删除过期租约及其绑定的key。
//!
//! 需要Redis 7及以上版本，不支持集群模式。

use async_trait::async_trait;
use crond_core::config::StoreConfig;
use crond_core::constants::{DEFAULT_REDIS_NAMESPACE, DEFAULT_REDIS_URL, MAX_LEASE_TTL_SECONDS};
use crond_core::traits::{
    Compare, CoordinationStore, DeleteResponse, GetResponse, KeepAliveResponse, KeepAliveStream,
    KeyValue, LeaseGrant, LeaseId, PutResponse, Revision, Txn, TxnOp, TxnOpResponse, TxnResponse,
    WatchEvent, WatchEventType, WatchStream,
};
use crond_core::{CronError, CronResult};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Redis协调存储配置
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    /// 所有key的前缀
    pub namespace: String,
    pub connect_timeout: Duration,
    /// 过期租约清理间隔
    pub reap_interval: Duration,
    /// 事件流保留的条数，用于从旧修订版本开始监听
    pub history_limit: usize,
    /// 监听时单次阻塞读取的最长等待时间
    pub block_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            namespace: DEFAULT_REDIS_NAMESPACE.to_string(),
            connect_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_millis(100),
            history_limit: 10_000,
            block_timeout: Duration::from_millis(250),
        }
    }
}

impl From<&StoreConfig> for RedisStoreConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            url: config.url.clone(),
            namespace: config.namespace.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            reap_interval: Duration::from_millis(config.reap_interval_ms),
            ..Self::default()
        }
    }
}

/// 脚本公共部分：KEYS和ARGV的前两项所有脚本一致
const LUA_PRELUDE: &str = r#"
local K_REVISION, K_INDEX, K_VALUES, K_META = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local K_LEASES, K_LEASE_TTLS, K_EVENTS = KEYS[5], KEYS[6], KEYS[7]
local K_COMPACTED, K_LEASE_SEQ = KEYS[8], KEYS[9]
local NAMESPACE = ARGV[1]
local HISTORY_LIMIT = tonumber(ARGV[2])

local function now_ms()
  local t = redis.call('TIME')
  return tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local function current_revision()
  return tonumber(redis.call('GET', K_REVISION) or '0')
end

local function lease_keys(id)
  return NAMESPACE .. 'lease-keys:' .. id
end

local function lease_alive(id)
  local deadline = redis.call('ZSCORE', K_LEASES, id)
  return deadline and tonumber(deadline) > now_ms()
end

local function load(key)
  local meta = redis.call('HGET', K_META, key)
  if not meta then
    return nil
  end
  local c, m, l = string.match(meta, '^(%d+):(%d+):(%d+)$')
  return {
    key = key,
    value = redis.call('HGET', K_VALUES, key) or '',
    create = tonumber(c),
    mod = tonumber(m),
    lease = tonumber(l),
  }
end

local function emit(out, kv)
  table.insert(out, kv.key)
  table.insert(out, kv.value)
  table.insert(out, tostring(kv.create))
  table.insert(out, tostring(kv.mod))
  table.insert(out, tostring(kv.lease))
end

local function emit_optional(out, kv)
  if kv then
    table.insert(out, '1')
    emit(out, kv)
  else
    table.insert(out, '0')
  end
end

local function record(revision, kind, key, value, create, lease)
  redis.call('XADD', K_EVENTS, revision .. '-0', 'type', kind, 'key', key, 'value', value,
    'create', create, 'mod', revision, 'lease', lease)
  local excess = redis.call('XLEN', K_EVENTS) - HISTORY_LIMIT
  if excess > 0 then
    local dropped = redis.call('XRANGE', K_EVENTS, '-', '+', 'COUNT', excess)
    for _, entry in ipairs(dropped) do
      redis.call('XDEL', K_EVENTS, entry[1])
    end
    redis.call('SET', K_COMPACTED, string.match(dropped[#dropped][1], '^(%d+)'))
  end
end

local function put(key, value, lease)
  local revision = redis.call('INCR', K_REVISION)
  local prev = load(key)
  local create = revision
  if prev then
    create = prev.create
    if prev.lease ~= 0 then
      redis.call('SREM', lease_keys(prev.lease), key)
    end
  end
  redis.call('ZADD', K_INDEX, 0, key)
  redis.call('HSET', K_VALUES, key, value)
  redis.call('HSET', K_META, key, create .. ':' .. revision .. ':' .. lease)
  if lease ~= 0 then
    redis.call('SADD', lease_keys(lease), key)
  end
  record(revision, 'put', key, value, create, lease)
  return revision, prev
end

local function delete(key)
  local prev = load(key)
  if not prev then
    return current_revision(), nil
  end
  local revision = redis.call('INCR', K_REVISION)
  redis.call('ZREM', K_INDEX, key)
  redis.call('HDEL', K_VALUES, key)
  redis.call('HDEL', K_META, key)
  if prev.lease ~= 0 then
    redis.call('SREM', lease_keys(prev.lease), key)
  end
  record(revision, 'delete', key, '', 0, 0)
  return revision, prev
end

local function remove_lease(id)
  if not redis.call('ZSCORE', K_LEASES, id) then
    return false
  end
  local set = lease_keys(id)
  for _, key in ipairs(redis.call('SMEMBERS', set)) do
    local kv = load(key)
    if kv and kv.lease == id then
      delete(key)
    end
  end
  redis.call('DEL', set)
  redis.call('ZREM', K_LEASES, id)
  redis.call('HDEL', K_LEASE_TTLS, id)
  return true
end
"#;

const LUA_RANGE: &str = r#"
local key, prefix = ARGV[3], ARGV[4] == '1'
local out = {tostring(current_revision())}
if prefix then
  for _, k in ipairs(redis.call('ZRANGEBYLEX', K_INDEX, '[' .. key, '[' .. key .. '\255')) do
    emit(out, load(k))
  end
else
  local kv = load(key)
  if kv then
    emit(out, kv)
  end
end
return out
"#;

const LUA_PUT: &str = r#"
local key, value, lease = ARGV[3], ARGV[4], tonumber(ARGV[5])
if lease ~= 0 and not lease_alive(lease) then
  return {'lease_not_found', tostring(lease)}
end
local revision, prev = put(key, value, lease)
local out = {'ok', tostring(revision)}
emit_optional(out, prev)
return out
"#;

const LUA_DELETE: &str = r#"
local revision, prev = delete(ARGV[3])
local out = {tostring(revision)}
emit_optional(out, prev)
return out
"#;

const LUA_TXN: &str = r#"
local cursor = 3
local function take()
  local value = ARGV[cursor]
  cursor = cursor + 1
  return value
end

local succeeded = true
for _ = 1, tonumber(take()) do
  local key = take()
  local expected = tonumber(take())
  local kv = load(key)
  local actual = 0
  if kv then
    actual = kv.create
  end
  if actual ~= expected then
    succeeded = false
  end
end

local function take_ops()
  local ops = {}
  for _ = 1, tonumber(take()) do
    local kind = take()
    local key = take()
    local value = take()
    local lease = tonumber(take())
    table.insert(ops, {kind = kind, key = key, value = value, lease = lease})
  end
  return ops
end

local success = take_ops()
local failure = take_ops()
local ops = failure
if succeeded then
  ops = success
end

for _, op in ipairs(ops) do
  if op.kind == 'put' and op.lease ~= 0 and not lease_alive(op.lease) then
    return {'lease_not_found', tostring(op.lease)}
  end
end

local out = {'ok', succeeded and '1' or '0', ''}
for _, op in ipairs(ops) do
  if op.kind == 'put' then
    local revision, prev = put(op.key, op.value, op.lease)
    table.insert(out, 'put')
    table.insert(out, tostring(revision))
    emit_optional(out, prev)
  elseif op.kind == 'get' then
    table.insert(out, 'get')
    table.insert(out, tostring(current_revision()))
    emit_optional(out, load(op.key))
  else
    local revision, prev = delete(op.key)
    table.insert(out, 'delete')
    table.insert(out, tostring(revision))
    emit_optional(out, prev)
  end
end
out[3] = tostring(current_revision())
return out
"#;

const LUA_GRANT: &str = r#"
local ttl = tonumber(ARGV[3])
local id = redis.call('INCR', K_LEASE_SEQ)
redis.call('ZADD', K_LEASES, now_ms() + ttl * 1000, id)
redis.call('HSET', K_LEASE_TTLS, id, ttl)
return {tostring(id)}
"#;

const LUA_RENEW: &str = r#"
local id = tonumber(ARGV[3])
if not lease_alive(id) then
  return {'0'}
end
local ttl = tonumber(redis.call('HGET', K_LEASE_TTLS, id) or '0')
if ttl <= 0 then
  return {'0'}
end
redis.call('ZADD', K_LEASES, now_ms() + ttl * 1000, id)
return {tostring(ttl)}
"#;

const LUA_REVOKE: &str = r#"
if remove_lease(tonumber(ARGV[3])) then
  return {'1'}
end
return {'0'}
"#;

const LUA_REAP: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', K_LEASES, '-inf', now_ms())
for _, id in ipairs(expired) do
  remove_lease(tonumber(id))
end
return {tostring(#expired)}
"#;

/// 命名空间下用到的所有key，顺序与脚本中的KEYS一致
#[derive(Debug)]
struct Keys {
    namespace: String,
    revision: String,
    index: String,
    values: String,
    meta: String,
    leases: String,
    lease_ttls: String,
    events: String,
    compacted: String,
    lease_seq: String,
}

impl Keys {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            revision: format!("{namespace}revision"),
            index: format!("{namespace}keys"),
            values: format!("{namespace}values"),
            meta: format!("{namespace}meta"),
            leases: format!("{namespace}leases"),
            lease_ttls: format!("{namespace}lease-ttls"),
            events: format!("{namespace}events"),
            compacted: format!("{namespace}compacted"),
            lease_seq: format!("{namespace}lease-seq"),
        }
    }

    fn script_keys(&self) -> [&str; 9] {
        [
            &self.revision,
            &self.index,
            &self.values,
            &self.meta,
            &self.leases,
            &self.lease_ttls,
            &self.events,
            &self.compacted,
            &self.lease_seq,
        ]
    }
}

struct Scripts {
    range: Script,
    put: Script,
    delete: Script,
    txn: Script,
    grant: Script,
    renew: Script,
    revoke: Script,
    reap: Script,
}

impl Scripts {
    fn new() -> Self {
        let script = |body: &str| Script::new(&format!("{LUA_PRELUDE}\n{body}"));
        Self {
            range: script(LUA_RANGE),
            put: script(LUA_PUT),
            delete: script(LUA_DELETE),
            txn: script(LUA_TXN),
            grant: script(LUA_GRANT),
            renew: script(LUA_RENEW),
            revoke: script(LUA_REVOKE),
            reap: script(LUA_REAP),
        }
    }
}

/// 续租任务和清理任务共用的连接和脚本
struct Shared {
    conn: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
    history_limit: usize,
}

impl Shared {
    async fn invoke(&self, script: &Script, args: &[Vec<u8>]) -> CronResult<Reply> {
        let mut invocation = script.prepare_invoke();
        for key in self.keys.script_keys() {
            invocation.key(key);
        }
        invocation
            .arg(self.keys.namespace.as_str())
            .arg(self.history_limit);
        for arg in args {
            invocation.arg(arg.as_slice());
        }

        let mut conn = self.conn.clone();
        let items: Vec<Vec<u8>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(Reply::new(items))
    }

    /// 续租一次，返回0表示租约已不存在
    async fn renew(&self, lease: LeaseId) -> CronResult<i64> {
        self.invoke(&self.scripts.renew, &[int_arg(lease)])
            .await?
            .int()
    }
}

/// Redis协调存储实现
pub struct RedisCoordinationStore {
    client: Client,
    shared: Arc<Shared>,
    block_timeout: Duration,
    /// 过期租约清理任务的停止信号
    reaper_stop: CancellationToken,
}

impl RedisCoordinationStore {
    /// 连接Redis并启动过期租约清理任务
    pub async fn connect(config: RedisStoreConfig) -> CronResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(store_error)?;
        let conn = tokio::time::timeout(config.connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| CronError::Store("连接Redis超时".to_string()))?
            .map_err(store_error)?;

        let mut ping = conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut ping)
            .await
            .map_err(store_error)?;

        info!(namespace = %config.namespace, "已连接Redis协调存储");
        let store = Self {
            client,
            shared: Arc::new(Shared {
                conn,
                keys: Keys::new(&config.namespace),
                scripts: Scripts::new(),
                history_limit: config.history_limit.max(1),
            }),
            block_timeout: config.block_timeout,
            reaper_stop: CancellationToken::new(),
        };

        store.start_reaper(config.reap_interval);
        Ok(store)
    }

    fn start_reaper(&self, reap_interval: Duration) {
        let shared = Arc::downgrade(&self.shared);
        let stop = self.reaper_stop.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            let mut failing = false;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(shared) = shared.upgrade() else { break };
                let reaped = shared
                    .invoke(&shared.scripts.reap, &[])
                    .await
                    .and_then(|mut reply| reply.int());
                match reaped {
                    Ok(0) => failing = false,
                    Ok(count) => {
                        failing = false;
                        debug!(count, "已清理过期租约");
                    }
                    Err(e) => {
                        // 连接断开期间每个周期都会失败，只记一次
                        if !failing {
                            warn!(error = %e, "清理过期租约失败");
                        }
                        failing = true;
                    }
                }
            }
        });
    }

    async fn range(&self, key: &str, prefix: bool) -> CronResult<GetResponse> {
        let reply = self
            .shared
            .invoke(
                &self.shared.scripts.range,
                &[key.as_bytes().to_vec(), int_arg(i64::from(prefix))],
            )
            .await?;
        decode_range(reply)
    }
}

impl Drop for RedisCoordinationStore {
    fn drop(&mut self) {
        self.reaper_stop.cancel();
    }
}

impl std::fmt::Debug for RedisCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinationStore")
            .field("namespace", &self.shared.keys.namespace)
            .finish()
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn get(&self, key: &str) -> CronResult<GetResponse> {
        self.range(key, false).await
    }

    async fn get_prefix(&self, prefix: &str) -> CronResult<GetResponse> {
        self.range(prefix, true).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> CronResult<PutResponse> {
        let mut reply = self
            .shared
            .invoke(
                &self.shared.scripts.put,
                &[key.as_bytes().to_vec(), value, int_arg(lease.unwrap_or(0))],
            )
            .await?;
        reply.status()?;
        Ok(PutResponse {
            revision: reply.int()?,
            prev_kv: reply.optional_key_value()?,
        })
    }

    async fn delete(&self, key: &str) -> CronResult<DeleteResponse> {
        let mut reply = self
            .shared
            .invoke(&self.shared.scripts.delete, &[key.as_bytes().to_vec()])
            .await?;
        let revision = reply.int()?;
        let prev = reply.optional_key_value()?;
        Ok(DeleteResponse {
            revision,
            deleted: i64::from(prev.is_some()),
            prev_kvs: prev.into_iter().collect(),
        })
    }

    async fn txn(&self, txn: Txn) -> CronResult<TxnResponse> {
        let reply = self
            .shared
            .invoke(&self.shared.scripts.txn, &encode_txn(&txn))
            .await?;
        decode_txn(reply)
    }

    async fn grant_lease(&self, ttl_seconds: i64) -> CronResult<LeaseGrant> {
        if ttl_seconds <= 0 || ttl_seconds > MAX_LEASE_TTL_SECONDS {
            return Err(CronError::Store(format!("无效的租约时长: {ttl_seconds}")));
        }

        let id = self
            .shared
            .invoke(&self.shared.scripts.grant, &[int_arg(ttl_seconds)])
            .await?
            .int()?;
        debug!(lease_id = id, ttl_seconds, "租约已创建");
        Ok(LeaseGrant {
            id,
            ttl: ttl_seconds,
        })
    }

    async fn keep_alive(&self, lease: LeaseId, cancel: CancellationToken) -> CronResult<KeepAliveStream> {
        let ttl = self.shared.renew(lease).await?;
        if ttl <= 0 {
            return Err(CronError::LeaseNotFound(lease));
        }

        let (tx, rx) = mpsc::channel(16);
        let _ = tx.try_send(KeepAliveResponse { id: lease, ttl });

        let shared = Arc::downgrade(&self.shared);
        let period = Duration::from_millis((ttl.saturating_mul(1000) / 3).max(50) as u64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if tx.is_closed() {
                    break;
                }
                let Some(shared) = shared.upgrade() else { break };

                match shared.renew(lease).await {
                    Ok(ttl) if ttl > 0 => {
                        let _ = tx.try_send(KeepAliveResponse { id: lease, ttl });
                    }
                    Ok(_) => {
                        debug!(lease_id = lease, "租约已过期或被撤销");
                        break;
                    }
                    Err(e) => {
                        warn!(lease_id = lease, error = %e, "续租失败");
                        break;
                    }
                }
            }
            debug!(lease_id = lease, "续租已停止");
        });

        Ok(KeepAliveStream::new(rx))
    }

    async fn revoke(&self, lease: LeaseId) -> CronResult<()> {
        let revoked = self
            .shared
            .invoke(&self.shared.scripts.revoke, &[int_arg(lease)])
            .await?
            .flag()?;
        if revoked {
            debug!(lease_id = lease, "租约已撤销");
            Ok(())
        } else {
            Err(CronError::LeaseNotFound(lease))
        }
    }

    async fn watch(&self, prefix: &str, from_revision: Option<Revision>) -> CronResult<WatchStream> {
        let mut conn = self.shared.conn.clone();
        let (current, compacted): (Option<i64>, Option<i64>) = redis::cmd("MGET")
            .arg(&self.shared.keys.revision)
            .arg(&self.shared.keys.compacted)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        let compacted = compacted.unwrap_or(0);

        let from = match from_revision {
            Some(from) if from <= compacted => {
                warn!(from, compacted, "监听的修订版本已被压缩");
                return Err(CronError::Store(format!(
                    "修订版本{from}已被压缩，当前最早可用版本为{}",
                    compacted + 1
                )));
            }
            Some(from) => from,
            None => current.unwrap_or(0) + 1,
        };

        // 阻塞读取会占住连接，每个监听单独建一个连接
        let watch_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(
            watch_conn,
            self.shared.keys.events.clone(),
            prefix.to_string(),
            from,
            self.block_timeout,
            tx,
        ));
        Ok(WatchStream::new(rx))
    }
}

/// 从事件流读取修订版本不小于`from`的事件，按前缀过滤后转发
async fn forward_events(
    mut conn: MultiplexedConnection,
    stream: String,
    prefix: String,
    from: Revision,
    block_timeout: Duration,
    tx: mpsc::UnboundedSender<WatchEvent>,
) {
    let mut last_id = format!("{}-0", from.max(1) - 1);
    let options = StreamReadOptions::default()
        .block(block_timeout.as_millis() as usize)
        .count(256);

    while !tx.is_closed() {
        let reply: Option<StreamReadReply> = match conn
            .xread_options(&[&stream], &[&last_id], &options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "读取事件流失败，监听断开");
                return;
            }
        };

        for entry in reply.into_iter().flat_map(|r| r.keys).flat_map(|k| k.ids) {
            last_id = entry.id.clone();
            match decode_stream_event(&entry) {
                Some(event) if event.kv.key.starts_with(&prefix) => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Some(_) => {}
                None => warn!(id = %entry.id, "无法解析事件流记录，跳过"),
            }
        }
    }
    debug!(prefix = %prefix, "监听已关闭");
}

fn decode_stream_event(entry: &StreamId) -> Option<WatchEvent> {
    let event_type = match entry.get::<String>("type")?.as_str() {
        "put" => WatchEventType::Put,
        "delete" => WatchEventType::Delete,
        _ => return None,
    };

    Some(WatchEvent {
        event_type,
        kv: KeyValue {
            key: entry.get("key")?,
            value: entry.get("value").unwrap_or_default(),
            create_revision: entry.get("create")?,
            mod_revision: entry.get("mod")?,
            lease: entry.get::<i64>("lease").filter(|id| *id != 0),
        },
    })
}

fn encode_txn(txn: &Txn) -> Vec<Vec<u8>> {
    let mut args = vec![int_arg(txn.compare.len() as i64)];
    for compare in &txn.compare {
        match compare {
            Compare::CreateRevision { key, revision } => {
                args.push(key.as_bytes().to_vec());
                args.push(int_arg(*revision));
            }
        }
    }

    for ops in [&txn.success, &txn.failure] {
        args.push(int_arg(ops.len() as i64));
        for op in ops {
            let (kind, key, value, lease) = match op {
                TxnOp::Put { key, value, lease } => ("put", key, value.clone(), lease.unwrap_or(0)),
                TxnOp::Get { key } => ("get", key, Vec::new(), 0),
                TxnOp::Delete { key } => ("delete", key, Vec::new(), 0),
            };
            args.push(kind.as_bytes().to_vec());
            args.push(key.as_bytes().to_vec());
            args.push(value);
            args.push(int_arg(lease));
        }
    }
    args
}

fn decode_range(mut reply: Reply) -> CronResult<GetResponse> {
    let revision = reply.int()?;
    let mut kvs = Vec::new();
    while !reply.is_empty() {
        kvs.push(reply.key_value()?);
    }
    Ok(GetResponse { revision, kvs })
}

fn decode_txn(mut reply: Reply) -> CronResult<TxnResponse> {
    reply.status()?;
    let succeeded = reply.flag()?;
    let revision = reply.int()?;

    let mut responses = Vec::new();
    while !reply.is_empty() {
        let kind = reply.string()?;
        let op_revision = reply.int()?;
        let kv = reply.optional_key_value()?;
        responses.push(match kind.as_str() {
            "put" => TxnOpResponse::Put(PutResponse {
                revision: op_revision,
                prev_kv: kv,
            }),
            "get" => TxnOpResponse::Get(GetResponse {
                revision: op_revision,
                kvs: kv.into_iter().collect(),
            }),
            "delete" => TxnOpResponse::Delete(DeleteResponse {
                revision: op_revision,
                deleted: i64::from(kv.is_some()),
                prev_kvs: kv.into_iter().collect(),
            }),
            other => return Err(CronError::Store(format!("未知的事务操作应答: {other}"))),
        });
    }

    Ok(TxnResponse {
        succeeded,
        revision,
        responses,
    })
}

/// 脚本返回的扁平字符串数组
struct Reply {
    items: std::vec::IntoIter<Vec<u8>>,
}

impl Reply {
    fn new(items: Vec<Vec<u8>>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    fn is_empty(&self) -> bool {
        self.items.len() == 0
    }

    fn bytes(&mut self) -> CronResult<Vec<u8>> {
        self.items
            .next()
            .ok_or_else(|| CronError::Store("Redis脚本应答不完整".to_string()))
    }

    fn string(&mut self) -> CronResult<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| CronError::Store(format!("Redis脚本应答不是UTF-8: {e}")))
    }

    fn int(&mut self) -> CronResult<i64> {
        let text = self.string()?;
        text.parse()
            .map_err(|_| CronError::Store(format!("Redis脚本应答不是整数: {text}")))
    }

    fn flag(&mut self) -> CronResult<bool> {
        Ok(self.int()? != 0)
    }

    /// 脚本执行状态，租约不存在时整个操作未生效
    fn status(&mut self) -> CronResult<()> {
        match self.string()?.as_str() {
            "ok" => Ok(()),
            "lease_not_found" => Err(CronError::LeaseNotFound(self.int()?)),
            other => Err(CronError::Store(format!("未知的脚本状态: {other}"))),
        }
    }

    fn key_value(&mut self) -> CronResult<KeyValue> {
        let key = self.string()?;
        let value = self.bytes()?;
        let create_revision = self.int()?;
        let mod_revision = self.int()?;
        let lease = self.int()?;
        Ok(KeyValue {
            key,
            value,
            create_revision,
            mod_revision,
            lease: (lease != 0).then_some(lease),
        })
    }

    fn optional_key_value(&mut self) -> CronResult<Option<KeyValue>> {
        if self.flag()? {
            self.key_value().map(Some)
        } else {
            Ok(None)
        }
    }
}

fn int_arg(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

fn store_error(e: redis::RedisError) -> CronError {
    CronError::Store(format!("Redis错误: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;
    use std::collections::HashMap;

    fn reply(items: &[&str]) -> Reply {
        Reply::new(items.iter().map(|s| s.as_bytes().to_vec()).collect())
    }

    fn stream_entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::BulkString(v.as_bytes().to_vec())))
                .collect::<HashMap<_, _>>(),
            ..StreamId::default()
        }
    }

    #[test]
    fn test_keys_share_namespace() {
        let keys = Keys::new("crond-test:");
        assert_eq!(keys.revision, "crond-test:revision");
        assert!(keys
            .script_keys()
            .iter()
            .all(|key| key.starts_with("crond-test:")));
    }

    #[test]
    fn test_encode_txn_layout() {
        let txn = Txn::new()
            .when(Compare::key_absent("lock/a"))
            .and_then(TxnOp::put("lock/a", b"me".to_vec(), Some(7)))
            .or_else(TxnOp::get("lock/a"));

        let args: Vec<String> = encode_txn(&txn)
            .into_iter()
            .map(|a| String::from_utf8(a).unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "1", "lock/a", "0", // 比较条件
                "1", "put", "lock/a", "me", "7", // 成功分支
                "1", "get", "lock/a", "", "0", // 失败分支
            ]
        );
    }

    #[test]
    fn test_decode_range() {
        let resp = decode_range(reply(&[
            "12", "jobs/a", "{}", "3", "9", "0", "jobs/b", "", "10", "10", "4",
        ]))
        .unwrap();

        assert_eq!(resp.revision, 12);
        assert_eq!(resp.kvs.len(), 2);
        assert_eq!(resp.kvs[0].key, "jobs/a");
        assert_eq!(resp.kvs[0].value, b"{}".to_vec());
        assert_eq!(resp.kvs[0].lease, None);
        assert_eq!(resp.kvs[1].create_revision, 10);
        assert_eq!(resp.kvs[1].lease, Some(4));
        assert!(resp.kvs[1].value.is_empty());
    }

    #[test]
    fn test_decode_failed_txn_returns_current_holder() {
        let resp = decode_txn(reply(&[
            "ok", "0", "20", "get", "20", "1", "lock/a", "node-1", "18", "18", "3",
        ]))
        .unwrap();

        assert!(!resp.succeeded);
        assert_eq!(resp.revision, 20);
        match &resp.responses[0] {
            TxnOpResponse::Get(get) => {
                assert_eq!(get.kvs[0].value, b"node-1".to_vec());
                assert_eq!(get.kvs[0].lease, Some(3));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_decode_txn_lease_not_found() {
        let err = decode_txn(reply(&["lease_not_found", "42"])).unwrap_err();
        assert!(matches!(err, CronError::LeaseNotFound(42)));
    }

    #[test]
    fn test_truncated_reply_is_an_error() {
        assert!(decode_range(reply(&["5", "jobs/a", "{}"])).is_err());
        assert!(decode_range(reply(&["not-a-number"])).is_err());
    }

    #[test]
    fn test_decode_stream_events() {
        let put = stream_entry(
            "7-0",
            &[
                ("type", "put"),
                ("key", "job-kill-requests/job1"),
                ("value", ""),
                ("create", "7"),
                ("mod", "7"),
                ("lease", "3"),
            ],
        );
        let event = decode_stream_event(&put).unwrap();
        assert_eq!(event.event_type, WatchEventType::Put);
        assert_eq!(event.kv.key, "job-kill-requests/job1");
        assert_eq!(event.kv.create_revision, event.kv.mod_revision);
        assert_eq!(event.kv.lease, Some(3));

        let delete = stream_entry(
            "8-0",
            &[
                ("type", "delete"),
                ("key", "job-definitions/job1"),
                ("value", ""),
                ("create", "0"),
                ("mod", "8"),
                ("lease", "0"),
            ],
        );
        let event = decode_stream_event(&delete).unwrap();
        assert_eq!(event.event_type, WatchEventType::Delete);
        assert_eq!(event.kv.mod_revision, 8);
        assert_eq!(event.kv.lease, None);

        let unknown = stream_entry("9-0", &[("type", "expire"), ("key", "x")]);
        assert!(decode_stream_event(&unknown).is_none());
    }
}
