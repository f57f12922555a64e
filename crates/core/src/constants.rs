//! 协调存储中的命名空间前缀及通用常量

/// leader选举目录
pub const LEADER_ELECTION_DIR: &str = "leader-election/";
/// master锁的key，所有节点争抢同一个key
pub const MASTER_LOCK_KEY: &str = "leader-election/master";

/// 任务定义保存目录
pub const JOB_SAVE_DIR: &str = "job-definitions/";
/// 任务删除标记目录（带租约，自动过期）
pub const JOB_DELETE_DIR: &str = "job-delete-markers/";
/// 强杀任务请求目录（带租约，自动过期）
pub const JOB_KILL_DIR: &str = "job-kill-requests/";
/// 任务执行锁目录
pub const JOB_LOCK_DIR: &str = "job-execution-locks/";
/// worker注册目录
pub const JOB_WORKER_DIR: &str = "worker-registry/";
/// 告警投递队列目录
pub const ALERT_QUEUE_DIR: &str = "alert-queue/";

/// 分布式锁默认租约时长（秒）
pub const DEFAULT_LOCK_TTL_SECONDS: i64 = 5;
/// worker注册租约时长（秒）
pub const DEFAULT_REGISTER_TTL_SECONDS: i64 = 10;
/// 强杀请求租约时长（秒）
pub const DEFAULT_KILL_TTL_SECONDS: i64 = 1;
/// 租约时长上限（秒）
pub const MAX_LEASE_TTL_SECONDS: i64 = 86_400;

/// Redis默认地址
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
/// Redis中所有数据的key前缀
pub const DEFAULT_REDIS_NAMESPACE: &str = "crond:";

/// 告警时间格式
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
