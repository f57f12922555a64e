//! # 数据模型
//!
//! 定义分布式定时任务系统中流转的核心数据结构。
//!
//! ## 核心模型
//!
//! ### Job - 任务定义
//! 以名称为唯一键的shell命令 + cron表达式 + 超时时间，JSON形式保存在协调存储中。
//!
//! ### JobEvent - 任务事件
//! 事件管道推送给调度器的瞬时消息：保存、删除、强杀。
//!
//! ### JobLog - 执行日志
//! 每次执行后生成、交给日志存储批量写入的记录。
//!
//! ### AlertInfo - 告警信息
//! 超时、执行出错、强制杀死三类告警，由leader节点统一投递。

pub mod alert;
pub mod job;
pub mod job_log;

pub use alert::*;
pub use job::*;
pub use job_log::*;
