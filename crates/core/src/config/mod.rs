//! 配置管理
//!
//! 配置按 默认值 → TOML配置文件 → `CROND_` 前缀环境变量 的顺序合并，
//! 加载完成后逐节校验，任何一节校验失败都会在启动阶段直接报错退出。
//!
//! ```rust,no_run
//! use crond_core::config::AppConfig;
//!
//! let config = AppConfig::load(Some("config/crond.toml")).unwrap();
//! println!("lock ttl: {}s", config.store.lock_ttl_seconds);
//! ```

pub mod models;

pub use models::*;
