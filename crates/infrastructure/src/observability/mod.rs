//! Observability module
//!
//! 指标名称与记录函数。指标通过 `metrics` 门面记录，
//! 二进制在启动时安装 Prometheus 导出器后即可抓取。

pub mod metrics_collector;
