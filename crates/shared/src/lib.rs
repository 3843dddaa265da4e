//! 共享库
//!
//! 包含告警系统各组件共用的配置、错误处理和 Kafka 基础设施代码。

pub mod config;
pub mod error;
pub mod kafka;
