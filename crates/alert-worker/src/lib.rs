//! 告警通知服务
//!
//! 从 Kafka 消费告警事件，经模板渲染生成渠道专属负载后推送到
//! Discord / Slack / 邮件。渲染或发送失败时降级为一条概要告警，
//! 降级发送也失败则记录日志后放弃该条消息。

pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod providers;
pub mod renderer;
