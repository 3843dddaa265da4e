//! 统一错误处理模块
//!
//! 定义共享层的错误类型，使用 thiserror 提供良好的错误信息。
//! 业务侧（渲染、分发）的错误在 alert-worker 中单独定义。

use thiserror::Error;

/// 共享层错误类型
#[derive(Debug, Error)]
pub enum AlertError {
    /// Kafka 连接、订阅或收发失败
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    /// 配置缺失或非法
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 回调处理消息时返回的业务错误
    #[error("回调执行失败: {0}")]
    Callback(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, AlertError>;

impl From<config::ConfigError> for AlertError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let kafka_err = AlertError::Kafka("连接被拒绝".to_string());
        assert_eq!(kafka_err.to_string(), "Kafka 错误: 连接被拒绝");

        let config_err = AlertError::Configuration("缺少 brokers".to_string());
        assert_eq!(config_err.to_string(), "配置错误: 缺少 brokers");

        let callback_err = AlertError::Callback("handler panic".to_string());
        assert_eq!(callback_err.to_string(), "回调执行失败: handler panic");
    }
}
