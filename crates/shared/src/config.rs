//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    /// 需要注册告警回调的 topic 列表；启动时会按集群实际存在的 topic 过滤
    pub alert_topics: Vec<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "alert-group".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30_000,
            alert_topics: vec![
                crate::kafka::topics::LSM_EVENTS.to_string(),
                crate::kafka::topics::DETECTION_RESULTS.to_string(),
                crate::kafka::topics::HEARTBEAT.to_string(),
            ],
        }
    }
}

/// Discord 渠道配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordConfig {
    /// 未在消息中指定 destination 时使用的默认 Webhook 地址
    pub webhook_url: Option<String>,
}

/// Slack 渠道配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: Option<String>,
}

/// 邮件渠道配置
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub from: String,
    /// 未在消息中指定 destination 时使用的默认收件人
    pub default_to: Option<String>,
    /// 元数据未携带 subject 时使用的默认主题
    pub default_subject: Option<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 25,
            from: "alert-system@example.com".to_string(),
            default_to: None,
            default_subject: None,
        }
    }
}

/// 通知渠道配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub discord: DiscordConfig,
    pub slack: SlackConfig,
    pub email: EmailConfig,
    /// 出站 HTTP/SMTP 发送超时（秒）。显式配置而非依赖传输层默认值
    pub send_timeout_seconds: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            discord: DiscordConfig::default(),
            slack: SlackConfig::default(),
            email: EmailConfig::default(),
            send_timeout_seconds: 10,
        }
    }
}

/// 模板配置
#[derive(Debug, Clone, Deserialize)]
pub struct TemplatesConfig {
    pub dir: String,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            dir: "templates".to_string(),
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub kafka: KafkaConfig,
    pub providers: ProvidersConfig,
    pub templates: TemplatesConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（ALERT_ 前缀，如 ALERT_KAFKA_BROKERS -> kafka.brokers）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("ALERT_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                Environment::with_prefix("ALERT")
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
