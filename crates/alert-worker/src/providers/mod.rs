//! 多渠道通知提供方
//!
//! 通过 `Provider` trait 抽象渠道能力：模板命名规则、负载格式化、
//! 降级负载构造和实际发送。各渠道（Discord、Slack、邮件）提供独立实现，
//! 以 `Arc<dyn Provider>` 注册到一个以封闭枚举 `ProviderKind` 为键的
//! 注册表中，未注册的渠道键是一等的配置错误而非静默空值。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use alert_shared::config::ProvidersConfig;

use crate::error::DispatchError;
use crate::renderer::Rendered;

pub mod discord;
pub mod email;
pub mod slack;

pub use discord::DiscordProvider;
pub use email::EmailProvider;
pub use slack::SlackProvider;

// ---------------------------------------------------------------------------
// 渠道与内容类型
// ---------------------------------------------------------------------------

/// 通知渠道的封闭集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Discord,
    Slack,
    Email,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Email => "email",
        }
    }

    /// 从消息中的渠道键解析；未知键返回 `None`，由调用方按配置错误处理
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discord" => Some(Self::Discord),
            "slack" => Some(Self::Slack),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 渠道期望的模板内容类型
///
/// 显式的"渠道 -> 模板后缀"对照表，代替临时的字符串拼接。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Html,
}

impl ContentKind {
    pub fn template_suffix(&self) -> &'static str {
        match self {
            Self::Json => ".json.j2",
            Self::Html => ".html.j2",
        }
    }

    /// 渲染结果是否需要按 JSON 解析
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Json)
    }
}

// ---------------------------------------------------------------------------
// 目的地 / 元数据 / 负载
// ---------------------------------------------------------------------------

/// 通知目的地：单个地址或地址列表
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Destination {
    Single(String),
    Many(Vec<String>),
}

impl Destination {
    /// 统一视为地址列表；单个地址等价于单元素列表
    pub fn list(&self) -> Vec<&str> {
        match self {
            Self::Single(addr) => vec![addr.as_str()],
            Self::Many(addrs) => addrs.iter().map(String::as_str).collect(),
        }
    }
}

/// 从 `data` 的保留 `_meta` 子对象提取的元数据
///
/// 只进入负载格式化阶段，绝不进入模板渲染上下文。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// 渠道自定义的其他元数据
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// 渠道专属负载
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Discord/Slack 的 Webhook JSON 体
    Json(Value),
    /// 邮件信封
    Email(EmailPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailPayload {
    pub subject: String,
    pub body: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// 通知渠道能力抽象
///
/// 实现必须无内部可变状态，可被多个并发分发同时调用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn content_kind(&self) -> ContentKind;

    /// 渠道配置的默认目的地，消息未指定 destination 时使用
    fn default_destination(&self) -> Option<Destination>;

    /// 按内容类型对照表补全模板名；已带 `.j2` 后缀的名称原样返回
    fn apply_template_rules(&self, name: &str) -> String {
        if name.ends_with(".j2") {
            name.to_string()
        } else {
            format!("{name}{}", self.content_kind().template_suffix())
        }
    }

    /// 将渲染结果与元数据组装为渠道负载；此步骤不失败，
    /// 类型不匹配的情况降级处理并由 `send` 做最终校验
    fn format_payload(&self, rendered: Rendered, metadata: &Metadata) -> Payload;

    /// 构造降级负载：错误摘要 + 原始上下文（topic/partition/offset 与请求数据）
    fn fallback_payload(&self, error: &DispatchError, context: &Value) -> Payload;

    /// 发送负载到目的地（列表则逐个发送），返回整体是否成功
    async fn send(&self, destination: &Destination, payload: &Payload) -> bool;
}

/// 根据配置构建渠道注册表
///
/// 出站超时是显式配置项，统一应用到 HTTP 客户端与 SMTP 传输。
pub fn build_registry(
    config: &ProvidersConfig,
) -> Result<HashMap<ProviderKind, Arc<dyn Provider>>, DispatchError> {
    let timeout = Duration::from_secs(config.send_timeout_seconds);
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DispatchError::Configuration(format!("构建 HTTP 客户端失败: {e}")))?;

    let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
    providers.insert(
        ProviderKind::Discord,
        Arc::new(DiscordProvider::new(http.clone(), config.discord.clone())),
    );
    providers.insert(
        ProviderKind::Slack,
        Arc::new(SlackProvider::new(http, config.slack.clone())),
    );
    providers.insert(
        ProviderKind::Email,
        Arc::new(EmailProvider::from_config(&config.email, timeout)),
    );
    Ok(providers)
}

/// Discord/Slack 共用的降级消息文本
pub(crate) fn fallback_message(error: &DispatchError, context: &Value) -> String {
    let data_json =
        serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
    format!(
        "⚠️ **Alert Rendering Failed**\nError: `{error}`\nRaw Data:\n```json\n{data_json}\n```"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("discord"), Some(ProviderKind::Discord));
        assert_eq!(ProviderKind::parse("slack"), Some(ProviderKind::Slack));
        assert_eq!(ProviderKind::parse("email"), Some(ProviderKind::Email));
        assert_eq!(ProviderKind::parse("telegram"), None);
        assert_eq!(ProviderKind::parse(""), None);
    }

    #[test]
    fn test_content_kind_suffix_table() {
        assert_eq!(ContentKind::Json.template_suffix(), ".json.j2");
        assert_eq!(ContentKind::Html.template_suffix(), ".html.j2");
        assert!(ContentKind::Json.is_structured());
        assert!(!ContentKind::Html.is_structured());
    }

    #[test]
    fn test_destination_deserialize_single_or_list() {
        let single: Destination = serde_json::from_value(json!("https://hook")).unwrap();
        assert_eq!(single.list(), vec!["https://hook"]);

        let many: Destination = serde_json::from_value(json!(["a@x.com", "b@x.com"])).unwrap();
        assert_eq!(many.list(), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn test_metadata_deserialize_with_extra_keys() {
        let meta: Metadata = serde_json::from_value(json!({
            "subject": "告警",
            "cc": ["cc@x.com"],
            "bcc": ["bcc@x.com"],
            "priority": "high"
        }))
        .unwrap();

        assert_eq!(meta.subject.as_deref(), Some("告警"));
        assert_eq!(meta.cc, vec!["cc@x.com"]);
        assert_eq!(meta.bcc, vec!["bcc@x.com"]);
        assert_eq!(meta.extra.get("priority"), Some(&json!("high")));
    }

    #[test]
    fn test_metadata_defaults_when_empty() {
        let meta: Metadata = serde_json::from_value(json!({})).unwrap();
        assert!(meta.subject.is_none());
        assert!(meta.cc.is_empty());
        assert!(meta.bcc.is_empty());
    }

    #[test]
    fn test_fallback_message_contains_error_and_data() {
        let err = DispatchError::Configuration("boom".to_string());
        let context = json!({"topic": "lsm", "foo": "bar"});
        let msg = fallback_message(&err, &context);

        assert!(msg.contains("Alert Rendering Failed"));
        assert!(msg.contains("boom"));
        assert!(msg.contains("\"foo\""));
    }

    #[tokio::test]
    async fn test_build_registry_contains_all_kinds() {
        let registry = build_registry(&ProvidersConfig::default()).unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains_key(&ProviderKind::Discord));
        assert!(registry.contains_key(&ProviderKind::Slack));
        assert!(registry.contains_key(&ProviderKind::Email));
    }
}
