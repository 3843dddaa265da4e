//! Discord Webhook 渠道
//!
//! 将 JSON 负载 POST 到一个或多个 Webhook 地址。单个地址失败不阻止
//! 其余地址的尝试，整体结果是所有地址结果的逻辑与。

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use alert_shared::config::DiscordConfig;

use crate::error::DispatchError;
use crate::renderer::Rendered;

use super::{ContentKind, Destination, Metadata, Payload, Provider, ProviderKind, fallback_message};

pub struct DiscordProvider {
    http: reqwest::Client,
    config: DiscordConfig,
}

impl DiscordProvider {
    pub fn new(http: reqwest::Client, config: DiscordConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl Provider for DiscordProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Discord
    }

    fn content_kind(&self) -> ContentKind {
        ContentKind::Json
    }

    fn default_destination(&self) -> Option<Destination> {
        self.config.webhook_url.clone().map(Destination::Single)
    }

    fn format_payload(&self, rendered: Rendered, _metadata: &Metadata) -> Payload {
        match rendered {
            Rendered::Structured(value) => Payload::Json(value),
            // 文本先尝试按 JSON 解析；失败则降级保留原始字符串，
            // 由 send 的类型校验做最终拦截
            Rendered::Text(text) => match serde_json::from_str(&text) {
                Ok(value) => Payload::Json(value),
                Err(e) => {
                    warn!(error = %e, "渲染文本不是合法 JSON，降级为原始字符串");
                    Payload::Json(Value::String(text))
                }
            },
        }
    }

    fn fallback_payload(&self, error: &DispatchError, context: &Value) -> Payload {
        Payload::Json(json!({ "content": fallback_message(error, context) }))
    }

    async fn send(&self, destination: &Destination, payload: &Payload) -> bool {
        let Payload::Json(body) = payload else {
            error!("Discord 负载类型不匹配，拒绝发送");
            return false;
        };
        if !body.is_object() {
            error!("Discord 负载必须是 JSON 对象，拒绝发送");
            return false;
        }

        let mut all_ok = true;
        for dest in destination.list() {
            match self.http.post(dest).json(body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(status = %resp.status(), "Discord 消息发送成功");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    error!(%status, response = %text, "Discord 消息发送失败");
                    all_ok = false;
                }
                Err(e) => {
                    error!(error = %e, "Discord 请求异常");
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}
