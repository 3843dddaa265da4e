//! Slack Webhook 渠道
//!
//! 发送机制与 Discord 相同；区别在于对非对象负载的处理：
//! Slack 将其包装为 `{"text": …}` 而不是拒绝发送。

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use alert_shared::config::SlackConfig;

use crate::error::DispatchError;
use crate::renderer::Rendered;

use super::{ContentKind, Destination, Metadata, Payload, Provider, ProviderKind, fallback_message};

pub struct SlackProvider {
    http: reqwest::Client,
    config: SlackConfig,
}

impl SlackProvider {
    pub fn new(http: reqwest::Client, config: SlackConfig) -> Self {
        Self { http, config }
    }
}

/// 将任意 JSON 值包装为 Slack 可接受的消息体
fn wrap_as_text(value: &Value) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({ "text": text })
}

#[async_trait]
impl Provider for SlackProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Slack
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
        Payload::Json(json!({ "text": fallback_message(error, context) }))
    }

    async fn send(&self, destination: &Destination, payload: &Payload) -> bool {
        let Payload::Json(value) = payload else {
            error!("Slack 负载类型不匹配，拒绝发送");
            return false;
        };
        let body = if value.is_object() {
            value.clone()
        } else {
            wrap_as_text(value)
        };

        let mut all_ok = true;
        for dest in destination.list() {
            match self.http.post(dest).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(status = %resp.status(), "Slack 消息发送成功");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    error!(%status, response = %text, "Slack 消息发送失败");
                    all_ok = false;
                }
                Err(e) => {
                    error!(error = %e, "Slack 请求异常");
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider() -> SlackProvider {
        SlackProvider::new(reqwest::Client::new(), SlackConfig::default())
    }

    #[test]
    fn test_apply_template_rules_appends_json_suffix() {
        assert_eq!(provider().apply_template_rules("alert"), "alert.json.j2");
    }

    #[test]
    fn test_fallback_payload_has_text_field() {
        let err = DispatchError::Configuration("boom".to_string());
        let Payload::Json(value) = provider().fallback_payload(&err, &json!({"a": 1})) else {
            panic!("应为 JSON 负载");
        };
        assert!(value["text"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_send_wraps_non_object_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({"text": "plain message"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider();
        let dest = Destination::Single(format!("{}/hook", server.uri()));
        let ok = p
            .send(&dest, &Payload::Json(Value::String("plain message".to_string())))
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_send_multiple_destinations_all_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider();
        let dest = Destination::Many(vec![
            format!("{}/a", server.uri()),
            format!("{}/b", server.uri()),
        ]);
        let ok = p.send(&dest, &Payload::Json(json!({"text": "hi"}))).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_send_failure_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider();
        let dest = Destination::Single(format!("{}/hook", server.uri()));
        let ok = p.send(&dest, &Payload::Json(json!({"text": "hi"}))).await;
        assert!(!ok);
    }
}
