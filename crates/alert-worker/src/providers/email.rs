//! 邮件渠道
//!
//! 通过 SMTP 提交 HTML 邮件。头部只写 To/Cc；Bcc 地址绝不出现在
//! 任何头部，但始终包含在传输层的信封收件人集合中
//! （To ∪ Cc ∪ Bcc，去重）。SMTP 提交经由 `MailTransport` 接缝，
//! 便于在测试中验证信封与报文而无需真实服务器。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::Value;
use tracing::{error, info};

use alert_shared::config::EmailConfig;

use crate::error::DispatchError;
use crate::renderer::Rendered;

use super::{ContentKind, Destination, EmailPayload, Metadata, Payload, Provider, ProviderKind};

/// 主题解析链的最后一级：元数据 -> 配置默认值 -> 此字面量
const DEFAULT_SUBJECT: &str = "Alert Notification";

// ---------------------------------------------------------------------------
// SMTP 传输接缝
// ---------------------------------------------------------------------------

/// SMTP 提交抽象
///
/// 信封与已格式化的报文分开传入，使头部收件人与信封收件人可以不同。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn submit(&self, envelope: Envelope, message: Vec<u8>) -> Result<(), String>;
}

/// 基于 lettre 的真实 SMTP 传输
pub struct SmtpMailTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Self {
        let inner = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
            .port(config.smtp_port)
            .timeout(Some(timeout))
            .build();
        Self { inner }
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn submit(&self, envelope: Envelope, message: Vec<u8>) -> Result<(), String> {
        self.inner
            .send_raw(&envelope, &message)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// EmailProvider
// ---------------------------------------------------------------------------

pub struct EmailProvider {
    transport: Arc<dyn MailTransport>,
    config: EmailConfig,
}

impl EmailProvider {
    pub fn new(transport: Arc<dyn MailTransport>, config: EmailConfig) -> Self {
        Self { transport, config }
    }

    pub fn from_config(config: &EmailConfig, timeout: Duration) -> Self {
        Self::new(
            Arc::new(SmtpMailTransport::new(config, timeout)),
            config.clone(),
        )
    }

    /// 构造 MIME 报文与 SMTP 信封
    ///
    /// 头部只含 To/Cc；信封收件人为 To ∪ Cc ∪ Bcc 去重后的集合。
    fn build_message(
        &self,
        to: &[&str],
        mail: &EmailPayload,
    ) -> Result<(Envelope, Vec<u8>), String> {
        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| format!("发件人地址非法 '{}': {e}", self.config.from))?;

        let mut builder = Message::builder()
            .from(from.clone())
            .subject(mail.subject.clone())
            .header(ContentType::TEXT_HTML);
        for addr in to {
            builder = builder.to(parse_mailbox(addr)?);
        }
        for addr in &mail.cc {
            builder = builder.cc(parse_mailbox(addr)?);
        }
        // Bcc 地址故意不写入任何头部
        let message = builder
            .body(mail.body.clone())
            .map_err(|e| format!("构造邮件失败: {e}"))?;

        let mut seen = HashSet::new();
        let mut recipients: Vec<Address> = Vec::new();
        for addr in to
            .iter()
            .copied()
            .chain(mail.cc.iter().map(String::as_str))
            .chain(mail.bcc.iter().map(String::as_str))
        {
            if seen.insert(addr.to_string()) {
                recipients.push(
                    addr.parse()
                        .map_err(|e| format!("收件人地址非法 '{addr}': {e}"))?,
                );
            }
        }
        let envelope = Envelope::new(Some(from.email), recipients)
            .map_err(|e| format!("构造信封失败: {e}"))?;

        Ok((envelope, message.formatted()))
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, String> {
    addr.parse()
        .map_err(|e| format!("邮件地址非法 '{addr}': {e}"))
}

#[async_trait]
impl Provider for EmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Email
    }

    fn content_kind(&self) -> ContentKind {
        ContentKind::Html
    }

    fn default_destination(&self) -> Option<Destination> {
        self.config.default_to.clone().map(Destination::Single)
    }

    fn format_payload(&self, rendered: Rendered, metadata: &Metadata) -> Payload {
        let body = match rendered {
            Rendered::Text(text) => text,
            Rendered::Structured(value) => value.to_string(),
        };
        let subject = metadata
            .subject
            .clone()
            .or_else(|| self.config.default_subject.clone())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

        Payload::Email(EmailPayload {
            subject,
            body,
            cc: metadata.cc.clone(),
            bcc: metadata.bcc.clone(),
        })
    }

    fn fallback_payload(&self, error: &DispatchError, context: &Value) -> Payload {
        let data_json =
            serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
        Payload::Email(EmailPayload {
            subject: "[Error] Alert Rendering Failed".to_string(),
            body: format!(
                "<h3>⚠️ Alert Rendering Failed</h3><p>Error: {error}</p><pre>{data_json}</pre>"
            ),
            cc: Vec::new(),
            bcc: Vec::new(),
        })
    }

    async fn send(&self, destination: &Destination, payload: &Payload) -> bool {
        let Payload::Email(mail) = payload else {
            error!("Email 负载类型不匹配，拒绝发送");
            return false;
        };

        let to = destination.list();
        match self.build_message(&to, mail) {
            Ok((envelope, bytes)) => match self.transport.submit(envelope, bytes).await {
                Ok(()) => {
                    info!(subject = %mail.subject, recipients = to.len(), "邮件发送成功");
                    true
                }
                Err(e) => {
                    error!(error = %e, "邮件发送失败");
                    false
                }
            },
            Err(e) => {
                error!(error = %e, "构造邮件失败");
                false
            }
        }
    }
}
