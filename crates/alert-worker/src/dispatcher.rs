//! 通知分发器
//!
//! 将一条解码后的消息值编排为一次投递：解析渠道与目的地、拆分
//! 渲染上下文与元数据、渲染模板、格式化负载、发送。渲染或主发送
//! 失败时构造并发送一次降级通知；降级也失败则记录后放弃，
//! 绝不产生第二次降级尝试。
//!
//! 配置类问题（渠道缺失/未注册、目的地无法解析、模板引用缺失）
//! 只记录日志并丢弃请求，既不发送也不向调用方抛错。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use alert_shared::kafka::ConsumerMessage;

use crate::error::DispatchError;
use crate::providers::{Destination, Metadata, Provider, ProviderKind};
use crate::renderer::{Rendered, TemplateRenderer};

/// `data` 中承载元数据的保留子键
pub const META_KEY: &str = "_meta";

/// 入站通知请求
///
/// 从 Kafka 消息的 JSON 值反序列化而来，仅在单次分发内存活。
#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub template_content: Option<String>,
    #[serde(default)]
    pub destination: Option<Destination>,
    #[serde(default)]
    pub data: Value,
}

/// 消息来源，用于降级通知中的上下文定位
#[derive(Debug, Clone)]
pub struct MessageOrigin {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl MessageOrigin {
    pub fn of(msg: &ConsumerMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
        }
    }
}

/// 通知分发器
///
/// 由应用入口显式构造并注入各回调，无全局单例。
/// 渠道实例无状态，多个并发分发可安全共享。
pub struct NotificationDispatcher {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    renderer: TemplateRenderer,
}

impl NotificationDispatcher {
    pub fn new(
        providers: HashMap<ProviderKind, Arc<dyn Provider>>,
        renderer: TemplateRenderer,
    ) -> Self {
        Self {
            providers,
            renderer,
        }
    }

    /// 处理一条通知请求
    ///
    /// 任何失败都在内部消化：配置错误直接丢弃，管道错误走降级路径。
    pub async fn process(&self, value: &Value, origin: &MessageOrigin) {
        let request: NotificationRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(e) => {
                error!(topic = %origin.topic, error = %e, "通知请求结构非法，丢弃");
                return;
            }
        };

        let Some(provider_name) = request.provider.as_deref() else {
            error!(topic = %origin.topic, "请求缺少 provider 字段，丢弃");
            return;
        };
        let Some(kind) = ProviderKind::parse(provider_name) else {
            error!(provider = provider_name, "未知的通知渠道，丢弃");
            return;
        };
        let Some(provider) = self.providers.get(&kind) else {
            error!(provider = %kind, "渠道未注册，丢弃");
            return;
        };

        // 显式目的地优先，其次渠道默认值
        let Some(destination) = request
            .destination
            .clone()
            .or_else(|| provider.default_destination())
        else {
            error!(provider = %kind, "无法解析通知目的地，丢弃");
            return;
        };

        if request.template.is_none() && request.template_content.is_none() {
            error!(provider = %kind, "请求既无 template 也无 template_content，丢弃");
            return;
        }

        let (context, metadata) = split_context(&request.data);

        match self
            .run_pipeline(provider.as_ref(), &request, &destination, &context, &metadata)
            .await
        {
            Ok(()) => {
                info!(provider = %kind, "通知发送成功");
            }
            Err(e) => {
                error!(provider = %kind, error = %e, "通知处理失败，尝试发送降级通知");
                self.send_fallback(provider.as_ref(), &destination, &e, &request.data, origin)
                    .await;
            }
        }
    }

    /// 渲染 -> 格式化 -> 发送
    async fn run_pipeline(
        &self,
        provider: &dyn Provider,
        request: &NotificationRequest,
        destination: &Destination,
        context: &Map<String, Value>,
        metadata: &Metadata,
    ) -> Result<(), DispatchError> {
        let rendered = self.render(provider, request, context)?;
        let payload = provider.format_payload(rendered, metadata);

        if provider.send(destination, &payload).await {
            Ok(())
        } else {
            Err(DispatchError::Delivery {
                provider: provider.kind(),
            })
        }
    }

    fn render(
        &self,
        provider: &dyn Provider,
        request: &NotificationRequest,
        context: &Map<String, Value>,
    ) -> Result<Rendered, DispatchError> {
        if let Some(content) = &request.template_content {
            // 内联模板直接渲染，结构化与否取决于渠道的内容类型
            let structured = provider.content_kind().is_structured();
            Ok(self.renderer.render_from_string(content, context, structured)?)
        } else if let Some(name) = &request.template {
            let full_name = provider.apply_template_rules(name);
            Ok(self.renderer.render(&full_name, context)?)
        } else {
            // process 已校验过模板存在，此处仅作兜底
            Err(DispatchError::Configuration(
                "缺少 template 或 template_content".to_string(),
            ))
        }
    }

    /// 发送降级通知，至多一次；失败即放弃该条消息
    async fn send_fallback(
        &self,
        provider: &dyn Provider,
        destination: &Destination,
        error: &DispatchError,
        data: &Value,
        origin: &MessageOrigin,
    ) {
        let context = fallback_context(data, origin);
        let payload = provider.fallback_payload(error, &context);

        if provider.send(destination, &payload).await {
            info!(provider = %provider.kind(), "降级通知发送成功");
        } else {
            // 该消息已无法送达；不重试，不回写队列
            error!(
                provider = %provider.kind(),
                topic = %origin.topic,
                partition = origin.partition,
                offset = origin.offset,
                "降级通知发送失败，消息丢失"
            );
        }
    }
}

/// 拆分渲染上下文与元数据
///
/// `_meta` 子对象解析为 `Metadata`；所有下划线前缀的保留键
/// 都从渲染上下文移除。非对象的 `data` 包装到 `data` 键下。
fn split_context(data: &Value) -> (Map<String, Value>, Metadata) {
    let Some(obj) = data.as_object() else {
        let mut context = Map::new();
        if !data.is_null() {
            context.insert("data".to_string(), data.clone());
        }
        return (context, Metadata::default());
    };

    let metadata = obj
        .get(META_KEY)
        .map(|meta| {
            serde_json::from_value(meta.clone()).unwrap_or_else(|e| {
                warn!(error = %e, "元数据结构非法，按空元数据处理");
                Metadata::default()
            })
        })
        .unwrap_or_default();

    let context: Map<String, Value> = obj
        .iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    (context, metadata)
}

/// 构造降级通知的上下文：消息来源定位 + 原始请求数据
fn fallback_context(data: &Value, origin: &MessageOrigin) -> Value {
    let mut context = Map::new();
    context.insert("topic".to_string(), Value::String(origin.topic.clone()));
    context.insert("partition".to_string(), origin.partition.into());
    context.insert("offset".to_string(), origin.offset.into());
    context.insert(
        "occurred_at".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );

    match data.as_object() {
        Some(obj) => {
            for (key, value) in obj {
                context.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        None if !data.is_null() => {
            context.insert("data".to_string(), data.clone());
        }
        None => {}
    }

    Value::Object(context)
}
