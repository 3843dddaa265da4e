//! 告警回调注册
//!
//! 将分发器包装为 Kafka 消息回调，并在启动前按配置的 topic 列表
//! 注册到管理器。不存在于集群中的 topic 会在 `start()` 时被过滤。

use std::sync::Arc;

use tracing::info;

use alert_shared::kafka::{ConsumerMessage, KafkaManager, MessageHandler};

use crate::dispatcher::{MessageOrigin, NotificationDispatcher};

/// 构造一个把消息值转交给分发器的回调
pub fn alert_handler(dispatcher: Arc<NotificationDispatcher>) -> MessageHandler {
    Arc::new(move |msg: Arc<ConsumerMessage>| {
        let dispatcher = Arc::clone(&dispatcher);
        Box::pin(async move {
            // 反序列化失败的消息（value 为 None）已在消费循环被跳过，
            // 此处判空仅作兜底
            if let Some(value) = &msg.value {
                let origin = MessageOrigin::of(&msg);
                dispatcher.process(value, &origin).await;
            }
            Ok(())
        })
    })
}

/// 为每个配置的告警 topic 注册分发回调
pub fn register_alert_handlers(
    manager: &mut KafkaManager,
    dispatcher: Arc<NotificationDispatcher>,
    topics: &[String],
) {
    for topic in topics {
        manager.register_callback(topic, "alert", alert_handler(Arc::clone(&dispatcher)));
    }
    info!(count = topics.len(), "告警回调注册完成");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::build_registry;
    use crate::renderer::TemplateRenderer;
    use alert_shared::config::{KafkaConfig, ProvidersConfig};
    use tempfile::TempDir;

    fn test_dispatcher() -> (TempDir, Arc<NotificationDispatcher>) {
        let dir = TempDir::new().unwrap();
        let renderer = TemplateRenderer::new(dir.path());
        let providers = build_registry(&ProvidersConfig::default()).unwrap();
        (dir, Arc::new(NotificationDispatcher::new(providers, renderer)))
    }

    #[tokio::test]
    async fn test_register_alert_handlers_covers_all_topics() {
        let (_dir, dispatcher) = test_dispatcher();
        let mut manager = KafkaManager::new(KafkaConfig::default());

        let topics = vec!["lsm".to_string(), "heartbeat".to_string()];
        register_alert_handlers(&mut manager, dispatcher, &topics);

        let subscribed = manager.subscribed_topics();
        assert_eq!(subscribed.len(), 2);
        assert!(subscribed.contains(&"lsm".to_string()));
        assert!(subscribed.contains(&"heartbeat".to_string()));
    }

    #[tokio::test]
    async fn test_alert_handler_skips_message_without_value() {
        let (_dir, dispatcher) = test_dispatcher();
        let handler = alert_handler(dispatcher);

        let msg = Arc::new(ConsumerMessage {
            topic: "lsm".to_string(),
            partition: 0,
            offset: 1,
            key: None,
            value: None,
        });
        assert!(handler(msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_alert_handler_drops_unknown_provider_without_error() {
        // 未知渠道由分发器内部消化，回调本身不返回错误
        let (_dir, dispatcher) = test_dispatcher();
        let handler = alert_handler(dispatcher);

        let msg = Arc::new(ConsumerMessage {
            topic: "lsm".to_string(),
            partition: 0,
            offset: 2,
            key: None,
            value: Some(serde_json::json!({"provider": "telegram", "template": "t"})),
        });
        assert!(handler(msg).await.is_ok());
    }
}
