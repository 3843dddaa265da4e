//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的管理器抽象，
//! 统一消息反序列化、按 topic 的回调扇出、错误映射和优雅关闭语义。
//!
//! 一个 `KafkaManager` 实例持有一对生产者/消费者句柄。回调在 `start()`
//! 之前注册；启动时配置的 topic 会按集群快照过滤，不存在的 topic
//! 的回调被丢弃，永远不会触发。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::AlertError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有 Kafka topic 名称，防止字符串散落在各模块中导致拼写不一致
pub mod topics {
    pub const LSM_EVENTS: &str = "lsm";
    pub const DETECTION_RESULTS: &str = "detection-result";
    pub const HEARTBEAT: &str = "heartbeat";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步回调。负载在此处即完成 JSON
/// 反序列化；失败时 `value` 为 `None`，由消费循环跳过而不是中断。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Option<serde_json::Value>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            value: safe_json_deserialize(msg.topic(), msg.payload()),
        }
    }
}

/// 安全的 JSON 反序列化
///
/// 单条坏消息只记录日志并返回 `None`，绝不让消费者因此崩溃。
fn safe_json_deserialize(topic: &str, raw: Option<&[u8]>) -> Option<serde_json::Value> {
    let raw = raw?;
    match serde_json::from_slice(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(topic, error = %e, len = raw.len(), "消息负载反序列化失败");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// 回调类型
// ---------------------------------------------------------------------------

/// 回调返回的装箱 Future
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send>>;

/// 消息处理回调
///
/// 以 `Arc` 共享以便在每条消息上派生独立任务执行。
pub type MessageHandler = Arc<dyn Fn(Arc<ConsumerMessage>) -> HandlerFuture + Send + Sync>;

/// 带名称的回调，名称仅用于日志定位
#[derive(Clone)]
pub struct NamedHandler {
    pub name: String,
    pub handler: MessageHandler,
}

// ---------------------------------------------------------------------------
// KafkaManager
// ---------------------------------------------------------------------------

/// Kafka 生产者/消费者生命周期管理器
///
/// 由应用入口显式构造并注入，不使用进程级单例。
pub struct KafkaManager {
    config: KafkaConfig,
    callbacks: HashMap<String, Vec<NamedHandler>>,
    producer: Option<FutureProducer>,
    consumer_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl KafkaManager {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            callbacks: HashMap::new(),
            producer: None,
            consumer_task: None,
            shutdown_tx: None,
        }
    }

    /// 为指定 topic 注册一个消息回调
    ///
    /// 必须在 `start()` 之前调用；启动之后注册的回调不会被补订阅。
    pub fn register_callback(&mut self, topic: &str, name: &str, handler: MessageHandler) {
        if self.consumer_task.is_some() {
            warn!(topic, name, "消费任务已启动，此回调不会被订阅");
        }
        info!(topic, name, "注册消息回调");
        self.callbacks.entry(topic.to_string()).or_default().push(NamedHandler {
            name: name.to_string(),
            handler,
        });
    }

    /// 当前注册了回调的 topic 列表
    ///
    /// `start()` 之后反映过滤后的实际订阅状态：集群中不存在的 topic
    /// 已连同其回调一起被移除。
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.callbacks.keys().cloned().collect()
    }

    /// 启动生产者与消费者，并在后台运行消费任务
    ///
    /// 连接失败（无法获取集群元数据）是致命错误，向调用方传播。
    /// 没有注册任何回调或过滤后没有可订阅 topic 时，消费者不启动。
    pub async fn start(&mut self) -> Result<(), AlertError> {
        info!(brokers = %self.config.brokers, "连接 Kafka 集群");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| AlertError::Kafka(format!("创建生产者失败: {e}")))?;
        info!("Kafka 生产者已初始化");

        if self.callbacks.is_empty() {
            info!("未注册任何回调，跳过消费者启动");
            self.producer = Some(producer);
            return Ok(());
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.consumer_group)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| AlertError::Kafka(format!("创建消费者失败: {e}")))?;

        // 启动时对集群 topic 做一次快照；之后创建的 topic 不会被动态感知
        let metadata = consumer
            .fetch_metadata(None, Duration::from_secs(10))
            .map_err(|e| AlertError::Kafka(format!("获取集群元数据失败: {e}")))?;
        let cluster_topics: HashSet<String> = metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        debug!(count = cluster_topics.len(), "集群 topic 快照完成");

        let configured: Vec<String> = self.callbacks.keys().cloned().collect();
        let (present, absent) = partition_topics(&configured, &cluster_topics);

        for topic in &absent {
            error!(topic, "配置的 topic 在集群中不存在，移除其回调且不会订阅");
            self.callbacks.remove(topic);
        }

        if present.is_empty() {
            info!("过滤后没有可订阅的 topic，跳过消费者启动");
            self.producer = Some(producer);
            return Ok(());
        }

        let topic_refs: Vec<&str> = present.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| AlertError::Kafka(format!("订阅 topic 失败: {e}")))?;
        info!(topics = ?present, "Kafka 消费者已订阅");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let callbacks = Arc::new(self.callbacks.clone());
        self.consumer_task = Some(tokio::spawn(run_consumer(consumer, callbacks, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        self.producer = Some(producer);
        Ok(())
    }

    /// 停止消费任务、消费者和生产者，按此顺序；重复调用是幂等的
    pub async fn stop(&mut self) {
        info!("断开 Kafka 连接");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.consumer_task.take() {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!(error = %e, "消费任务异常退出");
            }
            // 消费者句柄随任务结束一起释放
            info!("Kafka 消费者已停止");
        }
        if self.producer.take().is_some() {
            info!("Kafka 生产者已停止");
        }
    }

    /// 发送消息并等待 broker 确认
    ///
    /// 返回消息落盘的 (partition, offset)；发送失败向调用方传播。
    pub async fn send_message<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), AlertError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| AlertError::Kafka(format!("消息序列化失败: {e}")))?;
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        let delivery = self
            .producer()?
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| AlertError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送并确认"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将消息放入发送队列后立即返回，不等待 broker 确认
    pub fn send_message_async<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(), AlertError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| AlertError::Kafka(format!("消息序列化失败: {e}")))?;
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        // 丢弃交付 future，投递结果由 librdkafka 后台处理
        self.producer()?
            .send_result(record)
            .map_err(|(e, _)| AlertError::Kafka(format!("消息入队失败: {e}")))?;

        debug!(topic, key, "消息已入队");
        Ok(())
    }

    fn producer(&self) -> Result<&FutureProducer, AlertError> {
        self.producer
            .as_ref()
            .ok_or_else(|| AlertError::Kafka("生产者未启动或已停止".to_string()))
    }
}

/// 将配置的 topic 按集群快照拆分为 {存在, 不存在} 两组
fn partition_topics(
    configured: &[String],
    cluster_topics: &HashSet<String>,
) -> (Vec<String>, Vec<String>) {
    let (present, absent): (Vec<String>, Vec<String>) = configured
        .iter()
        .cloned()
        .partition(|t| cluster_topics.contains(t));
    (present, absent)
}

// ---------------------------------------------------------------------------
// 消费循环
// ---------------------------------------------------------------------------

/// 后台消费循环
///
/// 使用 `tokio::select!` 同时监听消息流和关闭信号：
/// - 单条消息的所有回调并发执行，且在全部结束之前不拉取下一条消息，
///   保证消息 N 与 N+1 的回调执行不重叠。
/// - 关闭信号变为 `true` 时退出循环，正在执行的回调自然完成。
async fn run_consumer(
    consumer: StreamConsumer,
    callbacks: Arc<HashMap<String, Vec<NamedHandler>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    use futures::StreamExt;

    let stream = consumer.stream();
    futures::pin_mut!(stream);

    info!("Kafka 消费循环已启动");

    loop {
        tokio::select! {
            // 偏向关闭信号，保证收到关闭时能尽快退出
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("收到关闭信号，Kafka 消费循环退出");
                    break;
                }
            }

            msg_result = stream.next() => {
                let Some(msg_result) = msg_result else {
                    warn!("Kafka 消息流意外结束");
                    break;
                };

                match msg_result {
                    Ok(borrowed_msg) => {
                        let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                        if msg.value.is_none() {
                            debug!(topic = %msg.topic, offset = msg.offset, "跳过反序列化失败的消息");
                            continue;
                        }

                        debug!(
                            topic = %msg.topic,
                            partition = msg.partition,
                            offset = msg.offset,
                            key = ?msg.key,
                            "收到 Kafka 消息"
                        );

                        if let Some(handlers) = callbacks.get(&msg.topic) {
                            fan_out(handlers, Arc::new(msg)).await;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "接收 Kafka 消息出错");
                    }
                }
            }
        }
    }

    info!("Kafka 消费循环已结束");
}

/// 对一条消息并发执行其全部回调，并显式等待全部结束
///
/// 每个回调在独立任务中执行；单个回调的错误或 panic 只记录日志，
/// 不影响同级回调，也不中断消费循环。
async fn fan_out(handlers: &[NamedHandler], msg: Arc<ConsumerMessage>) {
    let tasks: Vec<_> = handlers
        .iter()
        .map(|h| {
            let name = h.name.clone();
            let handler = Arc::clone(&h.handler);
            let msg = Arc::clone(&msg);
            tokio::spawn(async move { (name, handler(msg).await) })
        })
        .collect();

    for joined in join_all(tasks).await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(e))) => {
                error!(
                    callback = %name,
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "回调执行失败"
                );
            }
            Err(e) => {
                error!(topic = %msg.topic, error = %e, "回调任务异常退出");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_msg| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn failing_handler() -> MessageHandler {
        Arc::new(|_msg| {
            Box::pin(async { Err(AlertError::Callback("预期内的失败".to_string())) })
        })
    }

    fn make_message(topic: &str) -> Arc<ConsumerMessage> {
        Arc::new(ConsumerMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 42,
            key: Some("key-1".to_string()),
            value: Some(serde_json::json!({"event": "login"})),
        })
    }

    #[test]
    fn test_topic_constants() {
        assert_eq!(topics::LSM_EVENTS, "lsm");
        assert_eq!(topics::DETECTION_RESULTS, "detection-result");
        assert_eq!(topics::HEARTBEAT, "heartbeat");
    }

    #[test]
    fn test_safe_deserialize_valid_json() {
        let value = safe_json_deserialize("t", Some(br#"{"a":1}"#));
        assert_eq!(value, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_safe_deserialize_invalid_json_returns_none() {
        assert!(safe_json_deserialize("t", Some(b"not json")).is_none());
        assert!(safe_json_deserialize("t", Some(&[0xFF, 0xFE])).is_none());
        assert!(safe_json_deserialize("t", None).is_none());
    }

    #[test]
    fn test_register_and_subscribed_topics() {
        let mut manager = KafkaManager::new(KafkaConfig::default());
        assert!(manager.subscribed_topics().is_empty());

        let counter = Arc::new(AtomicUsize::new(0));
        manager.register_callback("lsm", "alert", counting_handler(Arc::clone(&counter)));
        manager.register_callback("lsm", "audit", counting_handler(counter));

        let topics = manager.subscribed_topics();
        assert_eq!(topics, vec!["lsm".to_string()]);
        assert_eq!(manager.callbacks.get("lsm").unwrap().len(), 2);
    }

    #[test]
    fn test_partition_topics() {
        let cluster: HashSet<String> =
            ["lsm", "heartbeat"].iter().map(|s| s.to_string()).collect();
        let configured = vec![
            "lsm".to_string(),
            "missing-topic".to_string(),
            "heartbeat".to_string(),
        ];

        let (present, absent) = partition_topics(&configured, &cluster);
        assert_eq!(present, vec!["lsm".to_string(), "heartbeat".to_string()]);
        assert_eq!(absent, vec!["missing-topic".to_string()]);
    }

    #[tokio::test]
    async fn test_fan_out_runs_all_handlers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handlers = vec![
            NamedHandler {
                name: "first".to_string(),
                handler: counting_handler(Arc::clone(&counter)),
            },
            NamedHandler {
                name: "second".to_string(),
                handler: counting_handler(Arc::clone(&counter)),
            },
        ];

        fan_out(&handlers, make_message("lsm")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failing_handler() {
        // 一个回调失败不影响同级回调的执行
        let counter = Arc::new(AtomicUsize::new(0));
        let handlers = vec![
            NamedHandler {
                name: "broken".to_string(),
                handler: failing_handler(),
            },
            NamedHandler {
                name: "working".to_string(),
                handler: counting_handler(Arc::clone(&counter)),
            },
        ];

        fan_out(&handlers, make_message("lsm")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fan_out_isolates_panicking_handler() {
        // panic 被任务边界吸收，记录为 JoinError，不波及消费循环
        let counter = Arc::new(AtomicUsize::new(0));
        let panicking: MessageHandler = Arc::new(|_msg| {
            Box::pin(async {
                panic!("回调 panic");
            })
        });
        let handlers = vec![
            NamedHandler {
                name: "panicking".to_string(),
                handler: panicking,
            },
            NamedHandler {
                name: "working".to_string(),
                handler: counting_handler(Arc::clone(&counter)),
            },
        ];

        fan_out(&handlers, make_message("lsm")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_message_without_start_fails() {
        let manager = KafkaManager::new(KafkaConfig::default());
        let result = manager
            .send_message("lsm", "key", &serde_json::json!({"a": 1}))
            .await;
        assert!(matches!(result, Err(AlertError::Kafka(_))));

        let result = manager.send_message_async("lsm", "key", &serde_json::json!({"a": 1}));
        assert!(matches!(result, Err(AlertError::Kafka(_))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_before_start() {
        let mut manager = KafkaManager::new(KafkaConfig::default());
        manager.stop().await;
        manager.stop().await;
        assert!(manager.producer.is_none());
        assert!(manager.consumer_task.is_none());
    }
}
