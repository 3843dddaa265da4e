//! 告警通知服务入口
//!
//! 加载配置、初始化日志，显式构造渲染器/渠道注册表/分发器/Kafka
//! 管理器并完成依赖注入，随后启动消费并等待退出信号。

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use alert_shared::config::{AppConfig, ObservabilityConfig};
use alert_shared::kafka::KafkaManager;
use alert_worker::dispatcher::NotificationDispatcher;
use alert_worker::handlers::register_alert_handlers;
use alert_worker::providers::build_registry;
use alert_worker::renderer::TemplateRenderer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("alert-worker")?;
    init_tracing(&config.observability);

    info!(
        service = %config.service_name,
        environment = %config.environment,
        "启动告警通知服务"
    );

    let renderer = TemplateRenderer::new(&config.templates.dir);
    let providers = build_registry(&config.providers)?;
    let dispatcher = Arc::new(NotificationDispatcher::new(providers, renderer));

    let mut manager = KafkaManager::new(config.kafka.clone());
    register_alert_handlers(&mut manager, dispatcher, &config.kafka.alert_topics);

    // 连接失败在此处传播，进程直接退出
    manager.start().await?;

    info!(topics = ?manager.subscribed_topics(), "服务已启动，等待退出信号");
    tokio::signal::ctrl_c().await?;

    info!("收到退出信号，开始优雅关闭");
    manager.stop().await;
    info!("服务已退出");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}
