//! 告警分发错误类型
//!
//! 区分配置错误（丢弃请求，不触发降级）、渲染错误和投递失败
//! （两者触发一次降级发送），便于分发器决定后续动作。

use thiserror::Error;

use crate::providers::ProviderKind;

/// 模板渲染错误
///
/// 三个变体必须可区分：模板不存在、渲染/语法失败、
/// 结构化模板的渲染结果不是合法 JSON。
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("模板未找到: {name}")]
    TemplateNotFound { name: String },

    #[error("模板渲染失败: {0}")]
    Render(String),

    #[error("渲染结果不是合法 JSON: {0}")]
    InvalidJson(String),
}

/// 分发管道错误
#[derive(Debug, Error)]
pub enum DispatchError {
    /// 渠道缺失/未注册、目的地无法解析、模板引用缺失等配置问题
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    /// 主发送失败（HTTP 非 2xx、SMTP 提交失败等）
    #[error("通知发送失败: 渠道={provider}")]
    Delivery { provider: ProviderKind },
}
