//! 模板渲染
//!
//! 基于 minijinja 的纯渲染层。以 `.json.j2` 结尾的模板为结构化模板，
//! 渲染结果会被解析为 JSON 值；解析失败产生与"模板不存在"、
//! "渲染失败"可区分的独立错误。

use std::path::Path;

use minijinja::{Environment, path_loader};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::RenderError;

/// 结构化模板的命名约定后缀
const STRUCTURED_SUFFIX: &str = ".json.j2";

/// 渲染结果
///
/// 结构化模板产出解析后的 JSON 值，其余模板产出文本。
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Text(String),
    Structured(Value),
}

/// 模板渲染器
///
/// 从模板目录加载命名模板，或直接渲染内联模板字符串。
/// 无内部可变状态，可被多个并发分发安全共享。
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new(template_dir: impl AsRef<Path>) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(template_dir.as_ref()));
        Self { env }
    }

    /// 渲染命名模板
    ///
    /// 模板名以 `.json.j2` 结尾时解析渲染结果为 JSON。
    pub fn render(&self, name: &str, context: &Map<String, Value>) -> Result<Rendered, RenderError> {
        let template = self.env.get_template(name).map_err(|e| {
            if e.kind() == minijinja::ErrorKind::TemplateNotFound {
                error!(template = name, "模板未找到");
                RenderError::TemplateNotFound {
                    name: name.to_string(),
                }
            } else {
                error!(template = name, error = %e, "模板加载失败");
                RenderError::Render(e.to_string())
            }
        })?;

        let rendered = template
            .render(minijinja::Value::from_serialize(context))
            .map_err(|e| {
                error!(template = name, error = %e, "模板渲染失败");
                RenderError::Render(e.to_string())
            })?;

        if name.ends_with(STRUCTURED_SUFFIX) {
            parse_structured(name, &rendered)
        } else {
            Ok(Rendered::Text(rendered))
        }
    }

    /// 渲染内联模板字符串，语义与 `render` 相同但没有查找步骤
    pub fn render_from_string(
        &self,
        content: &str,
        context: &Map<String, Value>,
        structured: bool,
    ) -> Result<Rendered, RenderError> {
        let rendered = self
            .env
            .render_str(content, minijinja::Value::from_serialize(context))
            .map_err(|e| {
                error!(error = %e, "内联模板渲染失败");
                RenderError::Render(e.to_string())
            })?;

        if structured {
            parse_structured("<inline>", &rendered)
        } else {
            Ok(Rendered::Text(rendered))
        }
    }
}

fn parse_structured(source: &str, rendered: &str) -> Result<Rendered, RenderError> {
    serde_json::from_str(rendered)
        .map(Rendered::Structured)
        .map_err(|e| {
            error!(source, error = %e, "渲染结果不是合法 JSON");
            debug!(source, rendered, "非法的渲染输出");
            RenderError::InvalidJson(e.to_string())
        })
}
