use serde::{Deserialize, Serialize};

/// 模型目录中的一项。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub name: String,
    pub active: bool,
    /// 上下文窗口大小；未知时为 `None`，由调用方使用默认值。
    pub context_length: Option<i64>,
    /// 参数量标注（如 `21B`），仅用于展示。
    pub parameters: Option<String>,
}

impl ModelDescriptor {
    pub fn new(model_id: impl Into<String>, context_length: Option<i64>) -> Self {
        let model_id = model_id.into();
        Self {
            name: model_id.clone(),
            model_id,
            active: true,
            context_length,
            parameters: None,
        }
    }
}

/// 上游 `GET /models` 列表中的一项。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamModel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// 部分上游以浮点数或字符串给出，解析时再规整。
    #[serde(default)]
    pub context_length: Option<serde_json::Value>,
}

impl UpstreamModel {
    pub fn context_length(&self) -> Option<i64> {
        match self.context_length.as_ref()? {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .filter(|v| *v > 0),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok().filter(|v| *v > 0),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpstreamModelList {
    #[serde(default)]
    pub data: Vec<UpstreamModel>,
}
