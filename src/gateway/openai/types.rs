use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `/v1/chat/completions` 请求体。
///
/// 只对代理需要的字段建模，其余字段通过 `extra` 原样转发给上游。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// 所有消息的文本片段，供 token 估算使用。
    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_ref())
            .flat_map(|c| c.text_parts())
    }

    /// 流式请求强制 `stream_options.include_usage = true`，保留调用方的其它选项。
    pub fn force_include_usage(&mut self) {
        let opts = self
            .stream_options
            .get_or_insert_with(|| Value::Object(Map::new()));
        if !opts.is_object() {
            *opts = Value::Object(Map::new());
        }
        if let Some(obj) = opts.as_object_mut() {
            obj.insert("include_usage".to_string(), Value::Bool(true));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 消息内容：纯文本，或多模态分段列表。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// 所有文本片段；多模态内容只取 `type == "text"` 的分段。
    pub fn text_parts(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(s) => vec![s.as_str()],
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 上游响应中的 usage 对象（缓冲与流式共用）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// 缓冲响应体里只关心 usage。
#[derive(Debug, Default, Deserialize)]
pub struct CompletionEnvelope {
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// 流式 `data:` 帧中代理关心的部分。
#[derive(Debug, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Option<StreamDelta>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}
