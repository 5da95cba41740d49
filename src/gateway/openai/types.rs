use serde::Serialize;
use sonic_rs::Value;

/// chat.completion.chunk 流式载荷。
#[derive(Debug, Clone, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: i32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reasoning_content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
}

impl ChatChunk {
    pub fn new(id: &str, created: i64, model: &str, delta: Delta) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn finish(id: &str, created: i64, model: &str, finish_reason: &str, usage: Value) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: Some(usage),
        }
    }

    pub fn to_json(&self) -> String {
        sonic_rs::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_delta_fields_are_omitted() {
        let chunk = ChatChunk::new(
            "cid",
            123,
            "deepseek-chat",
            Delta {
                content: "hi".into(),
                ..Delta::default()
            },
        );
        let json = chunk.to_json();
        assert!(json.contains(r#""content":"hi""#));
        assert!(!json.contains("role"));
        assert!(!json.contains("reasoning_content"));
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("finish_reason"));
        assert!(!json.contains("usage"));
    }

    #[test]
    fn finish_chunk_has_reason_and_usage() {
        let chunk = ChatChunk::finish(
            "cid",
            123,
            "deepseek-chat",
            "stop",
            sonic_rs::from_str(r#"{"total_tokens":1}"#).unwrap(),
        );
        let json = chunk.to_json();
        assert!(json.contains(r#""finish_reason":"stop""#));
        assert!(json.contains("total_tokens"));
    }
}
