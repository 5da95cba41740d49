use sonic_rs::Value;
use std::collections::HashMap;

/// 各方言请求归一化后的标准形态，整个请求生命周期只构建一次。
#[derive(Debug, Clone)]
pub struct StandardRequest {
    pub surface: &'static str,
    pub requested_model: String,
    pub resolved_model: String,
    pub response_model: String,
    pub messages: Vec<Value>,
    pub final_prompt: String,
    pub tool_names: Vec<String>,
    pub stream: bool,
    pub thinking: bool,
    pub search: bool,
    pub passthrough: HashMap<String, Value>,
}

impl StandardRequest {
    /// 上游补全请求体。passthrough 字段原样并入。
    pub fn completion_payload(&self, session_id: &str) -> Value {
        let mut obj = sonic_rs::Object::new();
        obj.insert(&"chat_session_id", session_id);
        obj.insert(&"parent_message_id", Value::default());
        obj.insert(&"prompt", self.final_prompt.as_str());
        obj.insert(&"ref_file_ids", Value::from(Vec::<Value>::new()));
        obj.insert(&"thinking_enabled", self.thinking);
        obj.insert(&"search_enabled", self.search);
        for (k, v) in &self.passthrough {
            obj.insert(&k.as_str(), v.clone());
        }
        obj.into_value()
    }

    pub fn tools_requested(&self) -> bool {
        !self.tool_names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::{JsonContainerTrait, JsonValueTrait};

    #[test]
    fn completion_payload_shape() {
        let req = StandardRequest {
            surface: "openai_chat",
            requested_model: "gpt-4o".into(),
            resolved_model: "deepseek-chat".into(),
            response_model: "gpt-4o".into(),
            messages: Vec::new(),
            final_prompt: "hello".into(),
            tool_names: Vec::new(),
            stream: true,
            thinking: false,
            search: true,
            passthrough: [(
                "temperature".to_string(),
                sonic_rs::from_str("0.7").unwrap(),
            )]
            .into_iter()
            .collect(),
        };
        let payload = req.completion_payload("sess-1");
        assert_eq!(
            payload.get("chat_session_id").and_then(|v| v.as_str()),
            Some("sess-1")
        );
        assert!(payload.get("parent_message_id").unwrap().is_null());
        assert_eq!(
            payload.get("prompt").and_then(|v| v.as_str()),
            Some("hello")
        );
        assert_eq!(
            payload.get("ref_file_ids").unwrap().as_array().unwrap().len(),
            0
        );
        assert_eq!(
            payload.get("thinking_enabled").and_then(|v| v.as_bool()),
            Some(false)
        );
        assert_eq!(
            payload.get("search_enabled").and_then(|v| v.as_bool()),
            Some(true)
        );
        assert_eq!(
            payload.get("temperature").and_then(|v| v.as_f64()),
            Some(0.7)
        );
    }
}
