use sonic_rs::{JsonContainerTrait, JsonValueTrait, Value};
use std::collections::HashMap;

pub const CLAUDE_DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// 把 Anthropic messages 请求转换为上游请求骨架。
///
/// 模型映射：默认走 `fast`；模型名含 opus / reasoner / slow 时改走
/// `slow`（若配置了）。`system` 字符串会被提为首条 system 消息；
/// 采样参数与 stop_sequences 原样带过去。
pub fn convert_claude_to_deepseek(
    claude_req: &Value,
    mapping: &HashMap<String, String>,
    default_claude_model: &str,
) -> Value {
    let model = claude_req
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(default_claude_model);

    let mut ds_model = mapping
        .get("fast")
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("deepseek-chat")
        .to_string();

    let model_lower = model.to_lowercase();
    if model_lower.contains("opus")
        || model_lower.contains("reasoner")
        || model_lower.contains("slow")
    {
        if let Some(slow) = mapping.get("slow").filter(|s| !s.is_empty()) {
            ds_model = slow.clone();
        }
    }

    let mut converted_messages: Vec<Value> = Vec::new();
    if let Some(system) = claude_req.get("system").and_then(|v| v.as_str())
        && !system.is_empty()
    {
        let mut sys = sonic_rs::Object::new();
        sys.insert(&"role", "system");
        sys.insert(&"content", system);
        converted_messages.push(sys.into_value());
    }
    if let Some(messages) = claude_req.get("messages").and_then(|v| v.as_array()) {
        converted_messages.extend(messages.iter().cloned());
    }

    let mut out = sonic_rs::Object::new();
    out.insert(&"model", ds_model.as_str());
    out.insert(&"messages", Value::from(converted_messages));
    for key in ["temperature", "top_p", "stream"] {
        if let Some(v) = claude_req.get(key) {
            out.insert(&key, v.clone());
        }
    }
    if let Some(stop) = claude_req.get("stop_sequences") {
        out.insert(&"stop", stop.clone());
    }
    out.into_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> HashMap<String, String> {
        [
            ("fast".to_string(), "deepseek-chat".to_string()),
            ("slow".to_string(), "deepseek-reasoner".to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn system_becomes_first_message() {
        let req: Value = sonic_rs::from_str(
            r#"{"model":"claude-opus-4-6","system":"You are helpful","messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        )
        .unwrap();
        let out = convert_claude_to_deepseek(&req, &mapping(), CLAUDE_DEFAULT_MODEL);
        let msgs = out.get("messages").unwrap().as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            msgs[0].get("role").and_then(|v| v.as_str()),
            Some("system")
        );
        assert_eq!(out.get("stream").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn opus_maps_to_slow_model() {
        let req: Value = sonic_rs::from_str(
            r#"{"model":"claude-opus-4-6","messages":[{"role":"user","content":"Hi"}]}"#,
        )
        .unwrap();
        let out = convert_claude_to_deepseek(&req, &mapping(), CLAUDE_DEFAULT_MODEL);
        assert_eq!(
            out.get("model").and_then(|v| v.as_str()),
            Some("deepseek-reasoner")
        );
    }

    #[test]
    fn fast_is_default_and_missing_model_uses_default() {
        let req: Value =
            sonic_rs::from_str(r#"{"messages":[{"role":"user","content":"Hi"}]}"#).unwrap();
        let out = convert_claude_to_deepseek(&req, &mapping(), CLAUDE_DEFAULT_MODEL);
        assert_eq!(
            out.get("model").and_then(|v| v.as_str()),
            Some("deepseek-chat")
        );
    }

    #[test]
    fn stop_sequences_renamed_to_stop() {
        let req: Value = sonic_rs::from_str(
            r#"{"model":"claude-sonnet-4-5","messages":[],"stop_sequences":["\n\n"]}"#,
        )
        .unwrap();
        let out = convert_claude_to_deepseek(&req, &mapping(), CLAUDE_DEFAULT_MODEL);
        assert!(out.get("stop").is_some());
    }
}
