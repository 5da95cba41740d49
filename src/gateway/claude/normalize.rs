use crate::claudeconv::{CLAUDE_DEFAULT_MODEL, convert_claude_to_deepseek};
use crate::config::{Store, get_model_config};
use crate::error::AppError;
use crate::gateway::standard::StandardRequest;
use crate::prompt;
use crate::toolcall::{ToolSpec, build_tool_prompt};
use sonic_rs::{JsonContainerTrait, JsonValueTrait, Value};
use std::collections::HashMap;

fn obj() -> sonic_rs::Object {
    sonic_rs::Object::new()
}

fn text_message(role: &str, content: &str) -> Value {
    let mut m = obj();
    m.insert(&"role", role);
    m.insert(&"content", content);
    m.into_value()
}

/// 把 Anthropic 内容块整平为纯文本消息：
/// - text 块拼接
/// - assistant 的 tool_use 块渲染为文本协议
/// - user 的 tool_result 块渲染为 "Tool result" 文本
/// - thinking 块丢弃（不回灌给上游）
pub fn normalize_claude_messages(raw: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(raw.len());
    for msg in raw {
        if !msg.is_object() {
            continue;
        }
        let role = msg
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let content = msg.get("content");

        let Some(content) = content else { continue };
        if let Some(s) = content.as_str() {
            out.push(text_message(&role, s));
            continue;
        }
        let Some(blocks) = content.as_array() else {
            let text = prompt::normalize_content(content);
            if !text.is_empty() {
                out.push(text_message(&role, &text));
            }
            continue;
        };

        let mut parts: Vec<String> = Vec::new();
        for block in blocks.iter() {
            let block_type = block
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_lowercase();
            match block_type.as_str() {
                "text" => {
                    if let Some(t) = block.get("text").and_then(|v| v.as_str())
                        && !t.is_empty()
                    {
                        parts.push(t.to_string());
                    }
                }
                "tool_use" => {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("unknown");
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let input = block
                        .get("input")
                        .map(|v| sonic_rs::to_string(v).unwrap_or_else(|_| "{}".to_string()))
                        .unwrap_or_else(|| "{}".to_string());
                    parts.push(format!(
                        "Tool call:\n- tool_call_id: {id}\n- function.name: {name}\n- function.arguments: {input}"
                    ));
                }
                "tool_result" => {
                    let id = block
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let content_text = block
                        .get("content")
                        .map(|v| prompt::normalize_content(v))
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "null".to_string());
                    parts.push(format!(
                        "Tool result:\n- tool_call_id: {id}\n- content: {content_text}"
                    ));
                }
                // thinking / redacted_thinking 等不回灌
                _ => {}
            }
        }
        if parts.is_empty() {
            continue;
        }
        out.push(text_message(&role, &parts.join("\n\n")));
    }
    out
}

/// Anthropic tools 字段 → 统一工具描述。
pub fn extract_claude_tools(req: &Value) -> Vec<ToolSpec> {
    let Some(tools) = req.get("tools").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(tools.len());
    for t in tools.iter() {
        let name = t
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if name.is_empty() {
            continue;
        }
        out.push(ToolSpec {
            name,
            description: t
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            schema: t.get("input_schema").cloned(),
        });
    }
    out
}

pub struct ClaudeNormalized {
    pub standard: StandardRequest,
    pub normalized_messages: Vec<Value>,
}

/// `/v1/messages` 归一化。必填：model、messages。
pub fn normalize_claude_request(store: &Store, req: &Value) -> Result<ClaudeNormalized, AppError> {
    let model = req.get("model").and_then(|v| v.as_str()).unwrap_or("").trim();
    if model.is_empty() {
        return Err(AppError::bad_request_param(
            "请求必须包含 model 与 messages",
            "model",
        ));
    }
    let messages: Vec<Value> = req
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().cloned().collect())
        .unwrap_or_default();
    if messages.is_empty() {
        return Err(AppError::bad_request_param(
            "请求必须包含 model 与 messages",
            "messages",
        ));
    }

    let normalized = normalize_claude_messages(&messages);
    let tools = extract_claude_tools(req);

    // 带工具且没有任何 system 指令时，注入工具协议提示
    let has_system = req
        .get("system")
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
        || normalized
            .iter()
            .any(|m| m.get("role").and_then(|v| v.as_str()) == Some("system"));
    let mut messages_for_upstream = normalized.clone();
    if !tools.is_empty() && !has_system {
        messages_for_upstream.insert(0, text_message("system", &build_tool_prompt(&tools)));
    }

    let mut conv_req = obj();
    conv_req.insert(&"model", model);
    if let Some(system) = req.get("system") {
        conv_req.insert(&"system", system.clone());
    }
    conv_req.insert(&"messages", Value::from(messages_for_upstream));
    for key in ["temperature", "top_p", "stream"] {
        if let Some(v) = req.get(key) {
            conv_req.insert(&key, v.clone());
        }
    }
    if let Some(stop) = req.get("stop_sequences") {
        conv_req.insert(&"stop_sequences", stop.clone());
    }

    let ds_payload = convert_claude_to_deepseek(
        &conv_req.into_value(),
        &store.claude_mapping(),
        CLAUDE_DEFAULT_MODEL,
    );
    let ds_model = ds_payload
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("deepseek-chat")
        .to_string();
    let ds_messages: Vec<Value> = ds_payload
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().cloned().collect())
        .unwrap_or_default();

    let (thinking, search, _) = get_model_config(&ds_model);
    let final_prompt = prompt::messages_prepare(&ds_messages);

    let mut passthrough: HashMap<String, Value> = HashMap::new();
    // Anthropic 必填 max_tokens，缺省补 8192 以兼容严格客户端
    passthrough.insert(
        "max_tokens".to_string(),
        req.get("max_tokens")
            .cloned()
            .unwrap_or_else(|| sonic_rs::from_str("8192").unwrap_or_default()),
    );

    Ok(ClaudeNormalized {
        standard: StandardRequest {
            surface: "anthropic_messages",
            requested_model: model.to_string(),
            resolved_model: ds_model,
            response_model: model.to_string(),
            messages: ds_messages,
            final_prompt,
            tool_names: tools.into_iter().map(|t| t.name).collect(),
            stream: req.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            thinking,
            search,
            passthrough,
        },
        normalized_messages: normalized,
    })
}
