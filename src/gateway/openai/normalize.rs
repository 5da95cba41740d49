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

/// 把 OpenAI 消息整平成上游能理解的纯文本消息序列：
/// - assistant 的 tool_calls 渲染为文本协议
/// - tool / function 角色变成 user 的 "Tool result" 块
/// - 数组 content 抽取文本项
pub fn normalize_messages_for_prompt(raw: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        if !item.is_object() {
            continue;
        }
        let role = item
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_lowercase();
        match role.as_str() {
            "assistant" => {
                let content =
                    prompt::normalize_content(item.get("content").unwrap_or(&Value::default()));
                let tool_calls = format_assistant_tool_calls(item);
                let combined = join_non_empty(&[content, tool_calls]);
                if combined.is_empty() {
                    continue;
                }
                out.push(text_message("assistant", &combined));
            }
            "tool" | "function" => {
                out.push(text_message("user", &format_tool_result(item)));
            }
            "user" | "system" => {
                let content =
                    prompt::normalize_content(item.get("content").unwrap_or(&Value::default()));
                out.push(text_message(&role, &content));
            }
            _ => {
                let content =
                    prompt::normalize_content(item.get("content").unwrap_or(&Value::default()));
                if content.is_empty() {
                    continue;
                }
                let role = if role.is_empty() { "user" } else { &role };
                out.push(text_message(role, &content));
            }
        }
    }
    out
}

fn format_assistant_tool_calls(msg: &Value) -> String {
    let mut entries: Vec<String> = Vec::new();

    if let Some(calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
        for (i, call) in calls.iter().enumerate() {
            if !call.is_object() {
                continue;
            }
            let mut id = call
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            if id.is_empty() {
                id = format!("call_{}", i + 1);
            }
            let mut name = call
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            let mut args = String::new();
            if let Some(function) = call.get("function").filter(|v| v.is_object()) {
                if name.is_empty() {
                    name = function
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .trim()
                        .to_string();
                }
                args = normalize_arguments(function.get("arguments"));
            }
            if name.is_empty() {
                name = "unknown".to_string();
            }
            if args.is_empty() {
                args = normalize_arguments(call.get("arguments"));
            }
            if args.is_empty() {
                args = normalize_arguments(call.get("input"));
            }
            if args.is_empty() {
                args = "{}".to_string();
            }
            entries.push(format!(
                "Tool call:\n- tool_call_id: {id}\n- function.name: {name}\n- function.arguments: {args}"
            ));
        }
    }

    // 兼容老式 function_call 字段
    if let Some(legacy) = msg.get("function_call").filter(|v| v.is_object()) {
        let mut name = legacy
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if name.is_empty() {
            name = "unknown".to_string();
        }
        let mut args = normalize_arguments(legacy.get("arguments"));
        if args.is_empty() {
            args = "{}".to_string();
        }
        entries.push(format!(
            "Tool call:\n- tool_call_id: call_legacy\n- function.name: {name}\n- function.arguments: {args}"
        ));
    }

    entries.join("\n\n")
}

fn format_tool_result(msg: &Value) -> String {
    let mut tool_call_id = msg
        .get("tool_call_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if tool_call_id.is_empty() {
        tool_call_id = msg
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
    }
    if tool_call_id.is_empty() {
        tool_call_id = "unknown".to_string();
    }

    let mut name = msg
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if name.is_empty() {
        name = "unknown".to_string();
    }

    let mut content = prompt::normalize_content(msg.get("content").unwrap_or(&Value::default()));
    if content.is_empty() {
        content = "null".to_string();
    }

    format!("Tool result:\n- tool_call_id: {tool_call_id}\n- name: {name}\n- content: {content}")
}

fn normalize_arguments(v: Option<&Value>) -> String {
    let Some(v) = v else {
        return String::new();
    };
    if let Some(s) = v.as_str() {
        return s.trim().to_string();
    }
    if v.is_null() {
        return String::new();
    }
    sonic_rs::to_string(v).unwrap_or_default()
}

fn join_non_empty(parts: &[String]) -> String {
    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// OpenAI tools 字段 → 统一工具描述。
/// 同时接受 `{type:"function",function:{...}}` 与扁平 `{name,...}`。
pub fn extract_tools(req: &Value) -> Vec<ToolSpec> {
    let Some(tools) = req.get("tools").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(tools.len());
    for t in tools.iter() {
        if !t.is_object() {
            continue;
        }
        let body = t.get("function").filter(|v| v.is_object()).unwrap_or(t);
        let name = body
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
            description: body
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            schema: body.get("parameters").cloned(),
        });
    }
    out
}

fn has_system_message(messages: &[Value]) -> bool {
    messages
        .iter()
        .any(|m| m.get("role").and_then(|v| v.as_str()) == Some("system"))
}

/// 工具提示注入 + prompt 拼装的共同收尾。
fn finish_standard_request(
    store: &Store,
    surface: &'static str,
    requested_model: &str,
    mut messages: Vec<Value>,
    tools: Vec<ToolSpec>,
    stream: bool,
    passthrough: HashMap<String, Value>,
) -> StandardRequest {
    if !tools.is_empty() && !has_system_message(&messages) {
        messages.insert(0, text_message("system", &build_tool_prompt(&tools)));
    }

    let resolved = store.resolve_model(requested_model);
    let (thinking, search, known) = get_model_config(&resolved);
    let resolved_model = if known {
        resolved
    } else {
        // 未知模型回落到 fast 映射
        store
            .claude_mapping()
            .get("fast")
            .cloned()
            .unwrap_or_else(|| "deepseek-chat".to_string())
    };
    let (thinking, search) = if known {
        (thinking, search)
    } else {
        let (t, s, _) = get_model_config(&resolved_model);
        (t, s)
    };

    let final_prompt = prompt::messages_prepare(&messages);
    StandardRequest {
        surface,
        requested_model: requested_model.to_string(),
        resolved_model,
        response_model: requested_model.to_string(),
        messages,
        final_prompt,
        tool_names: tools.into_iter().map(|t| t.name).collect(),
        stream,
        thinking,
        search,
        passthrough,
    }
}

fn collect_passthrough(req: &Value, keys: &[&str]) -> HashMap<String, Value> {
    let mut out = HashMap::new();
    for key in keys {
        if let Some(v) = req.get(*key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    out
}

const CHAT_PASSTHROUGH_KEYS: [&str; 4] = ["temperature", "top_p", "max_tokens", "stop"];

/// `/v1/chat/completions` 归一化。必填：model、messages。
pub fn normalize_chat_request(store: &Store, req: &Value) -> Result<StandardRequest, AppError> {
    let model = req.get("model").and_then(|v| v.as_str()).unwrap_or("").trim();
    if model.is_empty() {
        return Err(AppError::bad_request_param("缺少必填字段 model", "model"));
    }
    let messages: Vec<Value> = req
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().cloned().collect())
        .unwrap_or_default();
    if messages.is_empty() {
        return Err(AppError::bad_request_param(
            "缺少必填字段 messages",
            "messages",
        ));
    }

    let normalized = normalize_messages_for_prompt(&messages);
    let tools = extract_tools(req);
    let stream = req.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let passthrough = collect_passthrough(req, &CHAT_PASSTHROUGH_KEYS);

    Ok(finish_standard_request(
        store,
        "openai_chat",
        model,
        normalized,
        tools,
        stream,
        passthrough,
    ))
}

/// `/v1/responses` 归一化。必填：model 与 input|messages 之一。
pub fn normalize_responses_request(
    store: &Store,
    req: &Value,
) -> Result<StandardRequest, AppError> {
    let model = req.get("model").and_then(|v| v.as_str()).unwrap_or("").trim();
    if model.is_empty() {
        return Err(AppError::bad_request_param("缺少必填字段 model", "model"));
    }

    let mut raw_messages: Vec<Value> = Vec::new();
    if let Some(input) = req.get("input") {
        if let Some(s) = input.as_str() {
            if !s.is_empty() {
                raw_messages.push(text_message("user", s));
            }
        } else if let Some(arr) = input.as_array() {
            raw_messages.extend(arr.iter().cloned());
        }
    }
    // 宽输入兼容：标准 responses API 没有 messages 字段，默认接受
    if raw_messages.is_empty()
        && store.compat_wide_input_strict_output()
        && let Some(arr) = req.get("messages").and_then(|v| v.as_array())
    {
        raw_messages.extend(arr.iter().cloned());
    }
    if raw_messages.is_empty() {
        return Err(AppError::bad_request_param(
            "必须提供 input 或 messages",
            "input",
        ));
    }

    let normalized = normalize_messages_for_prompt(&raw_messages);
    let tools = extract_tools(req);
    let stream = req.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let passthrough = collect_passthrough(req, &CHAT_PASSTHROUGH_KEYS);

    Ok(finish_standard_request(
        store,
        "openai_responses",
        model,
        normalized,
        tools,
        stream,
        passthrough,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::parse_config_string;

    fn store() -> Store {
        Store::from_config(
            parse_config_string(r#"{"keys":["k"],"model_aliases":{"gpt-4o":"deepseek-chat"}}"#)
                .unwrap(),
        )
    }

    fn value(raw: &str) -> Value {
        sonic_rs::from_str(raw).unwrap()
    }

    #[test]
    fn chat_requires_model_and_messages() {
        let s = store();
        let err = normalize_chat_request(&s, &value(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest { .. }));

        let err = normalize_chat_request(&s, &value(r#"{"model":"gpt-4o"}"#)).unwrap_err();
        assert!(matches!(err, AppError::BadRequest { .. }));
    }

    #[test]
    fn chat_resolves_alias_and_model_config() {
        let s = store();
        let req = normalize_chat_request(
            &s,
            &value(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"stream":true}"#),
        )
        .unwrap();
        assert_eq!(req.resolved_model, "deepseek-chat");
        assert_eq!(req.response_model, "gpt-4o");
        assert!(req.stream);
        assert!(!req.thinking);
        assert_eq!(req.final_prompt, "hi");
    }

    #[test]
    fn chat_unknown_model_falls_back_to_fast_mapping() {
        let s = store();
        let req = normalize_chat_request(
            &s,
            &value(r#"{"model":"some-model","messages":[{"role":"user","content":"hi"}]}"#),
        )
        .unwrap();
        assert_eq!(req.resolved_model, "deepseek-chat");
    }

    #[test]
    fn chat_reasoner_enables_thinking() {
        let s = store();
        let req = normalize_chat_request(
            &s,
            &value(
                r#"{"model":"deepseek-reasoner","messages":[{"role":"user","content":"hi"}]}"#,
            ),
        )
        .unwrap();
        assert!(req.thinking);
        assert!(!req.search);
    }

    #[test]
    fn tools_inject_system_prompt_when_missing() {
        let s = store();
        let req = normalize_chat_request(
            &s,
            &value(
                r#"{"model":"deepseek-chat","messages":[{"role":"user","content":"hi"}],
                    "tools":[{"type":"function","function":{"name":"read_file","description":"Read","parameters":{"type":"object"}}}]}"#,
            ),
        )
        .unwrap();
        assert_eq!(req.tool_names, vec!["read_file".to_string()]);
        assert_eq!(
            req.messages[0].get("role").and_then(|v| v.as_str()),
            Some("system")
        );
        assert!(req.final_prompt.contains("tool_calls"));
    }

    #[test]
    fn tools_do_not_duplicate_existing_system() {
        let s = store();
        let req = normalize_chat_request(
            &s,
            &value(
                r#"{"model":"deepseek-chat","messages":[
                    {"role":"system","content":"custom"},
                    {"role":"user","content":"hi"}],
                    "tools":[{"type":"function","function":{"name":"t"}}]}"#,
            ),
        )
        .unwrap();
        let system_count = req
            .messages
            .iter()
            .filter(|m| m.get("role").and_then(|v| v.as_str()) == Some("system"))
            .count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn assistant_tool_calls_render_to_text_protocol() {
        let raw = vec![value(
            r#"{"role":"assistant","tool_calls":[
                {"id":"call_9","type":"function","function":{"name":"read_file","arguments":"{\"path\":\"a\"}"}}
            ]}"#,
        )];
        let out = normalize_messages_for_prompt(&raw);
        assert_eq!(out.len(), 1);
        let content = out[0].get("content").and_then(|v| v.as_str()).unwrap();
        assert!(content.contains("Tool call:"));
        assert!(content.contains("tool_call_id: call_9"));
        assert!(content.contains("function.name: read_file"));
    }

    #[test]
    fn tool_role_becomes_user_tool_result() {
        let raw = vec![value(
            r#"{"role":"tool","tool_call_id":"call_9","name":"read_file","content":"file body"}"#,
        )];
        let out = normalize_messages_for_prompt(&raw);
        assert_eq!(out[0].get("role").and_then(|v| v.as_str()), Some("user"));
        let content = out[0].get("content").and_then(|v| v.as_str()).unwrap();
        assert!(content.contains("Tool result:"));
        assert!(content.contains("file body"));
    }

    #[test]
    fn legacy_function_call_supported() {
        let raw = vec![value(
            r#"{"role":"assistant","function_call":{"name":"f","arguments":"{}"}}"#,
        )];
        let out = normalize_messages_for_prompt(&raw);
        let content = out[0].get("content").and_then(|v| v.as_str()).unwrap();
        assert!(content.contains("call_legacy"));
    }

    #[test]
    fn responses_requires_model_and_input() {
        let s = store();
        let err =
            normalize_responses_request(&s, &value(r#"{"input":"hello"}"#)).unwrap_err();
        assert!(matches!(err, AppError::BadRequest { .. }));

        let err = normalize_responses_request(&s, &value(r#"{"model":"gpt-4o"}"#)).unwrap_err();
        assert!(matches!(err, AppError::BadRequest { .. }));
    }

    #[test]
    fn responses_accepts_string_input_and_message_array() {
        let s = store();
        let req =
            normalize_responses_request(&s, &value(r#"{"model":"gpt-4o","input":"hello"}"#))
                .unwrap();
        assert_eq!(req.final_prompt, "hello");
        assert_eq!(req.surface, "openai_responses");

        let req = normalize_responses_request(
            &s,
            &value(r#"{"model":"gpt-4o","input":[{"role":"user","content":"from array"}]}"#),
        )
        .unwrap();
        assert_eq!(req.final_prompt, "from array");

        let req = normalize_responses_request(
            &s,
            &value(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"from messages"}]}"#),
        )
        .unwrap();
        assert_eq!(req.final_prompt, "from messages");
    }

    #[test]
    fn flat_tool_shape_accepted() {
        let req = value(r#"{"tools":[{"type":"function","name":"flat_tool","parameters":{}}]}"#);
        let tools = extract_tools(&req);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "flat_tool");
    }
}
