use crate::toolcall::parse_tool_calls;
use crate::util::tokens::estimate_tokens;
use chrono::Utc;
use sonic_rs::Value;

const EMPTY_RESPONSE_FALLBACK: &str = "抱歉，没有生成有效的响应内容。";

fn obj() -> sonic_rs::Object {
    sonic_rs::Object::new()
}

/// 非流式 Anthropic message 对象。
///
/// content 顺序：可选 thinking 块，然后是 text 块或 tool_use 块。
/// 正文为空且只有 thinking 时，也尝试从 thinking 里提取工具调用。
pub fn build_message_response(
    message_id: &str,
    model: &str,
    input_text_basis: &str,
    final_thinking: &str,
    final_text: &str,
    tool_names: &[String],
) -> Value {
    let mut detected = parse_tool_calls(final_text, tool_names);
    if detected.is_empty() && final_text.is_empty() && !final_thinking.is_empty() {
        detected = parse_tool_calls(final_thinking, tool_names);
    }

    let mut content: Vec<Value> = Vec::with_capacity(4);
    if !final_thinking.is_empty() {
        let mut block = obj();
        block.insert(&"type", "thinking");
        block.insert(&"thinking", final_thinking);
        content.push(block.into_value());
    }

    let mut stop_reason = "end_turn";
    if !detected.is_empty() {
        stop_reason = "tool_use";
        let now = Utc::now().timestamp();
        for (i, tc) in detected.iter().enumerate() {
            let mut block = obj();
            block.insert(&"type", "tool_use");
            block.insert(&"id", format!("toolu_{now}_{i}").as_str());
            block.insert(&"name", tc.name.as_str());
            block.insert(&"input", tc.input.clone());
            content.push(block.into_value());
        }
    } else {
        let text = if final_text.is_empty() {
            EMPTY_RESPONSE_FALLBACK
        } else {
            final_text
        };
        let mut block = obj();
        block.insert(&"type", "text");
        block.insert(&"text", text);
        content.push(block.into_value());
    }

    let mut usage = obj();
    usage.insert(&"input_tokens", estimate_tokens(input_text_basis) as i64);
    usage.insert(
        &"output_tokens",
        (estimate_tokens(final_thinking) + estimate_tokens(final_text)) as i64,
    );

    let mut out = obj();
    out.insert(&"id", message_id);
    out.insert(&"type", "message");
    out.insert(&"role", "assistant");
    out.insert(&"model", model);
    out.insert(&"content", Value::from(content));
    out.insert(&"stop_reason", stop_reason);
    out.insert(&"stop_sequence", Value::default());
    out.insert(&"usage", usage.into_value());
    out.into_value()
}
