use crate::toolcall::{ToolCall, parse_tool_calls};
use crate::util::{id, tokens::estimate_tokens};
use chrono::Utc;
use sonic_rs::Value;

fn obj() -> sonic_rs::Object {
    sonic_rs::Object::new()
}

/// 非流式 chat.completion 对象。
pub fn build_chat_completion(
    completion_id: &str,
    model: &str,
    final_prompt: &str,
    final_thinking: &str,
    final_text: &str,
    tool_names: &[String],
) -> Value {
    let detected = parse_tool_calls(final_text, tool_names);
    let mut finish_reason = "stop";

    let mut message = obj();
    message.insert(&"role", "assistant");
    if detected.is_empty() {
        message.insert(&"content", final_text);
    } else {
        finish_reason = "tool_calls";
        message.insert(&"content", Value::default());
        message.insert(&"tool_calls", Value::from(format_tool_calls(&detected)));
    }
    if !final_thinking.trim().is_empty() {
        message.insert(&"reasoning_content", final_thinking);
    }

    let mut choice = obj();
    choice.insert(&"index", 0);
    choice.insert(&"message", message.into_value());
    choice.insert(&"finish_reason", finish_reason);

    let mut out = obj();
    out.insert(&"id", completion_id);
    out.insert(&"object", "chat.completion");
    out.insert(&"created", Utc::now().timestamp());
    out.insert(&"model", model);
    out.insert(&"choices", Value::from(vec![choice.into_value()]));
    out.insert(
        &"usage",
        build_chat_usage(final_prompt, final_thinking, final_text),
    );
    out.into_value()
}

/// `[{id,type:"function",function:{name,arguments}}]`（非流式）。
pub fn format_tool_calls(calls: &[ToolCall]) -> Vec<Value> {
    calls
        .iter()
        .map(|tc| {
            let mut function = obj();
            function.insert(&"name", tc.name.as_str());
            function.insert(&"arguments", tc.arguments_json().as_str());
            let mut call = obj();
            call.insert(&"id", id::tool_call_id().as_str());
            call.insert(&"type", "function");
            call.insert(&"function", function.into_value());
            call.into_value()
        })
        .collect()
}

/// 流式 tool_calls delta 片段（带 index，id 由调用方预先分配）。
pub fn format_stream_tool_calls(calls: &[ToolCall], ids: &[String]) -> Vec<Value> {
    calls
        .iter()
        .enumerate()
        .map(|(i, tc)| {
            let mut function = obj();
            function.insert(&"name", tc.name.as_str());
            function.insert(&"arguments", tc.arguments_json().as_str());
            let mut call = obj();
            call.insert(&"index", i as i64);
            let call_id = ids
                .get(i)
                .cloned()
                .unwrap_or_else(id::tool_call_id);
            call.insert(&"id", call_id.as_str());
            call.insert(&"type", "function");
            call.insert(&"function", function.into_value());
            call.into_value()
        })
        .collect()
}

pub fn build_chat_usage(final_prompt: &str, final_thinking: &str, final_text: &str) -> Value {
    let prompt_tokens = estimate_tokens(final_prompt);
    let reasoning_tokens = estimate_tokens(final_thinking);
    let completion_tokens = estimate_tokens(final_text);

    let mut details = obj();
    details.insert(&"reasoning_tokens", reasoning_tokens as i64);

    let mut usage = obj();
    usage.insert(&"prompt_tokens", prompt_tokens as i64);
    usage.insert(
        &"completion_tokens",
        (reasoning_tokens + completion_tokens) as i64,
    );
    usage.insert(
        &"total_tokens",
        (prompt_tokens + reasoning_tokens + completion_tokens) as i64,
    );
    usage.insert(&"completion_tokens_details", details.into_value());
    usage.into_value()
}

/// 非流式/终态 responses 对象。
///
/// 检出工具调用时 `output_text` 必须为空（裸 JSON 不得泄漏），
/// output 同时给出 function_call 条目与 tool_calls 包装；
/// `call_ids` 与流式阶段发出的 call_id 对齐。
pub fn build_response_object(
    response_id: &str,
    model: &str,
    final_prompt: &str,
    final_thinking: &str,
    final_text: &str,
    tool_names: &[String],
    call_ids: &[String],
) -> Value {
    let detected = parse_tool_calls(final_text, tool_names);
    let mut exposed_output_text = final_text;
    let mut output: Vec<Value> = Vec::with_capacity(2);

    if !detected.is_empty() {
        exposed_output_text = "";
        for (i, tc) in detected.iter().enumerate() {
            let call_id = call_ids
                .get(i)
                .cloned()
                .unwrap_or_else(id::tool_call_id);
            let mut fc = obj();
            fc.insert(&"type", "function_call");
            fc.insert(&"id", format!("fc_{}", &call_id).as_str());
            fc.insert(&"call_id", call_id.as_str());
            fc.insert(&"name", tc.name.as_str());
            fc.insert(&"arguments", tc.arguments_json().as_str());
            fc.insert(&"status", "completed");
            output.push(fc.into_value());
        }
        let wrapped: Vec<Value> = detected
            .iter()
            .map(|tc| {
                let mut call = obj();
                call.insert(&"type", "tool_call");
                call.insert(&"name", tc.name.as_str());
                call.insert(&"arguments", tc.input.clone());
                call.into_value()
            })
            .collect();
        let mut wrapper = obj();
        wrapper.insert(&"type", "tool_calls");
        wrapper.insert(&"tool_calls", Value::from(wrapped));
        output.push(wrapper.into_value());
    } else {
        let mut content: Vec<Value> = Vec::with_capacity(2);
        if !final_thinking.is_empty() {
            let mut reasoning = obj();
            reasoning.insert(&"type", "reasoning");
            reasoning.insert(&"text", final_thinking);
            content.push(reasoning.into_value());
        }
        let mut text_block = obj();
        text_block.insert(&"type", "output_text");
        text_block.insert(&"text", final_text);
        content.push(text_block.into_value());

        let mut message = obj();
        message.insert(&"type", "message");
        message.insert(&"id", id::message_id().as_str());
        message.insert(&"role", "assistant");
        message.insert(&"content", Value::from(content));
        output.push(message.into_value());
    }

    let prompt_tokens = estimate_tokens(final_prompt);
    let reasoning_tokens = estimate_tokens(final_thinking);
    let completion_tokens = estimate_tokens(final_text);
    let mut usage = obj();
    usage.insert(&"input_tokens", prompt_tokens as i64);
    usage.insert(
        &"output_tokens",
        (reasoning_tokens + completion_tokens) as i64,
    );
    usage.insert(
        &"total_tokens",
        (prompt_tokens + reasoning_tokens + completion_tokens) as i64,
    );

    let mut out = obj();
    out.insert(&"id", response_id);
    out.insert(&"type", "response");
    out.insert(&"object", "response");
    out.insert(&"created_at", Utc::now().timestamp());
    out.insert(&"status", "completed");
    out.insert(&"model", model);
    out.insert(&"output", Value::from(output));
    out.insert(&"output_text", exposed_output_text);
    out.insert(&"usage", usage.into_value());
    out.into_value()
}

/// 重写 choices[0].finish_reason（内容过滤等语义性终止）。
pub fn override_chat_finish_reason(out: &Value, reason: &str) -> Value {
    use sonic_rs::JsonContainerTrait;
    let Some(root) = out.as_object() else {
        return out.clone();
    };
    let mut new_out = obj();
    for (k, v) in root.iter() {
        if k != "choices" {
            new_out.insert(&k, v.clone());
            continue;
        }
        let mut new_choices: Vec<Value> = Vec::new();
        if let Some(arr) = v.as_array() {
            for (i, c) in arr.iter().enumerate() {
                match (i, c.as_object()) {
                    (0, Some(cobj)) => {
                        let mut nc = obj();
                        for (ck, cv) in cobj.iter() {
                            if ck == "finish_reason" {
                                continue;
                            }
                            nc.insert(&ck, cv.clone());
                        }
                        nc.insert(&"finish_reason", reason);
                        new_choices.push(nc.into_value());
                    }
                    _ => new_choices.push(c.clone()),
                }
            }
        }
        new_out.insert(&"choices", Value::from(new_choices));
    }
    new_out.into_value()
}

pub fn build_responses_created_payload(response_id: &str, model: &str) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.created");
    out.insert(&"id", response_id);
    out.insert(&"object", "response");
    out.insert(&"model", model);
    out.insert(&"status", "in_progress");
    out.into_value()
}

pub fn build_responses_text_delta_payload(response_id: &str, delta: &str) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.output_text.delta");
    out.insert(&"id", response_id);
    out.insert(&"delta", delta);
    out.into_value()
}

pub fn build_responses_reasoning_delta_payload(response_id: &str, delta: &str) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.reasoning.delta");
    out.insert(&"id", response_id);
    out.insert(&"delta", delta);
    out.into_value()
}

/// 兼容事件：新版 SDK 监听 `response.reasoning_text.*`。
pub fn build_responses_reasoning_text_delta_payload(response_id: &str, delta: &str) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.reasoning_text.delta");
    out.insert(&"id", response_id);
    out.insert(&"delta", delta);
    out.into_value()
}

pub fn build_responses_reasoning_text_done_payload(response_id: &str, text: &str) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.reasoning_text.done");
    out.insert(&"id", response_id);
    out.insert(&"text", text);
    out.into_value()
}

pub fn build_responses_function_call_arguments_delta_payload(
    response_id: &str,
    call_id: &str,
    name: &str,
    delta: &str,
) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.function_call_arguments.delta");
    out.insert(&"id", response_id);
    out.insert(&"call_id", call_id);
    out.insert(&"name", name);
    out.insert(&"delta", delta);
    out.into_value()
}

pub fn build_responses_function_call_arguments_done_payload(
    response_id: &str,
    call_id: &str,
    name: &str,
    arguments: &str,
) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.function_call_arguments.done");
    out.insert(&"id", response_id);
    out.insert(&"call_id", call_id);
    out.insert(&"name", name);
    out.insert(&"arguments", arguments);
    out.into_value()
}

pub fn build_responses_tool_call_delta_payload(response_id: &str, tool_calls: Vec<Value>) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.output_tool_call.delta");
    out.insert(&"id", response_id);
    out.insert(&"tool_calls", Value::from(tool_calls));
    out.into_value()
}

pub fn build_responses_tool_call_done_payload(response_id: &str, tool_calls: Vec<Value>) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.output_tool_call.done");
    out.insert(&"id", response_id);
    out.insert(&"tool_calls", Value::from(tool_calls));
    out.into_value()
}

pub fn build_responses_completed_payload(response: Value) -> Value {
    let mut out = obj();
    out.insert(&"type", "response.completed");
    out.insert(&"response", response);
    out.into_value()
}
