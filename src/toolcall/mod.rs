pub mod parse;
pub mod sieve;

pub use parse::{ToolCall, parse_tool_calls};
pub use sieve::{EarlyEmit, SieveEvent, ToolCallDelta, ToolStreamSieve};

use sonic_rs::Value;

/// 一个对模型暴露的工具描述（两种 surface 统一后的形态）。
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Option<Value>,
}

/// 构造注入给上游的工具协议 system 提示。
///
/// 上游模型不原生支持 function calling，约定其在需要调用工具时输出
/// `{"tool_calls":[...]}` JSON，由筛分器截获。
pub fn build_tool_prompt(tools: &[ToolSpec]) -> String {
    let mut out = String::new();
    out.push_str("You have access to the following tools:\n\n");
    for t in tools {
        out.push_str("- ");
        out.push_str(&t.name);
        if !t.description.trim().is_empty() {
            out.push_str(": ");
            out.push_str(t.description.trim());
        }
        out.push('\n');
        if let Some(schema) = &t.schema {
            out.push_str("  parameters (JSON Schema): ");
            out.push_str(&sonic_rs::to_string(schema).unwrap_or_else(|_| "{}".to_string()));
            out.push('\n');
        }
    }
    out.push_str(
        "\nWhen you decide to call one or more tools, reply with a single JSON object \
         and nothing else, in exactly this form:\n\
         {\"tool_calls\":[{\"name\":\"<tool name>\",\"input\":{<arguments>}}]}\n\
         Do not wrap the JSON in markdown code fences. \
         If no tool is needed, answer normally.",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_prompt_lists_tools_and_protocol() {
        let tools = vec![
            ToolSpec {
                name: "read_file".into(),
                description: "Read a file from disk".into(),
                schema: sonic_rs::from_str(r#"{"type":"object"}"#).ok(),
            },
            ToolSpec {
                name: "list_dir".into(),
                description: String::new(),
                schema: None,
            },
        ];
        let prompt = build_tool_prompt(&tools);
        assert!(prompt.contains("read_file"));
        assert!(prompt.contains("list_dir"));
        assert!(prompt.contains(r#"{"tool_calls":"#));
    }
}
