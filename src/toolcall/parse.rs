use sonic_rs::{JsonContainerTrait, JsonValueTrait, Value};

/// 模型文本中提取出的一次工具调用。
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    pub fn arguments_json(&self) -> String {
        sonic_rs::to_string(&self.input).unwrap_or_else(|_| "{}".to_string())
    }
}

/// 在整段文本上运行工具调用文法：
/// 找到所有顶层 `{"tool_calls":[{"name":…,"input":…},…]}` 对象，
/// 且每个 name 都在 `tool_names` 内才算命中。不完整的尾巴产出零个调用。
pub fn parse_tool_calls(text: &str, tool_names: &[String]) -> Vec<ToolCall> {
    if text.is_empty() || tool_names.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let Some(start) = find_candidate_start(text, i) else {
            break;
        };
        match scan_balanced_object(text, start) {
            Some(end) => {
                if let Some(calls) = validate_candidate(&text[start..end], tool_names) {
                    out.extend(calls);
                }
                i = end;
            }
            // 未闭合：后面不可能再有完整候选
            None => break,
        }
    }
    out
}

/// 从 `from` 起找下一个候选起点：`{` 后跳过空白紧跟 `"tool_calls"`。
pub(crate) fn find_candidate_start(text: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && (bytes[j] as char).is_whitespace() {
            j += 1;
        }
        const KEY: &[u8] = b"\"tool_calls\"";
        let rest = &bytes[j..];
        if rest.len() >= KEY.len() {
            if &rest[..KEY.len()] == KEY {
                return Some(i);
            }
        } else if KEY.starts_with(rest) {
            // 文本在 key 中途被截断：仍是潜在候选（流式场景）。
            return Some(i);
        }
        i += 1;
    }
    None
}

/// 从 `start`（必须指向 `{`）扫到配平的 `}`，返回结束位置（开区间）。
/// 转义与字符串内的大括号会被正确跳过；未配平返回 None。
pub(crate) fn scan_balanced_object(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes.get(start), Some(&b'{'));
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// 校验候选 JSON 是否符合文法且所有 name 均被允许。
pub(crate) fn validate_candidate(candidate: &str, tool_names: &[String]) -> Option<Vec<ToolCall>> {
    let value: Value = sonic_rs::from_str(candidate).ok()?;
    let calls = value.get("tool_calls")?.as_array()?;
    if calls.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(calls.len());
    for call in calls.iter() {
        let name = call.get("name")?.as_str()?.to_string();
        if !tool_names.iter().any(|n| n == &name) {
            return None;
        }
        let input = call
            .get("input")
            .cloned()
            .unwrap_or_else(|| sonic_rs::from_str("{}").unwrap_or_default());
        out.push(ToolCall { name, input });
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_single_call() {
        let text = r#"{"tool_calls":[{"name":"read_file","input":{"path":"README.MD"}}]}"#;
        let calls = parse_tool_calls(text, &names(&["read_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(
            calls[0].input.get("path").and_then(|v| v.as_str()),
            Some("README.MD")
        );
    }

    #[test]
    fn extracts_call_surrounded_by_text() {
        let text = r#"先看一下文件。{"tool_calls":[{"name":"read_file","input":{"path":"a.rs"}}]}好的。"#;
        let calls = parse_tool_calls(text, &names(&["read_file"]));
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn extracts_multiple_calls_in_one_envelope() {
        let text = r#"{"tool_calls":[{"name":"a","input":{}},{"name":"b","input":{"x":1}}]}"#;
        let calls = parse_tool_calls(text, &names(&["a", "b"]));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "b");
    }

    #[test]
    fn rejects_unknown_name() {
        let text = r#"{"tool_calls":[{"name":"rm_rf","input":{}}]}"#;
        assert!(parse_tool_calls(text, &names(&["read_file"])).is_empty());
    }

    #[test]
    fn rejects_partial_unknown_name_in_batch() {
        let text = r#"{"tool_calls":[{"name":"read_file","input":{}},{"name":"evil","input":{}}]}"#;
        assert!(parse_tool_calls(text, &names(&["read_file"])).is_empty());
    }

    #[test]
    fn incomplete_tail_yields_nothing() {
        let text = r#"Before {"tool_calls":[{"name":"read_file","input":"#;
        assert!(parse_tool_calls(text, &names(&["read_file"])).is_empty());
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_scanner() {
        let text = r#"{"tool_calls":[{"name":"read_file","input":{"path":"a{b}c\"d"}}]}"#;
        let calls = parse_tool_calls(text, &names(&["read_file"]));
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn plain_json_without_tool_calls_key_ignored() {
        let text = r#"{"result":"ok"}"#;
        assert!(parse_tool_calls(text, &names(&["read_file"])).is_empty());
    }

    #[test]
    fn missing_input_defaults_to_empty_object() {
        let text = r#"{"tool_calls":[{"name":"read_file"}]}"#;
        let calls = parse_tool_calls(text, &names(&["read_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments_json(), "{}");
    }
}
