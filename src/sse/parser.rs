use crate::deepseek::constants::should_skip_path;
use sonic_rs::{JsonContainerTrait, JsonValueTrait, Value};

/// 内容片段的归属：思考链 or 正文。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    Thinking,
    Text,
}

impl PartType {
    pub fn as_str(self) -> &'static str {
        match self {
            PartType::Thinking => "thinking",
            PartType::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentPart {
    pub text: String,
    pub part_type: PartType,
}

/// 一行上游 SSE 的解析结果。
#[derive(Debug, Clone)]
pub struct LineResult {
    pub parsed: bool,
    pub parts: Vec<ContentPart>,
    pub stop: bool,
    pub next_type: PartType,
    pub error_message: String,
    pub content_filter: bool,
}

impl LineResult {
    fn not_parsed(current: PartType) -> Self {
        Self {
            parsed: false,
            parts: Vec::new(),
            stop: false,
            next_type: current,
            error_message: String::new(),
            content_filter: false,
        }
    }
}

enum RawLine {
    NotData,
    Done,
    Chunk(Value),
}

/// `data: <json>` / `data: [DONE]`；其余行视为心跳或注释。
fn parse_raw_line(raw: &[u8]) -> RawLine {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    let Some(rest) = line.strip_prefix("data:") else {
        return RawLine::NotData;
    };
    let data = rest.trim();
    if data == "[DONE]" {
        return RawLine::Done;
    }
    match sonic_rs::from_str::<Value>(data) {
        Ok(v) if v.is_object() => RawLine::Chunk(v),
        _ => RawLine::NotData,
    }
}

/// 解析一行上游 SSE，返回内容片段与类型追踪结果。
pub fn parse_content_line(raw: &[u8], thinking_enabled: bool, current: PartType) -> LineResult {
    match parse_raw_line(raw) {
        RawLine::NotData => LineResult::not_parsed(current),
        RawLine::Done => LineResult {
            parsed: true,
            parts: Vec::new(),
            stop: true,
            next_type: current,
            error_message: String::new(),
            content_filter: false,
        },
        RawLine::Chunk(chunk) => {
            // 显式错误包：{"error":{...}} 或 {"code":"content_filter"}
            if let Some(err) = chunk.get("error").filter(|v| v.is_object()) {
                let message = err
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| err.to_string());
                return LineResult {
                    parsed: true,
                    parts: Vec::new(),
                    stop: true,
                    next_type: current,
                    error_message: message,
                    content_filter: false,
                };
            }
            if chunk.get("code").and_then(|v| v.as_str()) == Some("content_filter") {
                return LineResult {
                    parsed: true,
                    parts: Vec::new(),
                    stop: true,
                    next_type: current,
                    error_message: "内容被上游安全策略拦截".to_string(),
                    content_filter: true,
                };
            }

            let (parts, finished, next_type) =
                parse_chunk_for_content(&chunk, thinking_enabled, current);
            LineResult {
                parsed: true,
                parts,
                stop: finished,
                next_type,
                error_message: String::new(),
                content_filter: false,
            }
        }
    }
}

/// 对单个 JSON 事件做路径分派，产出内容片段并跟踪当前片段类型。
pub fn parse_chunk_for_content(
    chunk: &Value,
    thinking_enabled: bool,
    current: PartType,
) -> (Vec<ContentPart>, bool, PartType) {
    let Some(v) = chunk.get("v") else {
        return (Vec::new(), false, current);
    };
    let path = chunk.get("p").and_then(|p| p.as_str()).unwrap_or("");
    if should_skip_path(path) {
        return (Vec::new(), false, current);
    }
    if path == "response/status" && v.as_str() == Some("FINISHED") {
        return (Vec::new(), true, current);
    }

    let mut next_type = current;
    let mut parts: Vec<ContentPart> = Vec::new();
    collect_direct_fragments(path, chunk, v, &mut next_type, &mut parts);
    update_type_from_nested_response(path, v, &mut next_type);
    let part_type = resolve_part_type(path, thinking_enabled, next_type);
    let finished = append_chunk_value_content(v, part_type, &mut next_type, &mut parts, path);
    if finished {
        return (Vec::new(), true, next_type);
    }
    (parts, false, next_type)
}

/// `response/fragments` 的 APPEND 事件：逐条按 type 翻转当前片段类型。
fn collect_direct_fragments(
    path: &str,
    chunk: &Value,
    v: &Value,
    next_type: &mut PartType,
    parts: &mut Vec<ContentPart>,
) {
    if path != "response/fragments" {
        return;
    }
    let op = chunk.get("o").and_then(|o| o.as_str()).unwrap_or("");
    if !op.eq_ignore_ascii_case("APPEND") {
        return;
    }
    let Some(frags) = v.as_array() else {
        return;
    };
    for frag in frags.iter() {
        let Some(_) = frag.as_object() else {
            continue;
        };
        let (type_name, content) = fragment_type_content(frag);
        match type_name.as_str() {
            "THINK" | "THINKING" => {
                *next_type = PartType::Thinking;
                push_part(parts, content, PartType::Thinking);
            }
            "RESPONSE" => {
                *next_type = PartType::Text;
                push_part(parts, content, PartType::Text);
            }
            _ => push_part(parts, content, PartType::Text),
        }
    }
}

/// `response` 路径下嵌套 fragments APPEND：仅影响类型，不直接产出内容。
fn update_type_from_nested_response(path: &str, v: &Value, next_type: &mut PartType) {
    if path != "response" {
        return;
    }
    let Some(arr) = v.as_array() else {
        return;
    };
    for it in arr.iter() {
        if it.get("p").and_then(|p| p.as_str()) != Some("fragments")
            || it.get("o").and_then(|o| o.as_str()) != Some("APPEND")
        {
            continue;
        }
        let Some(frags) = it.get("v").and_then(|v| v.as_array()) else {
            continue;
        };
        for frag in frags.iter() {
            let (type_name, _) = fragment_type_content(frag);
            match type_name.as_str() {
                "THINK" | "THINKING" => *next_type = PartType::Thinking,
                "RESPONSE" => *next_type = PartType::Text,
                _ => {}
            }
        }
    }
}

fn resolve_part_type(path: &str, thinking_enabled: bool, next_type: PartType) -> PartType {
    if path == "response/thinking_content" {
        return PartType::Thinking;
    }
    if path == "response/content" {
        return PartType::Text;
    }
    if path.contains("response/fragments") && path.contains("/content") {
        return next_type;
    }
    if path.is_empty() && thinking_enabled {
        return next_type;
    }
    PartType::Text
}

fn append_chunk_value_content(
    v: &Value,
    part_type: PartType,
    next_type: &mut PartType,
    parts: &mut Vec<ContentPart>,
    path: &str,
) -> bool {
    if let Some(s) = v.as_str() {
        if s == "FINISHED" && (path.is_empty() || path == "status") {
            return true;
        }
        push_part(parts, s, part_type);
        return false;
    }
    if let Some(arr) = v.as_array() {
        let (pp, finished) = extract_content_recursive(arr.iter(), part_type);
        if finished {
            return true;
        }
        parts.extend(pp);
        return false;
    }
    if v.is_object() {
        append_wrapped_fragments(v, part_type, next_type, parts);
    }
    false
}

/// `{"v":{"response":{"fragments":[...]}}}` 或 `{"v":{"fragments":[...]}}` 包装。
fn append_wrapped_fragments(
    val: &Value,
    part_type: PartType,
    next_type: &mut PartType,
    parts: &mut Vec<ContentPart>,
) {
    let resp = match val.get("response").filter(|v| v.is_object()) {
        Some(wrapped) => wrapped,
        None => val,
    };
    let Some(frags) = resp.get("fragments").and_then(|v| v.as_array()) else {
        return;
    };
    for frag in frags.iter() {
        if !frag.is_object() {
            continue;
        }
        let (type_name, content) = fragment_type_content(frag);
        match type_name.as_str() {
            "THINK" | "THINKING" => {
                *next_type = PartType::Thinking;
                push_part(parts, content, PartType::Thinking);
            }
            "RESPONSE" => {
                *next_type = PartType::Text;
                push_part(parts, content, PartType::Text);
            }
            _ => push_part(parts, content, part_type),
        }
    }
}

fn fragment_type_content(m: &Value) -> (String, &str) {
    let type_name = m
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_uppercase();
    let content = m.get("content").and_then(|v| v.as_str()).unwrap_or("");
    (type_name, content)
}

fn push_part(parts: &mut Vec<ContentPart>, content: &str, part_type: PartType) {
    if content.is_empty() {
        return;
    }
    parts.push(ContentPart {
        text: content.to_string(),
        part_type,
    });
}

fn extract_content_recursive<'a, I>(items: I, default_type: PartType) -> (Vec<ContentPart>, bool)
where
    I: Iterator<Item = &'a Value>,
{
    let mut parts = Vec::new();
    for it in items {
        if !it.is_object() {
            continue;
        }
        let item_path = it.get("p").and_then(|p| p.as_str()).unwrap_or("");
        let Some(item_v) = it.get("v") else {
            continue;
        };
        if item_path == "status" && item_v.as_str() == Some("FINISHED") {
            return (Vec::new(), true);
        }
        if should_skip_path(item_path) {
            continue;
        }
        if let Some(content) = it.get("content").and_then(|v| v.as_str())
            && !content.is_empty()
        {
            let type_name = it
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_uppercase();
            let pt = match type_name.as_str() {
                "THINK" | "THINKING" => PartType::Thinking,
                "RESPONSE" => PartType::Text,
                _ => default_type,
            };
            push_part(&mut parts, content, pt);
            continue;
        }

        let mut part_type = default_type;
        if item_path.contains("thinking") {
            part_type = PartType::Thinking;
        } else if item_path.contains("content")
            || item_path == "response"
            || item_path == "fragments"
        {
            part_type = PartType::Text;
        }

        if let Some(s) = item_v.as_str() {
            if !s.is_empty() && s != "FINISHED" {
                push_part(&mut parts, s, part_type);
            }
            continue;
        }
        if let Some(inner_arr) = item_v.as_array() {
            for inner in inner_arr.iter() {
                if inner.is_object() {
                    let ct = inner.get("content").and_then(|v| v.as_str()).unwrap_or("");
                    if ct.is_empty() {
                        continue;
                    }
                    let type_name = inner
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_uppercase();
                    let pt = match type_name.as_str() {
                        "THINK" | "THINKING" => PartType::Thinking,
                        "RESPONSE" => PartType::Text,
                        _ => part_type,
                    };
                    push_part(&mut parts, ct, pt);
                } else if let Some(s) = inner.as_str()
                    && !s.is_empty()
                {
                    push_part(&mut parts, s, part_type);
                }
            }
        }
    }
    (parts, false)
}

/// 搜索模式下上游会混入 `[citation:N]` 片段，需要从可见文本中剔除。
pub fn is_citation(text: &str) -> bool {
    text.trim_start().starts_with("[citation:")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(raw: &str) -> Value {
        sonic_rs::from_str(raw).unwrap()
    }

    #[test]
    fn raw_line_variants() {
        assert!(matches!(parse_raw_line(b""), RawLine::NotData));
        assert!(matches!(parse_raw_line(b"event: message"), RawLine::NotData));
        assert!(matches!(parse_raw_line(b"data: {invalid"), RawLine::NotData));
        assert!(matches!(parse_raw_line(b"   "), RawLine::NotData));
        assert!(matches!(parse_raw_line(b"data: [DONE]"), RawLine::Done));
        assert!(matches!(
            parse_raw_line(br#"data:   {"v":"hello"}  "#),
            RawLine::Chunk(_)
        ));
    }

    #[test]
    fn line_not_parsed_preserves_type() {
        let res = parse_content_line(b"not a data line", false, PartType::Text);
        assert!(!res.parsed);
        assert_eq!(res.next_type, PartType::Text);
    }

    #[test]
    fn line_thinking_content() {
        let res = parse_content_line(
            br#"data: {"p":"response/thinking_content","v":"think"}"#,
            true,
            PartType::Thinking,
        );
        assert!(res.parsed && !res.stop);
        assert_eq!(res.parts.len(), 1);
        assert_eq!(res.parts[0].part_type, PartType::Thinking);
    }

    #[test]
    fn line_fragment_switches_type() {
        let res = parse_content_line(
            br#"data: {"p":"response/fragments","o":"APPEND","v":[{"type":"RESPONSE","content":"hi"}]}"#,
            true,
            PartType::Thinking,
        );
        assert!(res.parsed && !res.stop);
        assert_eq!(res.next_type, PartType::Text);
    }

    #[test]
    fn line_content_filter() {
        let res = parse_content_line(br#"data: {"code":"content_filter"}"#, false, PartType::Text);
        assert!(res.content_filter);
        assert!(res.stop);
        assert!(!res.error_message.is_empty());
    }

    #[test]
    fn line_error_object() {
        let res = parse_content_line(
            br#"data: {"error":{"message":"rate limit","code":429}}"#,
            false,
            PartType::Text,
        );
        assert!(res.parsed && res.stop);
        assert_eq!(res.error_message, "rate limit");
    }

    #[test]
    fn chunk_without_v_is_empty() {
        let (parts, finished, next) =
            parse_chunk_for_content(&chunk(r#"{"p":"response/content"}"#), false, PartType::Text);
        assert!(parts.is_empty() && !finished);
        assert_eq!(next, PartType::Text);
    }

    #[test]
    fn chunk_skipped_path_produces_nothing() {
        let (parts, finished, next) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/token_usage","v":"some data"}"#),
            false,
            PartType::Text,
        );
        assert!(parts.is_empty() && !finished);
        assert_eq!(next, PartType::Text);
    }

    #[test]
    fn chunk_status_finished() {
        let (parts, finished, _) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/status","v":"FINISHED"}"#),
            false,
            PartType::Text,
        );
        assert!(finished && parts.is_empty());
    }

    #[test]
    fn chunk_status_not_finished_is_content() {
        let (parts, finished, _) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/status","v":"IN_PROGRESS"}"#),
            false,
            PartType::Text,
        );
        assert!(!finished);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text, "IN_PROGRESS");
    }

    #[test]
    fn chunk_empty_string_produces_nothing() {
        let (parts, finished, _) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/content","v":""}"#),
            false,
            PartType::Text,
        );
        assert!(parts.is_empty() && !finished);
    }

    #[test]
    fn chunk_finished_on_empty_and_status_path() {
        let (_, finished, _) =
            parse_chunk_for_content(&chunk(r#"{"p":"","v":"FINISHED"}"#), false, PartType::Text);
        assert!(finished);
        let (_, finished, _) =
            parse_chunk_for_content(&chunk(r#"{"p":"status","v":"FINISHED"}"#), false, PartType::Text);
        assert!(finished);
    }

    #[test]
    fn chunk_bare_path_inherits_when_thinking_enabled() {
        let (parts, _, next) = parse_chunk_for_content(
            &chunk(r#"{"v":"some thought"}"#),
            true,
            PartType::Thinking,
        );
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_type, PartType::Thinking);
        assert_eq!(next, PartType::Thinking);

        let (parts, _, _) =
            parse_chunk_for_content(&chunk(r#"{"v":"text content"}"#), true, PartType::Text);
        assert_eq!(parts[0].part_type, PartType::Text);
    }

    #[test]
    fn chunk_fragments_append_think() {
        let (parts, finished, next) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/fragments","o":"APPEND","v":[{"type":"THINK","content":"深入思考..."}]}"#),
            true,
            PartType::Text,
        );
        assert!(!finished);
        assert_eq!(next, PartType::Thinking);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_type, PartType::Thinking);
        assert_eq!(parts[0].text, "深入思考...");
    }

    #[test]
    fn chunk_fragments_append_empty_content_still_switches_type() {
        let (parts, _, next) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/fragments","o":"APPEND","v":[{"type":"RESPONSE","content":""}]}"#),
            true,
            PartType::Thinking,
        );
        assert!(parts.is_empty());
        assert_eq!(next, PartType::Text);
    }

    #[test]
    fn chunk_fragments_append_unknown_type_defaults_text() {
        let (parts, _, _) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/fragments","o":"APPEND","v":[{"type":"UNKNOWN","content":"some text"}]}"#),
            true,
            PartType::Text,
        );
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_type, PartType::Text);
    }

    #[test]
    fn chunk_fragments_append_non_array_is_plain_string() {
        let (parts, finished, _) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/fragments","o":"APPEND","v":"not an array"}"#),
            true,
            PartType::Text,
        );
        assert!(!finished);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text, "not an array");
    }

    #[test]
    fn chunk_nested_response_fragments_update_type() {
        let (_, _, next) = parse_chunk_for_content(
            &chunk(r#"{"p":"response","v":[{"p":"fragments","o":"APPEND","v":[{"type":"THINKING"}]}]}"#),
            true,
            PartType::Text,
        );
        assert_eq!(next, PartType::Thinking);

        let (_, _, next) = parse_chunk_for_content(
            &chunk(r#"{"p":"response","v":[{"p":"fragments","o":"APPEND","v":[{"type":"RESPONSE"}]}]}"#),
            true,
            PartType::Thinking,
        );
        assert_eq!(next, PartType::Text);
    }

    #[test]
    fn chunk_wrapped_response_fragments() {
        let (parts, finished, next) = parse_chunk_for_content(
            &chunk(
                r#"{"v":{"response":{"fragments":[{"type":"THINK","content":"思考..."},{"type":"RESPONSE","content":"回答..."}]}}}"#,
            ),
            true,
            PartType::Text,
        );
        assert!(!finished);
        assert_eq!(next, PartType::Text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_type, PartType::Thinking);
        assert_eq!(parts[0].text, "思考...");
        assert_eq!(parts[1].part_type, PartType::Text);
        assert_eq!(parts[1].text, "回答...");
    }

    #[test]
    fn chunk_wrapped_direct_fragments() {
        let (parts, _, _) = parse_chunk_for_content(
            &chunk(r#"{"v":{"fragments":[{"type":"RESPONSE","content":"直接回答"}]}}"#),
            false,
            PartType::Text,
        );
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text, "直接回答");
        assert_eq!(parts[0].part_type, PartType::Text);
    }

    #[test]
    fn chunk_wrapped_empty_fragment_content_skipped() {
        let (parts, _, _) = parse_chunk_for_content(
            &chunk(r#"{"v":{"fragments":[{"type":"RESPONSE","content":""}]}}"#),
            false,
            PartType::Text,
        );
        assert!(parts.is_empty());
    }

    #[test]
    fn chunk_fragment_content_path_inherits_type() {
        let (parts, _, _) = parse_chunk_for_content(
            &chunk(r#"{"p":"response/fragments/-1/content","v":"继续思考"}"#),
            true,
            PartType::Thinking,
        );
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_type, PartType::Thinking);
    }

    #[test]
    fn recursive_status_finished() {
        let v = chunk(r#"{"p":"response","v":[{"p":"status","v":"FINISHED"}]}"#);
        let (parts, finished, _) = parse_chunk_for_content(&v, false, PartType::Text);
        assert!(finished && parts.is_empty());
    }

    #[test]
    fn recursive_skips_bookkeeping_and_plain_finished() {
        let v = chunk(r#"{"p":"response","v":[{"p":"token_usage","v":"data"}]}"#);
        let (parts, finished, _) = parse_chunk_for_content(&v, false, PartType::Text);
        assert!(!finished && parts.is_empty());

        let v = chunk(r#"{"p":"response","v":[{"p":"content","v":"FINISHED"}]}"#);
        let (parts, _, _) = parse_chunk_for_content(&v, false, PartType::Text);
        assert!(parts.is_empty());
    }

    #[test]
    fn recursive_content_field_and_paths() {
        let v = chunk(r#"{"p":"response","v":[{"p":"x","v":"val","content":"actual content","type":"RESPONSE"}]}"#);
        let (parts, _, _) = parse_chunk_for_content(&v, false, PartType::Text);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text, "actual content");
        assert_eq!(parts[0].part_type, PartType::Text);

        let v = chunk(r#"{"p":"response","v":[{"p":"thinking_content","v":"deep thought"}]}"#);
        let (parts, _, _) = parse_chunk_for_content(&v, false, PartType::Text);
        assert_eq!(parts[0].part_type, PartType::Thinking);

        let v = chunk(r#"{"p":"response","v":[{"p":"content","v":"text content"}]}"#);
        let (parts, _, _) = parse_chunk_for_content(&v, true, PartType::Thinking);
        assert_eq!(parts[0].part_type, PartType::Text);
    }

    #[test]
    fn recursive_nested_array_with_types() {
        let v = chunk(
            r#"{"p":"response","v":[{"p":"fragments","v":[{"content":"thought","type":"THINKING"},{"content":"answer","type":"RESPONSE"},"raw string"]}]}"#,
        );
        let (parts, _, _) = parse_chunk_for_content(&v, false, PartType::Text);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].part_type, PartType::Thinking);
        assert_eq!(parts[0].text, "thought");
        assert_eq!(parts[1].part_type, PartType::Text);
        assert_eq!(parts[1].text, "answer");
        assert_eq!(parts[2].part_type, PartType::Text);
        assert_eq!(parts[2].text, "raw string");
    }

    #[test]
    fn citation_detection() {
        assert!(is_citation("[citation:1] text"));
        assert!(is_citation("   [citation:2] text"));
        assert!(!is_citation(""));
        assert!(!is_citation("[cite:1] text"));
    }
}
