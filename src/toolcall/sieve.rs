use crate::toolcall::parse::{
    ToolCall, find_candidate_start, scan_balanced_object, validate_candidate,
};

/// 提前吐出 tool call 增量的置信度档位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyEmit {
    #[default]
    Off,
    /// name 命中且 input 首个键完整后即可发增量。
    Low,
    /// input 对象整体配平后一次性发出。
    High,
}

impl EarlyEmit {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub index: usize,
    pub name: String,
    pub arguments_fragment: String,
}

/// 筛分器的一次输出：普通文本、增量、或完整的工具调用。
#[derive(Debug, Default, Clone)]
pub struct SieveEvent {
    pub content: String,
    pub tool_call_deltas: Vec<ToolCallDelta>,
    pub tool_calls: Vec<ToolCall>,
}

impl SieveEvent {
    fn content(text: String) -> Self {
        Self {
            content: text,
            ..Self::default()
        }
    }

    fn calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }
}

/// 流式工具调用筛分器。
///
/// 候选 JSON 之前的普通文本立即放行；候选区缓冲到配平为止；
/// 配平且合法 → 作为 tool_calls 发出并从可见文本中抹去；
/// 配平但不合法 → 原样作为文本放行；收尾时未配平的尾巴直接丢弃。
#[derive(Debug, Default)]
pub struct ToolStreamSieve {
    buf: String,
    completed_calls: usize,
    early_name: Option<String>,
    early_rejected: bool,
    early_args_emitted: usize,
}

impl ToolStreamSieve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_chunk(
        &mut self,
        chunk: &str,
        tool_names: &[String],
        early: EarlyEmit,
    ) -> Vec<SieveEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();

        loop {
            match find_candidate_start(&self.buf, 0) {
                None => {
                    if !self.buf.is_empty() {
                        events.push(SieveEvent::content(std::mem::take(&mut self.buf)));
                    }
                    break;
                }
                Some(start) if start > 0 => {
                    let prefix: String = self.buf.drain(..start).collect();
                    events.push(SieveEvent::content(prefix));
                }
                Some(_) => match scan_balanced_object(&self.buf, 0) {
                    Some(end) => {
                        let candidate: String = self.buf.drain(..end).collect();
                        self.reset_candidate_state();
                        match validate_candidate(&candidate, tool_names) {
                            Some(calls) => {
                                self.completed_calls += calls.len();
                                events.push(SieveEvent::calls(calls));
                            }
                            None => events.push(SieveEvent::content(candidate)),
                        }
                    }
                    None => {
                        if early != EarlyEmit::Off
                            && let Some(delta) = self.maybe_early_delta(tool_names, early)
                        {
                            events.push(SieveEvent {
                                tool_call_deltas: vec![delta],
                                ..SieveEvent::default()
                            });
                        }
                        break;
                    }
                },
            }
        }

        events
    }

    /// 收尾：吐出已完整的调用，丢弃未配平的尾巴。
    pub fn flush(&mut self, tool_names: &[String]) -> Vec<SieveEvent> {
        let mut events = Vec::new();
        loop {
            match find_candidate_start(&self.buf, 0) {
                None => {
                    if !self.buf.is_empty() {
                        events.push(SieveEvent::content(std::mem::take(&mut self.buf)));
                    }
                    break;
                }
                Some(start) if start > 0 => {
                    let prefix: String = self.buf.drain(..start).collect();
                    events.push(SieveEvent::content(prefix));
                }
                Some(_) => match scan_balanced_object(&self.buf, 0) {
                    Some(end) => {
                        let candidate: String = self.buf.drain(..end).collect();
                        match validate_candidate(&candidate, tool_names) {
                            Some(calls) => {
                                self.completed_calls += calls.len();
                                events.push(SieveEvent::calls(calls));
                            }
                            None => events.push(SieveEvent::content(candidate)),
                        }
                    }
                    None => {
                        // 从未解析成功的尾巴：不得再次进入可见文本
                        self.buf.clear();
                        break;
                    }
                },
            }
        }
        self.reset_candidate_state();
        events
    }

    fn reset_candidate_state(&mut self) {
        self.early_name = None;
        self.early_rejected = false;
        self.early_args_emitted = 0;
    }

    /// 对未配平的候选判断是否可以提前吐出参数增量。
    fn maybe_early_delta(
        &mut self,
        tool_names: &[String],
        early: EarlyEmit,
    ) -> Option<ToolCallDelta> {
        if self.early_rejected {
            return None;
        }
        if self.early_name.is_none() {
            match extract_string_value(&self.buf, "\"name\"") {
                Some(name) => {
                    if !tool_names.iter().any(|n| n == &name) {
                        self.early_rejected = true;
                        return None;
                    }
                    self.early_name = Some(name);
                }
                None => return None,
            }
        }
        let name = self.early_name.clone()?;
        let input_start = find_value_start(&self.buf, "\"input\"")?;
        let input_raw = &self.buf[input_start..];

        match early {
            EarlyEmit::Off => None,
            EarlyEmit::High => {
                // input 对象必须整体配平，才一次性发出
                if self.early_args_emitted > 0 || !input_raw.starts_with('{') {
                    return None;
                }
                let end = scan_balanced_object(input_raw, 0)?;
                self.early_args_emitted = end;
                Some(ToolCallDelta {
                    index: self.completed_calls,
                    name,
                    arguments_fragment: input_raw[..end].to_string(),
                })
            }
            EarlyEmit::Low => {
                if !first_input_key_complete(input_raw) {
                    return None;
                }
                if input_raw.len() <= self.early_args_emitted {
                    return None;
                }
                let fragment = input_raw[self.early_args_emitted..].to_string();
                self.early_args_emitted = input_raw.len();
                Some(ToolCallDelta {
                    index: self.completed_calls,
                    name,
                    arguments_fragment: fragment,
                })
            }
        }
    }
}

/// 在原文中找 `key` 后的完整字符串值（处理转义）。
fn extract_string_value(text: &str, key: &str) -> Option<String> {
    let value_start = find_value_start(text, key)?;
    let bytes = text.as_bytes();
    if bytes.get(value_start) != Some(&b'"') {
        return None;
    }
    let mut escaped = false;
    for (offset, &b) in bytes[value_start + 1..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if b == b'\\' {
            escaped = true;
            continue;
        }
        if b == b'"' {
            let raw = &text[value_start..value_start + offset + 2];
            return sonic_rs::from_str::<String>(raw).ok();
        }
    }
    None
}

/// `key` 冒号之后（跳过空白）的值起始位置。
fn find_value_start(text: &str, key: &str) -> Option<usize> {
    let key_pos = text.find(key)?;
    let bytes = text.as_bytes();
    let mut i = key_pos + key.len();
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    if bytes.get(i) != Some(&b':') {
        return None;
    }
    i += 1;
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    if i >= bytes.len() { None } else { Some(i) }
}

/// low 置信度的门槛：input 值的首个键已经完整（闭合引号出现）。
/// 非对象 input 出现任意一个字符即算达标。
fn first_input_key_complete(input_raw: &str) -> bool {
    let bytes = input_raw.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    if bytes[0] != b'{' {
        return true;
    }
    let mut i = 1;
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    if bytes.get(i) != Some(&b'"') {
        return false;
    }
    let mut escaped = false;
    for &b in &bytes[i + 1..] {
        if escaped {
            escaped = false;
            continue;
        }
        if b == b'\\' {
            escaped = true;
            continue;
        }
        if b == b'"' {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn all_content(events: &[SieveEvent]) -> String {
        events.iter().map(|e| e.content.as_str()).collect()
    }

    fn all_calls(events: &[SieveEvent]) -> Vec<ToolCall> {
        events.iter().flat_map(|e| e.tool_calls.clone()).collect()
    }

    #[test]
    fn plain_text_passes_through() {
        let mut sieve = ToolStreamSieve::new();
        let events = sieve.process_chunk("hello world", &names(&["t"]), EarlyEmit::Off);
        assert_eq!(all_content(&events), "hello world");
        assert!(sieve.flush(&names(&["t"])).is_empty());
    }

    #[test]
    fn braces_in_plain_text_are_not_candidates() {
        let mut sieve = ToolStreamSieve::new();
        let events = sieve.process_chunk("set {x} done", &names(&["t"]), EarlyEmit::Off);
        assert_eq!(all_content(&events), "set {x} done");
    }

    #[test]
    fn prefix_emitted_and_raw_json_suppressed() {
        let mut sieve = ToolStreamSieve::new();
        let input = r#"Before {"tool_calls":[{"name":"read_file","input":{"path":"README.MD"}}]}"#;
        let events = sieve.process_chunk(input, &names(&["read_file"]), EarlyEmit::Off);
        assert_eq!(all_content(&events), "Before ");
        let calls = all_calls(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
    }

    #[test]
    fn candidate_split_across_chunks() {
        let mut sieve = ToolStreamSieve::new();
        let tool_names = names(&["read_file"]);
        let e1 = sieve.process_chunk("Before ", &tool_names, EarlyEmit::Off);
        assert_eq!(all_content(&e1), "Before ");

        let e2 = sieve.process_chunk(
            r#"{"tool_calls":[{"name":"read_file","input":"#,
            &tool_names,
            EarlyEmit::Off,
        );
        assert!(all_content(&e2).is_empty());
        assert!(all_calls(&e2).is_empty());

        let e3 = sieve.process_chunk(r#"{"path":"a"}}]}"#, &tool_names, EarlyEmit::Off);
        let calls = all_calls(&e3);
        assert_eq!(calls.len(), 1);
        assert!(all_content(&e3).is_empty());
    }

    #[test]
    fn incomplete_tail_discarded_on_flush() {
        let mut sieve = ToolStreamSieve::new();
        let tool_names = names(&["read_file"]);
        sieve.process_chunk("Before ", &tool_names, EarlyEmit::Off);
        sieve.process_chunk(
            r#"{"tool_calls":[{"name":"read_file","input":"#,
            &tool_names,
            EarlyEmit::Off,
        );
        let flushed = sieve.flush(&tool_names);
        assert!(all_content(&flushed).is_empty());
        assert!(all_calls(&flushed).is_empty());
    }

    #[test]
    fn balanced_but_invalid_candidate_becomes_content() {
        let mut sieve = ToolStreamSieve::new();
        let input = r#"{"tool_calls":[{"name":"evil","input":{}}]}"#;
        let events = sieve.process_chunk(input, &names(&["read_file"]), EarlyEmit::Off);
        assert_eq!(all_content(&events), input);
        assert!(all_calls(&events).is_empty());
    }

    #[test]
    fn text_after_envelope_still_flows() {
        let mut sieve = ToolStreamSieve::new();
        let tool_names = names(&["t"]);
        let input = r#"{"tool_calls":[{"name":"t","input":{}}]} trailing"#;
        let events = sieve.process_chunk(input, &tool_names, EarlyEmit::Off);
        assert_eq!(all_calls(&events).len(), 1);
        assert_eq!(all_content(&events), " trailing");
    }

    #[test]
    fn early_off_emits_no_deltas() {
        let mut sieve = ToolStreamSieve::new();
        let tool_names = names(&["read_file"]);
        let events = sieve.process_chunk(
            r#"{"tool_calls":[{"name":"read_file","input":{"path":"RE"#,
            &tool_names,
            EarlyEmit::Off,
        );
        assert!(events.iter().all(|e| e.tool_call_deltas.is_empty()));
    }

    #[test]
    fn early_low_emits_after_first_input_key() {
        let mut sieve = ToolStreamSieve::new();
        let tool_names = names(&["read_file"]);

        // name 已验证但 input 首键未闭合：还不能发
        let e1 = sieve.process_chunk(
            r#"{"tool_calls":[{"name":"read_file","input":{"pa"#,
            &tool_names,
            EarlyEmit::Low,
        );
        assert!(e1.iter().all(|e| e.tool_call_deltas.is_empty()));

        // 首键闭合之后开始吐增量
        let e2 = sieve.process_chunk(r#"th":"READ"#, &tool_names, EarlyEmit::Low);
        let deltas: Vec<_> = e2.iter().flat_map(|e| e.tool_call_deltas.clone()).collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].name, "read_file");
        assert!(deltas[0].arguments_fragment.starts_with(r#"{"path""#));

        // 后续增量只包含新内容
        let e3 = sieve.process_chunk("ME.MD", &tool_names, EarlyEmit::Low);
        let deltas3: Vec<_> = e3.iter().flat_map(|e| e.tool_call_deltas.clone()).collect();
        assert_eq!(deltas3.len(), 1);
        assert_eq!(deltas3[0].arguments_fragment, "ME.MD");

        // 完整后照常产出终态 tool_calls
        let e4 = sieve.process_chunk(r#""}}]}"#, &tool_names, EarlyEmit::Low);
        assert_eq!(all_calls(&e4).len(), 1);
    }

    #[test]
    fn early_low_rejects_unknown_name() {
        let mut sieve = ToolStreamSieve::new();
        let tool_names = names(&["read_file"]);
        let events = sieve.process_chunk(
            r#"{"tool_calls":[{"name":"evil","input":{"path":"x","#,
            &tool_names,
            EarlyEmit::Low,
        );
        assert!(events.iter().all(|e| e.tool_call_deltas.is_empty()));
    }

    #[test]
    fn early_high_waits_for_balanced_input() {
        let mut sieve = ToolStreamSieve::new();
        let tool_names = names(&["read_file"]);

        let e1 = sieve.process_chunk(
            r#"{"tool_calls":[{"name":"read_file","input":{"path":"a""#,
            &tool_names,
            EarlyEmit::High,
        );
        assert!(e1.iter().all(|e| e.tool_call_deltas.is_empty()));

        let e2 = sieve.process_chunk("}", &tool_names, EarlyEmit::High);
        let deltas: Vec<_> = e2.iter().flat_map(|e| e.tool_call_deltas.clone()).collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].arguments_fragment, r#"{"path":"a"}"#);

        let e3 = sieve.process_chunk("}]}", &tool_names, EarlyEmit::High);
        assert_eq!(all_calls(&e3).len(), 1);
    }
}
