use crate::gateway::frame::Frame;
use crate::sse::{LineResult, PartType, is_citation};
use crate::stream::{ParsedDecision, StopReason, StreamHooks};
use crate::toolcall::parse_tool_calls;
use crate::util::tokens::estimate_tokens;
use chrono::Utc;
use sonic_rs::Value;
use tokio::sync::mpsc;

fn obj() -> sonic_rs::Object {
    sonic_rs::Object::new()
}

/// Anthropic messages 流式运行时。
///
/// 事件序列：`message_start` → 交替的 content_block_start/delta/stop
/// （thinking 块与 text 块）→ 收尾时可选 tool_use 块 →
/// `message_delta`（stop_reason + usage）→ `message_stop`。
pub struct ClaudeStreamRuntime {
    tx: mpsc::Sender<Frame>,
    message_id: String,
    model: String,
    input_basis: String,

    thinking_enabled: bool,
    search_enabled: bool,
    buffer_tool_content: bool,
    tool_names: Vec<String>,

    thinking: String,
    text: String,

    next_block_index: i64,
    thinking_block: Option<i64>,
    text_block: Option<i64>,
    started: bool,
    ended: bool,
    upstream_err: String,
    client_gone: bool,
}

impl ClaudeStreamRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: mpsc::Sender<Frame>,
        message_id: String,
        model: String,
        input_basis: String,
        thinking_enabled: bool,
        search_enabled: bool,
        tool_names: Vec<String>,
        sieve_enabled: bool,
    ) -> Self {
        let buffer_tool_content = sieve_enabled && !tool_names.is_empty();
        Self {
            tx,
            message_id,
            model,
            input_basis,
            thinking_enabled,
            search_enabled,
            buffer_tool_content,
            tool_names,
            thinking: String::new(),
            text: String::new(),
            next_block_index: 0,
            thinking_block: None,
            text_block: None,
            started: false,
            ended: false,
            upstream_err: String::new(),
            client_gone: false,
        }
    }

    async fn send(&mut self, event: &str, payload: Value) {
        if self.client_gone {
            return;
        }
        let data = sonic_rs::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        if self.tx.send(Frame::named(event, data)).await.is_err() {
            self.client_gone = true;
        }
    }

    pub async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let input_tokens = estimate_tokens(&self.input_basis);

        let mut usage = obj();
        usage.insert(&"input_tokens", input_tokens as i64);
        usage.insert(&"output_tokens", 0i64);

        let mut message = obj();
        message.insert(&"id", self.message_id.as_str());
        message.insert(&"type", "message");
        message.insert(&"role", "assistant");
        message.insert(&"model", self.model.as_str());
        message.insert(&"content", Value::from(Vec::<Value>::new()));
        message.insert(&"stop_reason", Value::default());
        message.insert(&"stop_sequence", Value::default());
        message.insert(&"usage", usage.into_value());

        let mut payload = obj();
        payload.insert(&"type", "message_start");
        payload.insert(&"message", message.into_value());
        self.send("message_start", payload.into_value()).await;
    }

    async fn close_block(&mut self, index: i64) {
        let mut payload = obj();
        payload.insert(&"type", "content_block_stop");
        payload.insert(&"index", index);
        self.send("content_block_stop", payload.into_value()).await;
    }

    async fn close_thinking_block(&mut self) {
        if let Some(idx) = self.thinking_block.take() {
            self.close_block(idx).await;
        }
    }

    async fn close_text_block(&mut self) {
        if let Some(idx) = self.text_block.take() {
            self.close_block(idx).await;
        }
    }

    async fn open_block(&mut self, block: Value) -> i64 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        let mut payload = obj();
        payload.insert(&"type", "content_block_start");
        payload.insert(&"index", index);
        payload.insert(&"content_block", block);
        self.send("content_block_start", payload.into_value()).await;
        index
    }

    async fn emit_thinking_delta(&mut self, text: &str) {
        if self.thinking_block.is_none() {
            self.close_text_block().await;
            let mut block = obj();
            block.insert(&"type", "thinking");
            block.insert(&"thinking", "");
            let idx = self.open_block(block.into_value()).await;
            self.thinking_block = Some(idx);
        }
        let index = self.thinking_block.unwrap_or(0);
        let mut delta = obj();
        delta.insert(&"type", "thinking_delta");
        delta.insert(&"thinking", text);
        let mut payload = obj();
        payload.insert(&"type", "content_block_delta");
        payload.insert(&"index", index);
        payload.insert(&"delta", delta.into_value());
        self.send("content_block_delta", payload.into_value()).await;
    }

    async fn emit_text_delta(&mut self, text: &str) {
        if self.text_block.is_none() {
            self.close_thinking_block().await;
            let mut block = obj();
            block.insert(&"type", "text");
            block.insert(&"text", "");
            let idx = self.open_block(block.into_value()).await;
            self.text_block = Some(idx);
        }
        let index = self.text_block.unwrap_or(0);
        let mut delta = obj();
        delta.insert(&"type", "text_delta");
        delta.insert(&"text", text);
        let mut payload = obj();
        payload.insert(&"type", "content_block_delta");
        payload.insert(&"index", index);
        payload.insert(&"delta", delta.into_value());
        self.send("content_block_delta", payload.into_value()).await;
    }

    async fn send_error(&mut self, message: &str) {
        let msg = if message.trim().is_empty() {
            "上游流异常"
        } else {
            message
        };
        let mut error = obj();
        error.insert(&"type", "api_error");
        error.insert(&"message", msg);
        error.insert(&"code", "internal_error");
        error.insert(&"param", Value::default());
        let mut payload = obj();
        payload.insert(&"type", "error");
        payload.insert(&"error", error.into_value());
        self.send("error", payload.into_value()).await;

        let mut stop = obj();
        stop.insert(&"type", "message_stop");
        self.send("message_stop", stop.into_value()).await;
    }

    async fn finalize(&mut self, mut stop_reason: &'static str) {
        if self.ended {
            return;
        }
        self.ended = true;

        self.close_thinking_block().await;
        self.close_text_block().await;

        if self.buffer_tool_content {
            let detected = parse_tool_calls(&self.text, &self.tool_names);
            if !detected.is_empty() {
                stop_reason = "tool_use";
                let now = Utc::now().timestamp();
                for (i, tc) in detected.iter().enumerate() {
                    let mut block = obj();
                    block.insert(&"type", "tool_use");
                    block.insert(
                        &"id",
                        format!("toolu_{now}_{}", self.next_block_index + i as i64).as_str(),
                    );
                    block.insert(&"name", tc.name.as_str());
                    block.insert(&"input", tc.input.clone());
                    let idx = self.open_block(block.into_value()).await;
                    self.close_block(idx).await;
                }
            } else if !self.text.is_empty() {
                // 缓冲的普通文本在收尾时一次性给出
                let text = self.text.clone();
                self.emit_text_delta(&text).await;
                self.close_text_block().await;
            }
        }

        let output_tokens = estimate_tokens(&self.thinking) + estimate_tokens(&self.text);
        let mut delta = obj();
        delta.insert(&"stop_reason", stop_reason);
        delta.insert(&"stop_sequence", Value::default());
        let mut usage = obj();
        usage.insert(&"output_tokens", output_tokens as i64);
        let mut payload = obj();
        payload.insert(&"type", "message_delta");
        payload.insert(&"delta", delta.into_value());
        payload.insert(&"usage", usage.into_value());
        self.send("message_delta", payload.into_value()).await;

        let mut stop = obj();
        stop.insert(&"type", "message_stop");
        self.send("message_stop", stop.into_value()).await;
    }
}

impl StreamHooks for ClaudeStreamRuntime {
    async fn on_parsed(&mut self, parsed: LineResult) -> ParsedDecision {
        if !parsed.parsed {
            return ParsedDecision::default();
        }
        if !parsed.error_message.is_empty() && !parsed.content_filter {
            self.upstream_err = parsed.error_message.clone();
            return ParsedDecision {
                stop: true,
                stop_reason: Some(StopReason::UpstreamError),
                content_seen: false,
            };
        }
        if parsed.stop {
            return ParsedDecision {
                stop: true,
                stop_reason: None,
                content_seen: false,
            };
        }

        let mut content_seen = false;
        for p in &parsed.parts {
            if p.text.is_empty() {
                continue;
            }
            if p.part_type != PartType::Thinking && self.search_enabled && is_citation(&p.text) {
                continue;
            }
            content_seen = true;

            if p.part_type == PartType::Thinking {
                // thinking 关闭时静默丢弃
                if !self.thinking_enabled {
                    continue;
                }
                self.thinking.push_str(&p.text);
                let text = p.text.clone();
                self.emit_thinking_delta(&text).await;
                continue;
            }

            self.text.push_str(&p.text);
            if self.buffer_tool_content {
                continue;
            }
            let text = p.text.clone();
            self.emit_text_delta(&text).await;
        }

        ParsedDecision {
            stop: false,
            stop_reason: None,
            content_seen,
        }
    }

    async fn on_keep_alive(&mut self) {
        let mut payload = obj();
        payload.insert(&"type", "ping");
        self.send("ping", payload.into_value()).await;
    }

    async fn on_finalize(&mut self, reason: StopReason, scan_err: Option<anyhow::Error>) {
        if reason == StopReason::UpstreamError {
            let msg = self.upstream_err.clone();
            self.send_error(&msg).await;
            return;
        }
        if let Some(e) = scan_err {
            self.send_error(&e.to_string()).await;
            return;
        }
        self.finalize("end_turn").await;
    }

    async fn on_context_done(&mut self) {
        self.client_gone = true;
    }
}
