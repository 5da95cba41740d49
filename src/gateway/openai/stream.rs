use crate::format::openai as openaifmt;
use crate::gateway::frame::Frame;
use crate::gateway::openai::types::{ChatChunk, Delta};
use crate::sse::{LineResult, PartType, is_citation};
use crate::stream::{ParsedDecision, StopReason, StreamHooks};
use crate::toolcall::{EarlyEmit, SieveEvent, ToolCall, ToolStreamSieve};
use crate::util::id;
use sonic_rs::{JsonValueMutTrait, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// OpenAI chat.completions 流式运行时。
///
/// 角色块只发一次；text 走 `delta.content`，thinking 走
/// `delta.reasoning_content`；请求带 tools 时文本经过筛分器，
/// 工具调用以 `delta.tool_calls` 增量发出。
pub struct ChatStreamRuntime {
    tx: mpsc::Sender<Frame>,
    completion_id: String,
    created: i64,
    model: String,
    final_prompt: String,

    thinking_enabled: bool,
    search_enabled: bool,
    tool_names: Vec<String>,
    sieve: Option<ToolStreamSieve>,
    early: EarlyEmit,

    sent_role: bool,
    thinking: String,
    text: String,
    completed_calls: Vec<ToolCall>,
    stream_call_ids: HashMap<usize, String>,
    delta_started: HashMap<usize, bool>,

    upstream_err: String,
    content_filter: bool,
    client_gone: bool,
}

impl ChatStreamRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: mpsc::Sender<Frame>,
        completion_id: String,
        created: i64,
        model: String,
        final_prompt: String,
        thinking_enabled: bool,
        search_enabled: bool,
        tool_names: Vec<String>,
        sieve_enabled: bool,
        early: EarlyEmit,
    ) -> Self {
        let buffer_tools = sieve_enabled && !tool_names.is_empty();
        Self {
            tx,
            completion_id,
            created,
            model,
            final_prompt,
            thinking_enabled,
            search_enabled,
            tool_names,
            sieve: buffer_tools.then(ToolStreamSieve::new),
            early,
            sent_role: false,
            thinking: String::new(),
            text: String::new(),
            completed_calls: Vec::new(),
            stream_call_ids: HashMap::new(),
            delta_started: HashMap::new(),
            upstream_err: String::new(),
            content_filter: false,
            client_gone: false,
        }
    }

    async fn send(&mut self, frame: Frame) {
        if self.client_gone {
            return;
        }
        if self.tx.send(frame).await.is_err() {
            self.client_gone = true;
        }
    }

    async fn send_chunk(&mut self, delta: Delta) {
        let json = ChatChunk::new(&self.completion_id, self.created, &self.model, delta).to_json();
        self.send(Frame::Data(json)).await;
    }

    async fn ensure_role(&mut self) {
        if self.sent_role {
            return;
        }
        self.sent_role = true;
        self.send_chunk(Delta {
            role: "assistant".to_string(),
            ..Delta::default()
        })
        .await;
    }

    fn call_id_for(&mut self, index: usize) -> String {
        self.stream_call_ids
            .entry(index)
            .or_insert_with(id::tool_call_id)
            .clone()
    }

    async fn emit_sieve_events(&mut self, events: Vec<SieveEvent>) {
        for evt in events {
            if !evt.content.is_empty() {
                self.ensure_role().await;
                self.send_chunk(Delta {
                    content: evt.content.clone(),
                    ..Delta::default()
                })
                .await;
            }
            for d in &evt.tool_call_deltas {
                let index = d.index;
                let call_id = self.call_id_for(index);
                // 首个增量带上 name，其余只带参数片段
                let first = !self.delta_started.get(&index).copied().unwrap_or(false);
                self.delta_started.insert(index, true);
                let mut function = sonic_rs::Object::new();
                if first {
                    function.insert(&"name", d.name.as_str());
                }
                function.insert(&"arguments", d.arguments_fragment.as_str());
                let mut call = sonic_rs::Object::new();
                call.insert(&"index", index as i64);
                call.insert(&"id", call_id.as_str());
                call.insert(&"type", "function");
                call.insert(&"function", function.into_value());
                self.ensure_role().await;
                self.send_chunk(Delta {
                    tool_calls: vec![call.into_value()],
                    ..Delta::default()
                })
                .await;
            }
            if !evt.tool_calls.is_empty() {
                let base = self.completed_calls.len();
                let ids: Vec<String> = (0..evt.tool_calls.len())
                    .map(|i| self.call_id_for(base + i))
                    .collect();
                let mut formatted = openaifmt::format_stream_tool_calls(&evt.tool_calls, &ids);
                for (i, f) in formatted.iter_mut().enumerate() {
                    // index 修正为全局序号
                    if let Some(obj) = f.as_object_mut() {
                        obj.insert(&"index", (base + i) as i64);
                    }
                }
                self.completed_calls.extend(evt.tool_calls.clone());
                self.ensure_role().await;
                self.send_chunk(Delta {
                    tool_calls: formatted,
                    ..Delta::default()
                })
                .await;
            }
        }
    }

    fn finish_reason(&self) -> &'static str {
        if self.content_filter {
            "content_filter"
        } else if !self.completed_calls.is_empty() {
            "tool_calls"
        } else {
            "stop"
        }
    }
}

impl StreamHooks for ChatStreamRuntime {
    async fn on_parsed(&mut self, parsed: LineResult) -> ParsedDecision {
        if !parsed.parsed {
            return ParsedDecision::default();
        }
        if parsed.content_filter {
            self.content_filter = true;
            return ParsedDecision {
                stop: true,
                stop_reason: Some(StopReason::HandlerRequested),
                content_seen: false,
            };
        }
        if !parsed.error_message.is_empty() {
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
                if !self.thinking_enabled {
                    continue;
                }
                self.thinking.push_str(&p.text);
                self.ensure_role().await;
                self.send_chunk(Delta {
                    reasoning_content: p.text.clone(),
                    ..Delta::default()
                })
                .await;
                continue;
            }

            self.text.push_str(&p.text);
            if self.sieve.is_some() {
                let tool_names = self.tool_names.clone();
                let early = self.early;
                let events = self
                    .sieve
                    .as_mut()
                    .map(|s| s.process_chunk(&p.text, &tool_names, early))
                    .unwrap_or_default();
                self.emit_sieve_events(events).await;
            } else {
                self.ensure_role().await;
                self.send_chunk(Delta {
                    content: p.text.clone(),
                    ..Delta::default()
                })
                .await;
            }
        }

        ParsedDecision {
            stop: false,
            stop_reason: None,
            content_seen,
        }
    }

    async fn on_keep_alive(&mut self) {
        self.send(Frame::Comment("keep-alive")).await;
    }

    async fn on_finalize(&mut self, reason: StopReason, scan_err: Option<anyhow::Error>) {
        if reason == StopReason::UpstreamError || scan_err.is_some() {
            let msg = if self.upstream_err.is_empty() {
                scan_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "上游流读取失败".to_string())
            } else {
                self.upstream_err.clone()
            };
            self.send(Frame::Data(openai_error_json(&msg))).await;
            self.send(Frame::Data("[DONE]".to_string())).await;
            return;
        }

        if self.sieve.is_some() {
            let tool_names = self.tool_names.clone();
            let events = self
                .sieve
                .as_mut()
                .map(|s| s.flush(&tool_names))
                .unwrap_or_default();
            self.emit_sieve_events(events).await;
        }

        self.ensure_role().await;
        let usage = openaifmt::build_chat_usage(&self.final_prompt, &self.thinking, &self.text);
        let json = ChatChunk::finish(
            &self.completion_id,
            self.created,
            &self.model,
            self.finish_reason(),
            usage,
        )
        .to_json();
        self.send(Frame::Data(json)).await;
        self.send(Frame::Data("[DONE]".to_string())).await;
    }

    async fn on_context_done(&mut self) {
        // 客户端已断开：无事可做，池位由上层释放。
        self.client_gone = true;
    }
}

/// OpenAI SSE 错误事件体。
pub fn openai_error_json(msg: &str) -> String {
    let encoded = sonic_rs::to_string(&Value::from(msg)).unwrap_or_else(|_| "\"\"".to_string());
    format!("{{\"error\":{{\"message\":{encoded},\"type\":\"server_error\"}}}}")
}
