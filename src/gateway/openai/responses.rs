use crate::format::openai as openaifmt;
use crate::gateway::frame::Frame;
use crate::gateway::openai::stream::openai_error_json;
use crate::sse::{LineResult, PartType, is_citation};
use crate::stream::{ParsedDecision, StopReason, StreamHooks};
use crate::toolcall::{EarlyEmit, SieveEvent, ToolCall, ToolStreamSieve};
use crate::util::id;
use sonic_rs::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// 持久化回调：流结束时把终态对象写进 response store。
pub type PersistFn = Box<dyn FnMut(Value) + Send>;

/// OpenAI responses 流式运行时。
///
/// 事件序列：`response.created` → 若干 delta（output_text /
/// reasoning / 工具调用增量）→ `response.completed` → `[DONE]`。
/// 流内发出的 call_id 与终态对象里的保持一致。
pub struct ResponsesStreamRuntime {
    tx: mpsc::Sender<Frame>,
    response_id: String,
    model: String,
    final_prompt: String,

    thinking_enabled: bool,
    search_enabled: bool,
    tool_names: Vec<String>,
    sieve: Option<ToolStreamSieve>,
    early: EarlyEmit,

    thinking: String,
    text: String,
    completed_calls: Vec<ToolCall>,
    stream_call_ids: HashMap<usize, String>,
    early_args: HashMap<usize, String>,

    persist: Option<PersistFn>,
    upstream_err: String,
    content_filter: bool,
    started: bool,
    client_gone: bool,
}

impl ResponsesStreamRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: mpsc::Sender<Frame>,
        response_id: String,
        model: String,
        final_prompt: String,
        thinking_enabled: bool,
        search_enabled: bool,
        tool_names: Vec<String>,
        sieve_enabled: bool,
        early: EarlyEmit,
        persist: Option<PersistFn>,
    ) -> Self {
        let buffer_tools = sieve_enabled && !tool_names.is_empty();
        Self {
            tx,
            response_id,
            model,
            final_prompt,
            thinking_enabled,
            search_enabled,
            tool_names,
            sieve: buffer_tools.then(ToolStreamSieve::new),
            early,
            thinking: String::new(),
            text: String::new(),
            completed_calls: Vec::new(),
            stream_call_ids: HashMap::new(),
            early_args: HashMap::new(),
            persist,
            upstream_err: String::new(),
            content_filter: false,
            started: false,
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

    async fn send_event(&mut self, payload: Value) {
        use sonic_rs::JsonValueTrait;
        let event = payload
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("message")
            .to_string();
        let data = sonic_rs::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        self.send(Frame::named(&event, data)).await;
    }

    /// 流一开始就发 created，保证客户端先见到响应骨架。
    pub async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let payload = openaifmt::build_responses_created_payload(&self.response_id, &self.model);
        self.send_event(payload).await;
    }

    fn call_id_for(&mut self, index: usize) -> String {
        self.stream_call_ids
            .entry(index)
            .or_insert_with(id::tool_call_id)
            .clone()
    }

    fn ordered_call_ids(&self) -> Vec<String> {
        let mut ids: Vec<(usize, String)> = self
            .stream_call_ids
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        ids.sort_by_key(|(k, _)| *k);
        ids.into_iter().map(|(_, v)| v).collect()
    }

    async fn emit_sieve_events(&mut self, events: Vec<SieveEvent>) {
        for evt in events {
            if !evt.content.is_empty() {
                let payload = openaifmt::build_responses_text_delta_payload(
                    &self.response_id,
                    &evt.content,
                );
                self.send_event(payload).await;
            }
            for d in &evt.tool_call_deltas {
                let call_id = self.call_id_for(d.index);
                self.early_args
                    .entry(d.index)
                    .or_default()
                    .push_str(&d.arguments_fragment);
                let payload = openaifmt::build_responses_function_call_arguments_delta_payload(
                    &self.response_id,
                    &call_id,
                    &d.name,
                    &d.arguments_fragment,
                );
                self.send_event(payload).await;

                let mut call = sonic_rs::Object::new();
                call.insert(&"index", d.index as i64);
                call.insert(&"id", call_id.as_str());
                call.insert(&"name", d.name.as_str());
                call.insert(&"arguments_delta", d.arguments_fragment.as_str());
                let payload = openaifmt::build_responses_tool_call_delta_payload(
                    &self.response_id,
                    vec![call.into_value()],
                );
                self.send_event(payload).await;
            }
            if !evt.tool_calls.is_empty() {
                self.emit_completed_calls(&evt.tool_calls).await;
            }
        }
    }

    async fn emit_completed_calls(&mut self, calls: &[ToolCall]) {
        let base = self.completed_calls.len();
        let ids: Vec<String> = (0..calls.len())
            .map(|i| self.call_id_for(base + i))
            .collect();

        for (i, tc) in calls.iter().enumerate() {
            let payload = openaifmt::build_responses_function_call_arguments_done_payload(
                &self.response_id,
                &ids[i],
                &tc.name,
                &tc.arguments_json(),
            );
            self.send_event(payload).await;
        }
        let formatted = openaifmt::format_stream_tool_calls(calls, &ids);
        let payload =
            openaifmt::build_responses_tool_call_done_payload(&self.response_id, formatted);
        self.send_event(payload).await;
        self.completed_calls.extend(calls.iter().cloned());
    }

    async fn finalize_success(&mut self) {
        if self.sieve.is_some() {
            let tool_names = self.tool_names.clone();
            let events = self
                .sieve
                .as_mut()
                .map(|s| s.flush(&tool_names))
                .unwrap_or_default();
            self.emit_sieve_events(events).await;
        }

        if !self.thinking.is_empty() {
            let payload = openaifmt::build_responses_reasoning_text_done_payload(
                &self.response_id,
                &self.thinking.clone(),
            );
            self.send_event(payload).await;
        }

        let obj = openaifmt::build_response_object(
            &self.response_id,
            &self.model,
            &self.final_prompt,
            &self.thinking,
            &self.text,
            &self.tool_names,
            &self.ordered_call_ids(),
        );
        if let Some(persist) = self.persist.as_mut() {
            persist(obj.clone());
        }
        let payload = openaifmt::build_responses_completed_payload(obj);
        self.send_event(payload).await;
        self.send(Frame::Data("[DONE]".to_string())).await;
    }
}

impl StreamHooks for ResponsesStreamRuntime {
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
                let reasoning = openaifmt::build_responses_reasoning_delta_payload(
                    &self.response_id,
                    &p.text,
                );
                self.send_event(reasoning).await;
                let compat = openaifmt::build_responses_reasoning_text_delta_payload(
                    &self.response_id,
                    &p.text,
                );
                self.send_event(compat).await;
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
                let payload =
                    openaifmt::build_responses_text_delta_payload(&self.response_id, &p.text);
                self.send_event(payload).await;
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
        self.finalize_success().await;
    }

    async fn on_context_done(&mut self) {
        self.client_gone = true;
    }
}

use crate::error::AppError;
use crate::gateway::openai::handler::{
    cancel_on_client_gone, effective_tool_names, sse_response, stream_consume_config,
};
use crate::gateway::openai::normalize::normalize_responses_request;
use crate::gateway::{GatewayState, attempts_for};
use crate::logging;
use crate::sse::collect_stream;
use crate::stream::consume_sse;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub async fn handle_responses(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    if state.store.env().log_level().client_enabled() {
        logging::client_request("POST", "/v1/responses", &headers, body.as_ref());
    }

    let req: Value = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => {
            return AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。")
                .into_openai_response();
        }
    };
    let std_req = match normalize_responses_request(&state.store, &req) {
        Ok(v) => v,
        Err(e) => return e.into_openai_response(),
    };

    let cancel = CancellationToken::new();
    let mut auth = match state.auth.determine(&cancel, &headers).await {
        Ok(v) => v,
        Err(e) => return e.into_openai_response(),
    };
    let owner = auth.caller_id.clone();
    let response_id = id::response_id();

    if std_req.stream {
        let (tx, rx) = tokio::sync::mpsc::channel::<Frame>(256);
        cancel_on_client_gone(&tx, &cancel);

        let state2 = state.clone();
        tokio::spawn(async move {
            let attempts = attempts_for(&state2);
            let upstream = state2
                .client
                .start_completion(
                    &cancel,
                    &state2.auth,
                    &mut auth,
                    |sid| std_req.completion_payload(sid),
                    attempts,
                )
                .await;

            match upstream {
                Err(e) => {
                    let _ = tx
                        .send(Frame::Data(openai_error_json(&e.to_string())))
                        .await;
                    let _ = tx.send(Frame::Data("[DONE]".to_string())).await;
                }
                Ok(resp) => {
                    let sieve_enabled = state2.store.toolcall_mode_enabled();
                    let early =
                        EarlyEmit::parse(&state2.store.toolcall_early_emit_confidence());
                    let responses_store = state2.responses.clone();
                    let persist_owner = owner.clone();
                    let persist_id = response_id.clone();
                    let mut rt = ResponsesStreamRuntime::new(
                        tx.clone(),
                        response_id.clone(),
                        std_req.response_model.clone(),
                        std_req.final_prompt.clone(),
                        std_req.thinking,
                        std_req.search,
                        std_req.tool_names.clone(),
                        sieve_enabled,
                        early,
                        Some(Box::new(move |obj| {
                            responses_store.put(&persist_owner, &persist_id, obj);
                        })),
                    );
                    rt.start().await;
                    consume_sse(
                        stream_consume_config(cancel.clone(), std_req.thinking),
                        resp,
                        &mut rt,
                    )
                    .await;
                }
            }
            state2.auth.release(&mut auth);
        });

        return sse_response(rx);
    }

    let attempts = attempts_for(&state);
    let upstream = state
        .client
        .start_completion(
            &cancel,
            &state.auth,
            &mut auth,
            |sid| std_req.completion_payload(sid),
            attempts,
        )
        .await;
    let resp = match upstream {
        Ok(v) => v,
        Err(e) => {
            state.auth.release(&mut auth);
            return AppError::upstream(e.to_string()).into_openai_response();
        }
    };

    let collected = collect_stream(resp, std_req.thinking, std_req.thinking).await;
    state.auth.release(&mut auth);

    if !collected.error_message.is_empty() && !collected.content_filter {
        return AppError::upstream(collected.error_message).into_openai_response();
    }

    let out = openaifmt::build_response_object(
        &response_id,
        &std_req.response_model,
        &std_req.final_prompt,
        &collected.thinking,
        &collected.text,
        &effective_tool_names(&state, &std_req),
        &[],
    );
    state.responses.put(&owner, &response_id, out.clone());

    if state.store.env().log_level().client_enabled() {
        logging::client_response(
            200,
            started.elapsed(),
            sonic_rs::to_vec(&out).unwrap_or_default().as_ref(),
        );
    }
    Json(out).into_response()
}

/// `GET /v1/responses/{id}`：按租户取回缓存的响应对象。
pub async fn handle_get_response(
    State(state): State<Arc<GatewayState>>,
    Path(response_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let auth = match state.auth.determine_caller(&headers) {
        Ok(v) => v,
        Err(e) => return e.into_openai_response(),
    };
    match state.responses.get(&auth.caller_id, &response_id) {
        Some(v) => Json(v).into_response(),
        None => AppError::not_found(format!("响应不存在: {response_id}")).into_openai_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ConsumeConfig;
    use sonic_rs::{JsonContainerTrait, JsonValueTrait};
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    fn fixed_response(body: String) -> reqwest::Response {
        let resp = http::Response::builder().status(200).body(body).unwrap();
        reqwest::Response::from(resp)
    }

    fn sse_line(v: &str) -> String {
        let mut o = sonic_rs::Object::new();
        o.insert(&"p", "response/content");
        o.insert(&"v", v);
        format!("data: {}\n", sonic_rs::to_string(&o.into_value()).unwrap())
    }

    async fn run_stream(
        body: String,
        tool_names: &[&str],
        early: EarlyEmit,
    ) -> (Vec<Frame>, Option<Value>) {
        let (tx, mut rx) = mpsc::channel(256);
        let persisted: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let persisted2 = persisted.clone();
        let mut rt = ResponsesStreamRuntime::new(
            tx,
            "resp_test".to_string(),
            "deepseek-chat".to_string(),
            "prompt".to_string(),
            false,
            false,
            tool_names.iter().map(|s| s.to_string()).collect(),
            !tool_names.is_empty(),
            early,
            Some(Box::new(move |obj| {
                *persisted2.lock().unwrap() = Some(obj);
            })),
        );
        rt.start().await;
        let cfg = ConsumeConfig {
            cancel: CancellationToken::new(),
            thinking_enabled: false,
            initial_type: None,
            keep_alive_interval: None,
            idle_timeout: None,
            max_keep_alive_no_input: 0,
        };
        consume_sse(cfg, fixed_response(body), &mut rt).await;
        drop(rt);

        let mut out = Vec::new();
        while let Some(f) = rx.recv().await {
            out.push(f);
        }
        let stored = persisted.lock().unwrap().clone();
        (out, stored)
    }

    fn event_payload(frames: &[Frame], event: &str) -> Option<Value> {
        frames.iter().find_map(|f| {
            if f.event_name() == Some(event) {
                sonic_rs::from_str(f.data_str()?).ok()
            } else {
                None
            }
        })
    }

    #[tokio::test]
    async fn created_first_completed_last_done_terminates() {
        let body = format!("{}data: [DONE]\n", sse_line("Hello"));
        let (frames, stored) = run_stream(body, &[], EarlyEmit::Off).await;

        assert_eq!(frames[0].event_name(), Some("response.created"));
        assert!(event_payload(&frames, "response.output_text.delta").is_some());
        let completed = event_payload(&frames, "response.completed").unwrap();
        let obj = completed.get("response").unwrap();
        assert_eq!(
            obj.get("output_text").and_then(|v| v.as_str()),
            Some("Hello")
        );
        assert_eq!(frames.last().unwrap().data_str(), Some("[DONE]"));
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn tool_calls_hide_raw_output_text_in_completed() {
        // 终态 output_text 为空，output 同时含 function_call 与
        // tool_calls 包装，且 call_id 与流内 done 事件一致。
        let raw = r#"{"tool_calls":[{"name":"read_file","input":{"path":"README.MD"}}]}"#;
        let body = format!("{}data: [DONE]\n", sse_line(raw));
        let (frames, stored) = run_stream(body, &["read_file"], EarlyEmit::Off).await;

        let fc_done = event_payload(&frames, "response.function_call_arguments.done").unwrap();
        let stream_call_id = fc_done
            .get("call_id")
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string();
        assert!(!stream_call_id.is_empty());

        let completed = event_payload(&frames, "response.completed").unwrap();
        let obj = completed.get("response").unwrap();
        assert_eq!(obj.get("output_text").and_then(|v| v.as_str()), Some(""));

        let output = obj.get("output").unwrap().as_array().unwrap();
        let types: Vec<&str> = output
            .iter()
            .filter_map(|o| o.get("type").and_then(|v| v.as_str()))
            .collect();
        assert!(types.contains(&"function_call"));
        assert!(types.contains(&"tool_calls"));

        let fc = output
            .iter()
            .find(|o| o.get("type").and_then(|v| v.as_str()) == Some("function_call"))
            .unwrap();
        assert_eq!(
            fc.get("call_id").and_then(|v| v.as_str()),
            Some(stream_call_id.as_str())
        );

        assert!(event_payload(&frames, "response.output_tool_call.done").is_some());
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn incomplete_tail_not_duplicated_in_output_text() {
        // 未闭合的尾巴在终态 output_text 里至多出现一次
        let tail = r#"{"tool_calls":[{"name":"read_file","input":"#;
        let body = format!(
            "{}{}data: [DONE]\n",
            sse_line("Before "),
            sse_line(tail)
        );
        let (frames, _) = run_stream(body, &["read_file"], EarlyEmit::Off).await;
        let completed = event_payload(&frames, "response.completed").unwrap();
        let output_text = completed
            .get("response")
            .unwrap()
            .get("output_text")
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(output_text.matches(tail).count() <= 1);
    }

    #[tokio::test]
    async fn early_low_emits_function_call_arguments_delta() {
        let body = format!(
            "{}{}data: [DONE]\n",
            sse_line(r#"{"tool_calls":[{"name":"read_file","input":{"path":"RE"#),
            sse_line(r#"ADME.MD"}}]}"#)
        );
        let (frames, _) = run_stream(body, &["read_file"], EarlyEmit::Low).await;
        assert!(event_payload(&frames, "response.function_call_arguments.delta").is_some());
        assert!(event_payload(&frames, "response.output_tool_call.delta").is_some());
        assert!(event_payload(&frames, "response.function_call_arguments.done").is_some());
    }

    #[tokio::test]
    async fn upstream_error_surfaces_and_terminates() {
        let body = "data: {\"error\":{\"message\":\"boom\"}}\n".to_string();
        let (frames, stored) = run_stream(body, &[], EarlyEmit::Off).await;
        let all: Vec<&str> = frames.iter().filter_map(|f| f.data_str()).collect();
        assert!(all.iter().any(|d| d.contains("boom")));
        assert_eq!(*all.last().unwrap(), "[DONE]");
        assert!(stored.is_none());
    }
}
