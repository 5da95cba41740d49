use crate::config::known_models;
use crate::deepseek::constants::{KEEP_ALIVE_INTERVAL, MAX_KEEPALIVE_COUNT, STREAM_IDLE_TIMEOUT};
use crate::error::AppError;
use crate::format::openai as openaifmt;
use crate::gateway::frame::Frame;
use crate::gateway::openai::normalize::normalize_chat_request;
use crate::gateway::openai::stream::{ChatStreamRuntime, openai_error_json};
use crate::gateway::standard::StandardRequest;
use crate::gateway::{GatewayState, attempts_for};
use crate::logging;
use crate::sse::collect_stream;
use crate::stream::{ConsumeConfig, consume_sse};
use crate::toolcall::EarlyEmit;
use crate::util::id;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use sonic_rs::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// 把 Frame 通道包成 SSE 响应体。
pub fn sse_response(rx: mpsc::Receiver<Frame>) -> Response {
    let stream = ReceiverStream::new(rx).map(|f| Ok::<_, Infallible>(f.into_event()));
    Sse::new(stream).into_response()
}

/// 通道关闭（客户端断开）时取消整个请求上下文。
pub fn cancel_on_client_gone(tx: &mpsc::Sender<Frame>, cancel: &CancellationToken) {
    let tx = tx.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tx.closed().await;
        cancel.cancel();
    });
}

pub fn stream_consume_config(cancel: CancellationToken, thinking: bool) -> ConsumeConfig {
    ConsumeConfig {
        cancel,
        thinking_enabled: thinking,
        initial_type: None,
        keep_alive_interval: Some(KEEP_ALIVE_INTERVAL),
        idle_timeout: Some(STREAM_IDLE_TIMEOUT),
        max_keep_alive_no_input: MAX_KEEPALIVE_COUNT,
    }
}

pub async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    if state.store.env().log_level().client_enabled() {
        logging::client_request("POST", "/v1/chat/completions", &headers, body.as_ref());
    }

    let req: Value = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => {
            return AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。")
                .into_openai_response();
        }
    };
    let std_req = match normalize_chat_request(&state.store, &req) {
        Ok(v) => v,
        Err(e) => return e.into_openai_response(),
    };

    let cancel = CancellationToken::new();
    let mut auth = match state.auth.determine(&cancel, &headers).await {
        Ok(v) => v,
        Err(e) => return e.into_openai_response(),
    };

    if std_req.stream {
        return handle_chat_stream(state, std_req, auth, cancel).await;
    }

    let attempts = attempts_for(&state);
    let resp = state
        .client
        .start_completion(
            &cancel,
            &state.auth,
            &mut auth,
            |sid| std_req.completion_payload(sid),
            attempts,
        )
        .await;
    let resp = match resp {
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

    let mut out = openaifmt::build_chat_completion(
        &id::chat_completion_id(),
        &std_req.response_model,
        &std_req.final_prompt,
        &collected.thinking,
        &collected.text,
        &effective_tool_names(&state, &std_req),
    );
    if collected.content_filter {
        out = openaifmt::override_chat_finish_reason(&out, "content_filter");
    }

    if state.store.env().log_level().client_enabled() {
        logging::client_response(
            200,
            started.elapsed(),
            sonic_rs::to_vec(&out).unwrap_or_default().as_ref(),
        );
    }
    Json(out).into_response()
}

/// 工具筛分被全局关闭时按"无工具"处理。
pub fn effective_tool_names(state: &Arc<GatewayState>, std_req: &StandardRequest) -> Vec<String> {
    if state.store.toolcall_mode_enabled() {
        std_req.tool_names.clone()
    } else {
        Vec::new()
    }
}

async fn handle_chat_stream(
    state: Arc<GatewayState>,
    std_req: StandardRequest,
    mut auth: crate::auth::RequestAuth,
    cancel: CancellationToken,
) -> Response {
    let (tx, rx) = mpsc::channel::<Frame>(256);
    cancel_on_client_gone(&tx, &cancel);

    let state2 = state.clone();
    tokio::spawn(async move {
        let started = Instant::now();
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
                let _ = tx.send(Frame::Data(openai_error_json(&e.to_string()))).await;
                let _ = tx.send(Frame::Data("[DONE]".to_string())).await;
            }
            Ok(resp) => {
                let sieve_enabled = state2.store.toolcall_mode_enabled();
                let early =
                    EarlyEmit::parse(&state2.store.toolcall_early_emit_confidence());
                let mut rt = ChatStreamRuntime::new(
                    tx.clone(),
                    id::chat_completion_id(),
                    Utc::now().timestamp(),
                    std_req.response_model.clone(),
                    std_req.final_prompt.clone(),
                    std_req.thinking,
                    std_req.search,
                    std_req.tool_names.clone(),
                    sieve_enabled,
                    early,
                );
                consume_sse(
                    stream_consume_config(cancel.clone(), std_req.thinking),
                    resp,
                    &mut rt,
                )
                .await;
            }
        }
        state2.auth.release(&mut auth);
        logging::stream_finished("openai_chat", "closed", started.elapsed());
    });

    sse_response(rx)
}

pub async fn handle_list_models(State(state): State<Arc<GatewayState>>) -> Response {
    let created = Utc::now().timestamp();
    let mut data: Vec<Value> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for m in known_models() {
        seen.push(m.to_string());
        data.push(model_entry(m, created));
    }
    for alias in state.store.snapshot().model_aliases.keys() {
        if !seen.contains(alias) {
            data.push(model_entry(alias, created));
        }
    }

    let mut out = sonic_rs::Object::new();
    out.insert(&"object", "list");
    out.insert(&"data", Value::from(data));
    Json(out.into_value()).into_response()
}

pub async fn handle_get_model(
    State(state): State<Arc<GatewayState>>,
    Path(model_id): Path<String>,
) -> Response {
    let known = known_models().iter().any(|m| *m == model_id)
        || state.store.snapshot().model_aliases.contains_key(&model_id);
    if !known {
        return AppError::not_found(format!("模型不存在: {model_id}")).into_openai_response();
    }
    Json(model_entry(&model_id, Utc::now().timestamp())).into_response()
}

fn model_entry(id: &str, created: i64) -> Value {
    let mut m = sonic_rs::Object::new();
    m.insert(&"id", id);
    m.insert(&"object", "model");
    m.insert(&"created", created);
    m.insert(&"owned_by", "ds2api");
    m.into_value()
}

pub async fn handle_embeddings(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = state.auth.determine_caller(&headers) {
        return e.into_openai_response();
    }
    let req: Value = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => {
            return AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。")
                .into_openai_response();
        }
    };
    match super::embeddings::build_embeddings_response(&state, &req) {
        Ok(v) => Json(v).into_response(),
        Err(e) => e.into_openai_response(),
    }
}
