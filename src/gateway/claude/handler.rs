use crate::error::AppError;
use crate::format::claude as claudefmt;
use crate::gateway::claude::normalize::normalize_claude_request;
use crate::gateway::claude::stream::ClaudeStreamRuntime;
use crate::gateway::frame::Frame;
use crate::gateway::openai::handler::{
    cancel_on_client_gone, sse_response, stream_consume_config,
};
use crate::gateway::{GatewayState, attempts_for};
use crate::logging;
use crate::sse::collect_stream;
use crate::stream::consume_sse;
use crate::util::id;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use sonic_rs::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn handle_messages(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    if state.store.env().log_level().client_enabled() {
        logging::client_request("POST", "/v1/messages", &headers, body.as_ref());
    }

    let req: Value = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => {
            return AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。")
                .into_claude_response();
        }
    };
    let normalized = match normalize_claude_request(&state.store, &req) {
        Ok(v) => v,
        Err(e) => return e.into_claude_response(),
    };
    // usage.input_tokens 按归一化后的消息原文估算
    let input_basis = sonic_rs::to_string(&Value::from(normalized.normalized_messages.clone()))
        .unwrap_or_default();
    let std_req = normalized.standard;

    let cancel = CancellationToken::new();
    let mut auth = match state.auth.determine(&cancel, &headers).await {
        Ok(v) => v,
        Err(e) => return e.into_claude_response(),
    };

    if std_req.stream {
        let (tx, rx) = mpsc::channel::<Frame>(256);
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
                        .send(Frame::named("error", claude_error_json(&e.to_string())))
                        .await;
                    let _ = tx
                        .send(Frame::named(
                            "message_stop",
                            "{\"type\":\"message_stop\"}".to_string(),
                        ))
                        .await;
                }
                Ok(resp) => {
                    let sieve_enabled = state2.store.toolcall_mode_enabled();
                    let mut rt = ClaudeStreamRuntime::new(
                        tx.clone(),
                        id::message_id(),
                        std_req.response_model.clone(),
                        input_basis.clone(),
                        std_req.thinking,
                        std_req.search,
                        std_req.tool_names.clone(),
                        sieve_enabled,
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
            logging::stream_finished("anthropic_messages", "closed", started.elapsed());
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
            return AppError::upstream(e.to_string()).into_claude_response();
        }
    };

    let collected = collect_stream(resp, std_req.thinking, std_req.thinking).await;
    state.auth.release(&mut auth);

    if !collected.error_message.is_empty() && !collected.content_filter {
        return AppError::upstream(collected.error_message).into_claude_response();
    }

    let tool_names = if state.store.toolcall_mode_enabled() {
        std_req.tool_names.clone()
    } else {
        Vec::new()
    };
    let thinking = if std_req.thinking {
        collected.thinking.clone()
    } else {
        String::new()
    };
    let out = claudefmt::build_message_response(
        &id::message_id(),
        &std_req.response_model,
        &input_basis,
        &thinking,
        &collected.text,
        &tool_names,
    );

    if state.store.env().log_level().client_enabled() {
        logging::client_response(
            200,
            started.elapsed(),
            sonic_rs::to_vec(&out).unwrap_or_default().as_ref(),
        );
    }
    Json(out).into_response()
}

fn claude_error_json(msg: &str) -> String {
    let encoded = sonic_rs::to_string(&Value::from(msg)).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "{{\"type\":\"error\",\"error\":{{\"type\":\"api_error\",\"message\":{encoded},\"code\":\"upstream_error\",\"param\":null}}}}"
    )
}
