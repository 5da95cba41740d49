use crate::sse::parser::{LineResult, PartType};
use crate::sse::pump::spawn_parsed_line_pump;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// 流结束原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ContextCancelled,
    NoContentTimeout,
    IdleTimeout,
    UpstreamCompleted,
    HandlerRequested,
    UpstreamError,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::ContextCancelled => "context_cancelled",
            StopReason::NoContentTimeout => "no_content_timeout",
            StopReason::IdleTimeout => "idle_timeout",
            StopReason::UpstreamCompleted => "upstream_completed",
            StopReason::HandlerRequested => "handler_requested",
            StopReason::UpstreamError => "upstream_error",
        }
    }
}

/// `on_parsed` 的返回：是否停止、停止原因、本行是否产生了内容。
#[derive(Debug, Default, Clone, Copy)]
pub struct ParsedDecision {
    pub stop: bool,
    pub stop_reason: Option<StopReason>,
    pub content_seen: bool,
}

/// 各 surface 运行时实现的钩子。
///
/// 约定：每次 `consume_sse` 运行中，`on_finalize` 与 `on_context_done`
/// 恰好有一个被调用一次。
pub trait StreamHooks {
    fn on_parsed(&mut self, parsed: LineResult) -> impl Future<Output = ParsedDecision> + Send;
    fn on_keep_alive(&mut self) -> impl Future<Output = ()> + Send;
    fn on_finalize(
        &mut self,
        reason: StopReason,
        scan_err: Option<anyhow::Error>,
    ) -> impl Future<Output = ()> + Send;
    fn on_context_done(&mut self) -> impl Future<Output = ()> + Send;
}

pub struct ConsumeConfig {
    pub cancel: CancellationToken,
    pub thinking_enabled: bool,
    pub initial_type: Option<PartType>,
    pub keep_alive_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub max_keep_alive_no_input: usize,
}

/// 消费一条上游 SSE 流：解析行交给 `on_parsed`，按配置驱动
/// keep-alive、无内容超时与空闲超时。
pub async fn consume_sse<H: StreamHooks>(
    cfg: ConsumeConfig,
    resp: reqwest::Response,
    hooks: &mut H,
) {
    let initial_type = cfg.initial_type.unwrap_or(if cfg.thinking_enabled {
        PartType::Thinking
    } else {
        PartType::Text
    });

    // 子 token：引擎退出时顺带停掉生产者。
    let pump_cancel = cfg.cancel.child_token();
    let _pump_guard = pump_cancel.clone().drop_guard();
    let (mut lines, mut done) =
        spawn_parsed_line_pump(pump_cancel, resp, cfg.thinking_enabled, initial_type);

    let keep_alive = cfg.keep_alive_interval.filter(|d| !d.is_zero());
    let mut ticker = tokio::time::interval(keep_alive.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.reset();

    let mut has_content = false;
    let mut last_content = Instant::now();
    let mut keepalive_count = 0usize;

    loop {
        tokio::select! {
            _ = cfg.cancel.cancelled() => {
                hooks.on_context_done().await;
                return;
            }
            _ = ticker.tick(), if keep_alive.is_some() => {
                if !has_content {
                    keepalive_count += 1;
                    if cfg.max_keep_alive_no_input > 0
                        && keepalive_count >= cfg.max_keep_alive_no_input
                    {
                        hooks.on_finalize(StopReason::NoContentTimeout, None).await;
                        return;
                    }
                }
                if has_content
                    && let Some(idle) = cfg.idle_timeout
                    && !idle.is_zero()
                    && last_content.elapsed() > idle
                {
                    hooks.on_finalize(StopReason::IdleTimeout, None).await;
                    return;
                }
                hooks.on_keep_alive().await;
            }
            parsed = lines.recv() => {
                let Some(parsed) = parsed else {
                    let scan_err = (&mut done).await.ok().flatten();
                    hooks.on_finalize(StopReason::UpstreamCompleted, scan_err).await;
                    return;
                };
                let decision = hooks.on_parsed(parsed).await;
                if decision.content_seen {
                    has_content = true;
                    last_content = Instant::now();
                    keepalive_count = 0;
                }
                if decision.stop {
                    let reason = decision.stop_reason.unwrap_or(StopReason::HandlerRequested);
                    hooks.on_finalize(reason, None).await;
                    return;
                }
            }
        }
    }
}
