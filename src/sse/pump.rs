use crate::sse::parser::{LineResult, PartType, parse_content_line};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// 把上游 SSE 响应体转成逐行解析结果的通道。
///
/// 生产者在独立任务中按行切分并解析；消费者通过返回的 Receiver 顺序
/// 消费。`cancel` 取消后生产者立即停止扫描并关闭通道。`done` 在通道
/// 关闭后给出读取错误（若有）。
pub fn spawn_parsed_line_pump(
    cancel: CancellationToken,
    resp: reqwest::Response,
    thinking_enabled: bool,
    initial_type: PartType,
) -> (
    mpsc::Receiver<LineResult>,
    oneshot::Receiver<Option<anyhow::Error>>,
) {
    let (tx, rx) = mpsc::channel::<LineResult>(64);
    let (done_tx, done_rx) = oneshot::channel::<Option<anyhow::Error>>();

    tokio::spawn(async move {
        let mut current = initial_type;
        let mut buf: Vec<u8> = Vec::with_capacity(4 * 1024);
        let mut scan_err: Option<anyhow::Error> = None;
        let mut stopped = false;
        let mut stream = resp.bytes_stream();

        'outer: loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stopped = true;
                    break 'outer;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(c) => c,
                Err(e) => {
                    scan_err = Some(anyhow::Error::new(e));
                    break;
                }
            };
            buf.extend_from_slice(chunk.as_ref());

            let mut processed = 0usize;
            while let Some(nl_rel) = buf[processed..].iter().position(|&b| b == b'\n') {
                let nl = processed + nl_rel;
                let mut line = &buf[processed..nl];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                processed = nl + 1;

                let result = parse_content_line(line, thinking_enabled, current);
                if !result.parsed {
                    continue;
                }
                current = result.next_type;
                let stop = result.stop;
                if tx.send(result).await.is_err() {
                    stopped = true;
                    break 'outer;
                }
                if stop {
                    stopped = true;
                    break 'outer;
                }
            }
            // 释放已处理的前缀，避免 buffer 无限增长。
            if processed > 0 {
                buf.drain(..processed);
            }
        }

        // EOF 时缓冲区里可能还有最后一行（无换行结尾）。
        if !stopped && scan_err.is_none() && !buf.is_empty() {
            let result = parse_content_line(&buf, thinking_enabled, current);
            if result.parsed {
                let _ = tx.send(result).await;
            }
        }

        drop(tx);
        let _ = done_tx.send(scan_err);
    });

    (rx, done_rx)
}

/// 非流式路径：把整个 SSE 响应体聚合为一段 thinking + 一段正文。
///
/// 引文过滤不在此处做（由各 surface 自行处理）。
#[derive(Debug, Default, Clone)]
pub struct CollectedStream {
    pub thinking: String,
    pub text: String,
    pub error_message: String,
    pub content_filter: bool,
}

pub async fn collect_stream(
    resp: reqwest::Response,
    thinking_enabled: bool,
    initial_thinking: bool,
) -> CollectedStream {
    let mut current = if initial_thinking {
        PartType::Thinking
    } else {
        PartType::Text
    };
    let mut out = CollectedStream::default();
    let mut buf: Vec<u8> = Vec::with_capacity(4 * 1024);
    let mut stream = resp.bytes_stream();

    let handle_line = |line: &[u8], current: &mut PartType, out: &mut CollectedStream| -> bool {
        let result = parse_content_line(line, thinking_enabled, *current);
        if !result.parsed {
            return false;
        }
        *current = result.next_type;
        if !result.error_message.is_empty() {
            out.error_message = result.error_message.clone();
            out.content_filter = result.content_filter;
            return true;
        }
        for p in &result.parts {
            match p.part_type {
                PartType::Thinking => out.thinking.push_str(&p.text),
                PartType::Text => out.text.push_str(&p.text),
            }
        }
        result.stop
    };

    let mut stopped = false;
    'outer: while let Some(item) = stream.next().await {
        let Ok(chunk) = item else {
            break;
        };
        buf.extend_from_slice(chunk.as_ref());
        let mut processed = 0usize;
        while let Some(nl_rel) = buf[processed..].iter().position(|&b| b == b'\n') {
            let nl = processed + nl_rel;
            let mut line = &buf[processed..nl];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            processed = nl + 1;
            if handle_line(line, &mut current, &mut out) {
                stopped = true;
                break 'outer;
            }
        }
        if processed > 0 {
            buf.drain(..processed);
        }
    }

    if !stopped && !buf.is_empty() {
        let _ = handle_line(&buf, &mut current, &mut out);
    }

    out
}
