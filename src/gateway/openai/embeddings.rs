use crate::error::AppError;
use crate::gateway::GatewayState;
use crate::util::tokens::estimate_tokens;
use sha2::{Digest, Sha256};
use sonic_rs::{JsonContainerTrait, JsonValueTrait, Value};
use std::sync::Arc;

pub const EMBEDDING_DIM: usize = 256;

/// 确定性嵌入：sha256 计数器模式展开成单位向量。
/// 仅用于无外部向量服务时的可复现占位实现。
pub fn deterministic_embedding(text: &str) -> Vec<f32> {
    let mut out = Vec::with_capacity(EMBEDDING_DIM);
    let mut block: u32 = 0;
    while out.len() < EMBEDDING_DIM {
        let mut hasher = Sha256::new();
        hasher.update(block.to_le_bytes());
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks_exact(4) {
            if out.len() >= EMBEDDING_DIM {
                break;
            }
            let n = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // 映射到 [-1, 1]
            out.push((n as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
        block += 1;
    }
    let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut out {
            *v /= norm;
        }
    }
    out
}

fn collect_inputs(input: &Value) -> Vec<String> {
    if let Some(s) = input.as_str() {
        return vec![s.to_string()];
    }
    if let Some(arr) = input.as_array() {
        return arr
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
    }
    Vec::new()
}

/// `/v1/embeddings` 的核心逻辑，返回响应 JSON。
pub fn build_embeddings_response(
    state: &Arc<GatewayState>,
    req: &Value,
) -> Result<Value, AppError> {
    let model = req
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim();
    if model.is_empty() {
        return Err(AppError::bad_request_param("缺少必填字段 model", "model"));
    }
    let inputs = req
        .get("input")
        .map(collect_inputs)
        .unwrap_or_default();
    if inputs.is_empty() {
        return Err(AppError::bad_request_param("缺少必填字段 input", "input"));
    }

    let provider = state.store.embeddings_provider();
    if provider.is_empty() {
        return Err(AppError::NotImplemented {
            message: "未配置 embeddings provider".to_string(),
            param: Some("embeddings.provider".to_string()),
        });
    }
    if provider != "deterministic" {
        return Err(AppError::NotImplemented {
            message: format!("不支持的 embeddings provider: {provider}"),
            param: Some("embeddings.provider".to_string()),
        });
    }

    let mut data: Vec<Value> = Vec::with_capacity(inputs.len());
    let mut prompt_tokens = 0usize;
    for (index, text) in inputs.iter().enumerate() {
        prompt_tokens += estimate_tokens(text);
        let vector = deterministic_embedding(text);
        let floats: Vec<Value> = vector
            .iter()
            .map(|f| Value::new_f64(*f as f64).unwrap_or_default())
            .collect();
        let mut item = sonic_rs::Object::new();
        item.insert(&"object", "embedding");
        item.insert(&"index", index as i64);
        item.insert(&"embedding", Value::from(floats));
        data.push(item.into_value());
    }

    let mut usage = sonic_rs::Object::new();
    usage.insert(&"prompt_tokens", prompt_tokens as i64);
    usage.insert(&"total_tokens", prompt_tokens as i64);

    let mut out = sonic_rs::Object::new();
    out.insert(&"object", "list");
    out.insert(&"data", Value::from(data));
    out.insert(&"model", model);
    out.insert(&"usage", usage.into_value());
    Ok(out.into_value())
}
