use crate::auth::admin as adminauth;
use crate::config::types::{Account, validate_config};
use crate::error::AppError;
use crate::gateway::GatewayState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use sonic_rs::{JsonValueTrait, Value};
use std::sync::Arc;

fn obj() -> sonic_rs::Object {
    sonic_rs::Object::new()
}

/// `POST /admin/login`：密码换 JWT。
pub async fn handle_login(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let req: Value = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => return AppError::bad_request("请求 JSON 解析失败").into_response(),
    };
    let password = req
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if !adminauth::verify_admin_password(&state.store, &password) {
        return AppError::unauthorized("密码错误").into_response();
    }

    let secret = adminauth::jwt_secret(&state.store);
    let hours = adminauth::jwt_expire_hours(&state.store);
    match adminauth::create_jwt(&secret, hours) {
        Ok(token) => {
            let mut out = obj();
            out.insert(&"token", token.as_str());
            out.insert(&"expires_in_hours", hours);
            Json(out.into_value()).into_response()
        }
        Err(e) => AppError::Anyhow(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    page: usize,
    #[serde(default)]
    page_size: usize,
}

/// `GET /admin/accounts`：分页列出账号（token 不回显明文）。
pub async fn handle_list_accounts(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Response {
    if let Err(e) = adminauth::verify_admin_request(&state.store, &headers) {
        return e.into_response();
    }

    let accounts = state.store.accounts();
    let page = query.page.max(1);
    let page_size = if query.page_size == 0 {
        20
    } else {
        query.page_size.min(100)
    };
    let start = (page - 1) * page_size;

    let mut items: Vec<Value> = Vec::new();
    for acc in accounts.iter().skip(start).take(page_size) {
        let mut item = obj();
        item.insert(&"identifier", acc.identifier().as_str());
        item.insert(&"email", acc.email.as_str());
        item.insert(&"mobile", acc.mobile.as_str());
        item.insert(&"has_token", !acc.token.trim().is_empty());
        if let Some(status) = &acc.last_test_status {
            item.insert(&"last_test_status", status.as_str());
        }
        items.push(item.into_value());
    }

    let mut out = obj();
    out.insert(&"total", accounts.len() as i64);
    out.insert(&"page", page as i64);
    out.insert(&"page_size", page_size as i64);
    out.insert(&"items", Value::from(items));
    Json(out.into_value()).into_response()
}

/// `POST /admin/accounts`：新增或覆盖账号（按标识符去重），之后重建池。
pub async fn handle_add_account(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = adminauth::verify_admin_request(&state.store, &headers) {
        return e.into_response();
    }
    let account: Account = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => return AppError::bad_request("账号 JSON 解析失败").into_response(),
    };
    if account.identifier().is_empty() {
        return AppError::bad_request_param(
            "账号必须有 email、mobile 或 token 之一",
            "account",
        )
        .into_response();
    }
    if account.token.trim().is_empty() && !account.has_credentials() {
        return AppError::bad_request_param(
            "无 token 的账号必须提供可登录的凭据（email/mobile + password）",
            "account",
        )
        .into_response();
    }

    let result = state.store.update(|cfg| {
        let id = account.identifier();
        if let Some(existing) = cfg.accounts.iter_mut().find(|a| a.identifier() == id) {
            *existing = account.clone();
        } else {
            cfg.accounts.push(account.clone());
        }
        Ok(())
    });
    if let Err(e) = result {
        return AppError::bad_request(format!("{e:#}")).into_response();
    }
    state.pool.reset(&state.store);

    let mut out = obj();
    out.insert(&"ok", true);
    out.insert(&"identifier", account.identifier().as_str());
    Json(out.into_value()).into_response()
}

/// `DELETE /admin/accounts/{identifier}`：email / mobile / token 合成
/// 标识符均可定位，删除后重建池。
pub async fn handle_delete_account(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(identifier): Path<String>,
) -> Response {
    if let Err(e) = adminauth::verify_admin_request(&state.store, &headers) {
        return e.into_response();
    }
    let identifier = identifier.trim().to_string();
    if state.store.find_account(&identifier).is_none() {
        return AppError::not_found(format!("账号不存在: {identifier}")).into_response();
    }

    let id2 = identifier.clone();
    let result = state.store.update(move |cfg| {
        cfg.accounts.retain(|a| {
            a.identifier() != id2 && a.email.trim() != id2 && a.mobile.trim() != id2
        });
        Ok(())
    });
    if let Err(e) = result {
        return AppError::bad_request(format!("{e:#}")).into_response();
    }
    state.pool.reset(&state.store);

    let mut out = obj();
    out.insert(&"ok", true);
    Json(out.into_value()).into_response()
}

/// `GET /admin/pool`：账号池实时状态。
pub async fn handle_pool_status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = adminauth::verify_admin_request(&state.store, &headers) {
        return e.into_response();
    }
    Json(state.pool.status()).into_response()
}

/// `GET /admin/settings`：导出当前配置（JSON 与 base64 两种形态）。
pub async fn handle_get_settings(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = adminauth::verify_admin_request(&state.store, &headers) {
        return e.into_response();
    }
    match state.store.export_json_and_base64() {
        Ok((json, b64)) => {
            let mut out = obj();
            if let Ok(v) = sonic_rs::from_str::<Value>(&json) {
                out.insert(&"config", v);
            }
            out.insert(&"base64", b64.as_str());
            Json(out.into_value()).into_response()
        }
        Err(e) => AppError::Anyhow(e).into_response(),
    }
}

/// `PUT /admin/settings`：整体替换配置；运行时上限热更新到池。
pub async fn handle_put_settings(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = adminauth::verify_admin_request(&state.store, &headers) {
        return e.into_response();
    }
    let mut cfg: crate::config::Config = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            return AppError::bad_request(format!("配置 JSON 解析失败: {e}")).into_response();
        }
    };
    normalize_settings(&mut cfg);
    if let Err(e) = validate_config(&cfg) {
        return AppError::bad_request(e).into_response();
    }
    if let Err(e) = state.store.replace(cfg) {
        return AppError::bad_request(format!("{e:#}")).into_response();
    }

    state.pool.apply_runtime_limits(state.store.runtime_limits());
    state.pool.reset(&state.store);

    let mut out = obj();
    out.insert(&"ok", true);
    Json(out.into_value()).into_response()
}

fn normalize_settings(cfg: &mut crate::config::Config) {
    cfg.admin.password_hash = cfg.admin.password_hash.trim().to_string();
    cfg.toolcall.mode = cfg.toolcall.mode.trim().to_lowercase();
    cfg.toolcall.early_emit_confidence = cfg.toolcall.early_emit_confidence.trim().to_lowercase();
    cfg.embeddings.provider = cfg.embeddings.provider.trim().to_string();
}
