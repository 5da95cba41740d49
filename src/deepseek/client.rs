use crate::auth::{RequestAuth, Resolver};
use crate::config::Account;
use crate::deepseek::constants::{
    BASE_HEADERS, DEEPSEEK_COMPLETION_URL, DEEPSEEK_CREATE_POW_URL, DEEPSEEK_CREATE_SESSION_URL,
    DEEPSEEK_LOGIN_URL, POW_RESPONSE_HEADER,
};
use crate::deepseek::pow::{PowChallenge, PowSolver, build_pow_header};
use crate::logging::{self, LogLevel};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use sonic_rs::{JsonValueTrait, Value};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("上游 API 错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error("账号凭据被拒绝: {0}")]
    CredentialsRejected(String),

    #[error("请求被取消")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 401 视为上游 token 失效，需要刷新或换号。
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401))
    }
}

/// DeepSeek 上游客户端：登录、建会话、PoW、发起补全。
#[derive(Debug, Clone)]
pub struct DeepSeekClient {
    http: reqwest::Client,
    pow_solver: PowSolver,
    log_level: LogLevel,
}

const LOGIN_TRANSPORT_ATTEMPTS: usize = 3;

impl DeepSeekClient {
    pub fn new(pow_pool_size: usize, log_level: LogLevel) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            http,
            pow_solver: PowSolver::new(pow_pool_size),
            log_level,
        })
    }

    pub fn build_headers(&self, token: Option<&str>, pow_header: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (name, value) in BASE_HEADERS {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                h.insert(n, v);
            }
        }
        if let Some(token) = token
            && let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}"))
        {
            h.insert(AUTHORIZATION, v);
        }
        if let Some(pow) = pow_header
            && let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(POW_RESPONSE_HEADER.as_bytes()),
                HeaderValue::from_str(pow),
            )
        {
            h.insert(n, v);
        }
        h
    }

    async fn post_json(
        &self,
        cancel: &CancellationToken,
        url: &str,
        token: Option<&str>,
        pow_header: Option<&str>,
        body: &Value,
    ) -> Result<(u16, bytes::Bytes), UpstreamError> {
        let payload = sonic_rs::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
        let headers = self.build_headers(token, pow_header);
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", url, &headers, &payload);
        }
        let started = std::time::Instant::now();
        let send = self
            .http
            .post(url)
            .headers(headers)
            .body(payload)
            .send();
        let resp = tokio::select! {
            resp = send => resp?,
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
        };
        let status = resp.status().as_u16();
        let bytes = tokio::select! {
            bytes = resp.bytes() => bytes?,
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
        };
        if self.log_level.backend_enabled() {
            logging::backend_response(status, started.elapsed(), &bytes);
        }
        Ok((status, bytes))
    }

    /// 账号登录，返回上游 bearer。
    ///
    /// 凭据被明确拒绝时直接失败；传输层错误做有限次重试。
    pub async fn login(
        &self,
        cancel: &CancellationToken,
        account: &Account,
    ) -> Result<String, UpstreamError> {
        let payload = build_login_payload(account);
        let mut last_err: Option<UpstreamError> = None;

        for attempt in 0..LOGIN_TRANSPORT_ATTEMPTS {
            match self
                .post_json(cancel, DEEPSEEK_LOGIN_URL, None, None, &payload)
                .await
            {
                Ok((status, bytes)) => {
                    if status == 400 || status == 401 || status == 403 {
                        return Err(UpstreamError::CredentialsRejected(body_message(&bytes)));
                    }
                    if !(200..300).contains(&status) {
                        return Err(UpstreamError::Http {
                            status,
                            message: body_message(&bytes),
                        });
                    }
                    let parsed: Value = sonic_rs::from_slice(&bytes).unwrap_or_default();
                    if let Some(code) = parsed.get("code").and_then(|v| v.as_i64())
                        && code != 0
                    {
                        return Err(UpstreamError::CredentialsRejected(body_message(&bytes)));
                    }
                    let Some(token) = extract_login_token(&parsed) else {
                        return Err(UpstreamError::Http {
                            status,
                            message: "登录响应缺少 token".to_string(),
                        });
                    };
                    return Ok(token);
                }
                Err(UpstreamError::Cancelled) => return Err(UpstreamError::Cancelled),
                Err(e @ UpstreamError::Transport(_)) => {
                    last_err = Some(e);
                    if attempt + 1 < LOGIN_TRANSPORT_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(UpstreamError::Http {
            status: 500,
            message: "登录失败".to_string(),
        }))
    }

    /// 创建上游会话。401 驱动 refresh → switch，其余错误退避重试。
    pub async fn create_session(
        &self,
        cancel: &CancellationToken,
        resolver: &Resolver,
        auth: &mut RequestAuth,
        max_attempts: usize,
    ) -> Result<String, UpstreamError> {
        let payload: Value = sonic_rs::from_str(r#"{"character_id":null}"#).unwrap_or_default();
        self.with_auth_retry(cancel, resolver, auth, max_attempts, |token| {
            let payload = payload.clone();
            async move {
                let (status, bytes) = self
                    .post_json(cancel, DEEPSEEK_CREATE_SESSION_URL, Some(&token), None, &payload)
                    .await?;
                if !(200..300).contains(&status) {
                    return Err(UpstreamError::Http {
                        status,
                        message: body_message(&bytes),
                    });
                }
                let parsed: Value = sonic_rs::from_slice(&bytes).unwrap_or_default();
                extract_session_id(&parsed).ok_or(UpstreamError::Http {
                    status,
                    message: "会话创建响应缺少 id".to_string(),
                })
            }
        })
        .await
    }

    /// 获取 PoW 挑战并求解，返回可直接作为请求头的编码串。
    pub async fn get_pow(
        &self,
        cancel: &CancellationToken,
        resolver: &Resolver,
        auth: &mut RequestAuth,
        max_attempts: usize,
    ) -> Result<String, UpstreamError> {
        let payload: Value =
            sonic_rs::from_str(r#"{"target_path":"/api/v0/chat/completion"}"#).unwrap_or_default();
        let challenge = self
            .with_auth_retry(cancel, resolver, auth, max_attempts, |token| {
                let payload = payload.clone();
                async move {
                    let (status, bytes) = self
                        .post_json(cancel, DEEPSEEK_CREATE_POW_URL, Some(&token), None, &payload)
                        .await?;
                    if !(200..300).contains(&status) {
                        return Err(UpstreamError::Http {
                            status,
                            message: body_message(&bytes),
                        });
                    }
                    let parsed: Value = sonic_rs::from_slice(&bytes).unwrap_or_default();
                    extract_pow_challenge(&parsed).ok_or(UpstreamError::Http {
                        status,
                        message: "PoW 响应缺少 challenge".to_string(),
                    })
                }
            })
            .await?;

        let answer = self
            .pow_solver
            .solve(cancel, &challenge)
            .await
            .map_err(|e| UpstreamError::Http {
                status: 500,
                message: format!("PoW 求解失败: {e}"),
            })?;
        Ok(build_pow_header(&challenge, answer))
    }

    /// 发起补全请求，成功时返回可读的 SSE 响应体。
    pub async fn call_completion(
        &self,
        cancel: &CancellationToken,
        payload: &Value,
        token: &str,
        pow_header: &str,
    ) -> Result<reqwest::Response, UpstreamError> {
        let body = sonic_rs::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
        let headers = self.build_headers(Some(token), Some(pow_header));
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", DEEPSEEK_COMPLETION_URL, &headers, &body);
        }
        let send = self
            .http
            .post(DEEPSEEK_COMPLETION_URL)
            .headers(headers)
            .body(body)
            .send();
        let resp = tokio::select! {
            resp = send => resp?,
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
        };
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let bytes = resp.bytes().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status,
                message: body_message(&bytes),
            });
        }
        Ok(resp)
    }

    /// 完整引导：建会话 → 解 PoW → 发补全。
    ///
    /// 补全层面的 401 会触发刷新/换号并从建会话重来（会话与 PoW 均
    /// 绑定账号）；传输类错误退避后整体重试。
    pub async fn start_completion<F>(
        &self,
        cancel: &CancellationToken,
        resolver: &Resolver,
        auth: &mut RequestAuth,
        build_payload: F,
        max_attempts: usize,
    ) -> Result<reqwest::Response, UpstreamError>
    where
        F: Fn(&str) -> Value,
    {
        let max_attempts = max_attempts.max(1);
        let mut last_err: Option<UpstreamError> = None;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(UpstreamError::Cancelled);
            }
            let session_id = self
                .create_session(cancel, resolver, auth, max_attempts)
                .await?;
            let pow_header = self.get_pow(cancel, resolver, auth, max_attempts).await?;
            let payload = build_payload(&session_id);

            match self
                .call_completion(cancel, &payload, &auth.deepseek_token, &pow_header)
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_auth_failure() => {
                    if !self.recover_auth(cancel, resolver, auth).await {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
                Err(UpstreamError::Cancelled) => return Err(UpstreamError::Cancelled),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(UpstreamError::Http {
            status: 502,
            message: "上游补全请求失败".to_string(),
        }))
    }

    /// 针对单个上游调用的 401 刷新/换号重试循环。
    async fn with_auth_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        resolver: &Resolver,
        auth: &mut RequestAuth,
        max_attempts: usize,
        op: F,
    ) -> Result<T, UpstreamError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut last_err: Option<UpstreamError> = None;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(UpstreamError::Cancelled);
            }
            match op(auth.deepseek_token.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_auth_failure() => {
                    if !self.recover_auth(cancel, resolver, auth).await {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
                Err(UpstreamError::Cancelled) => return Err(UpstreamError::Cancelled),
                Err(e @ UpstreamError::CredentialsRejected(_)) => return Err(e),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(UpstreamError::Http {
            status: 502,
            message: "上游请求失败".to_string(),
        }))
    }

    /// 401 恢复：先原地刷新，不行再换号。
    async fn recover_auth(
        &self,
        cancel: &CancellationToken,
        resolver: &Resolver,
        auth: &mut RequestAuth,
    ) -> bool {
        resolver.mark_token_invalid(auth);
        if resolver.refresh_token(auth).await {
            return true;
        }
        resolver.switch_account(cancel, auth).await
    }
}

fn backoff_delay(attempt: usize) -> Duration {
    Duration::from_millis((1_000 * (attempt as u64 + 1)).min(5_000))
}

fn build_login_payload(account: &Account) -> Value {
    let mut obj = sonic_rs::Object::new();
    if !account.email.trim().is_empty() {
        obj.insert(&"email", account.email.trim());
    } else {
        obj.insert(&"mobile", account.mobile.trim());
        obj.insert(&"area_code", "+86");
    }
    obj.insert(&"password", account.password.as_str());
    obj.insert(&"device_id", "ds2api");
    obj.insert(&"os", "android");
    obj.into_value()
}

fn body_message(bytes: &bytes::Bytes) -> String {
    if let Ok(v) = sonic_rs::from_slice::<Value>(bytes) {
        if let Some(msg) = v.get("msg").and_then(|m| m.as_str())
            && !msg.is_empty()
        {
            return msg.to_string();
        }
        if let Some(msg) = v
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "未知错误".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

fn extract_login_token(parsed: &Value) -> Option<String> {
    for path in [
        &["data", "biz_data", "user", "token"][..],
        &["data", "user", "token"][..],
        &["data", "token"][..],
    ] {
        let mut cur = parsed;
        let mut ok = true;
        for key in path {
            match cur.get(*key) {
                Some(next) => cur = next,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok && let Some(s) = cur.as_str().filter(|s| !s.is_empty()) {
            return Some(s.to_string());
        }
    }
    None
}

fn extract_session_id(parsed: &Value) -> Option<String> {
    let biz = parsed.get("data").and_then(|d| d.get("biz_data"))?;
    biz.get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn extract_pow_challenge(parsed: &Value) -> Option<PowChallenge> {
    let challenge = parsed
        .get("data")
        .and_then(|d| d.get("biz_data"))
        .and_then(|d| d.get("challenge"))?;
    if !challenge.is_object() {
        return None;
    }
    Some(PowChallenge::from_value(challenge))
}
