use crate::account::Pool;
use crate::config::types::sha256_prefix;
use crate::config::{Account, Store};
use crate::deepseek::constants::TARGET_ACCOUNT_HEADER;
use crate::error::AppError;
use axum::http::HeaderMap;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 上游登录的注入点（生产环境接 DeepSeekClient::login，测试打桩）。
pub type LoginFn =
    Arc<dyn Fn(Account) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// 占住的池位。Drop 时自动归还，保证任何退出路径都恰好释放一次。
#[derive(Debug)]
struct SlotGuard {
    pool: Arc<Pool>,
    identifier: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(&self.identifier);
    }
}

/// 单个入站请求的鉴权上下文。
pub struct RequestAuth {
    pub use_managed_key: bool,
    pub caller_id: String,
    pub account_id: String,
    pub account: Option<Account>,
    pub deepseek_token: String,
    pub tried_accounts: HashSet<String>,
    slot: Option<SlotGuard>,
}

impl std::fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAuth")
            .field("use_managed_key", &self.use_managed_key)
            .field("caller_id", &self.caller_id)
            .field("account_id", &self.account_id)
            .field("has_slot", &self.slot.is_some())
            .finish()
    }
}

impl RequestAuth {
    fn direct(token: &str) -> Self {
        Self {
            use_managed_key: false,
            caller_id: format!("sha256:{}", sha256_prefix(token, 16)),
            account_id: String::new(),
            account: None,
            deepseek_token: token.to_string(),
            tried_accounts: HashSet::new(),
            slot: None,
        }
    }

    /// 手动归还池位；第二次调用为空操作。
    pub fn release_slot(&mut self) {
        self.slot.take();
    }

    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }
}

/// 从请求头提取调用方令牌：优先 `Authorization: Bearer`，
/// 其次 `x-api-key`。
pub fn extract_caller_token(headers: &HeaderMap) -> String {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION)
        && let Ok(s) = auth.to_str()
    {
        let s = s.trim();
        // 仅接受 Bearer；Basic 等其他方案不作为调用方令牌
        if s.len() >= 7 && s[..7].eq_ignore_ascii_case("bearer ") {
            let token = s[7..].trim();
            if !token.is_empty() {
                return token.to_string();
            }
        }
    }
    if let Some(key) = headers.get("x-api-key")
        && let Ok(s) = key.to_str()
    {
        return s.trim().to_string();
    }
    String::new()
}

/// 鉴权解析器：决定借用池化账号还是透传调用方令牌，
/// 并为上游客户端提供刷新 / 轮换钩子。
pub struct Resolver {
    store: Arc<Store>,
    pool: Arc<Pool>,
    login: LoginFn,
}

impl Resolver {
    pub fn new(store: Arc<Store>, pool: Arc<Pool>, login: LoginFn) -> Self {
        Self { store, pool, login }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// 解析一次请求的鉴权并（必要时）占住池位。
    pub async fn determine(
        &self,
        cancel: &CancellationToken,
        headers: &HeaderMap,
    ) -> Result<RequestAuth, AppError> {
        let token = extract_caller_token(headers);
        if token.is_empty() {
            return Err(AppError::unauthorized("缺少 API 密钥".to_string()));
        }
        if !self.store.has_api_key(&token) {
            // 非托管密钥：按上游令牌直接透传，不占池
            return Ok(RequestAuth::direct(&token));
        }

        let target = headers
            .get(TARGET_ACCOUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim()
            .to_string();

        let empty = HashSet::new();
        let account = match self.pool.acquire(&target, &empty) {
            Some(acc) => acc,
            None => match self.pool.acquire_wait(cancel, &target, &empty).await {
                Some(acc) => acc,
                None => {
                    return Err(AppError::PoolExhausted(
                        "所有账号均忙且等待队列不可用".to_string(),
                    ));
                }
            },
        };

        let account_id = account.identifier();
        let mut auth = RequestAuth {
            use_managed_key: true,
            caller_id: token,
            account_id: account_id.clone(),
            account: Some(account.clone()),
            deepseek_token: account.token.clone(),
            tried_accounts: HashSet::new(),
            slot: Some(SlotGuard {
                pool: self.pool.clone(),
                identifier: account_id.clone(),
            }),
        };

        if auth.deepseek_token.trim().is_empty() {
            match (self.login)(account).await {
                Ok(fresh) => {
                    if let Err(e) = self.store.set_account_token(&account_id, &fresh) {
                        tracing::warn!(account = %account_id, "登录成功但写回 token 失败: {e:#}");
                    }
                    if let Some(acc) = auth.account.as_mut() {
                        acc.token = fresh.clone();
                    }
                    auth.deepseek_token = fresh;
                }
                Err(e) => {
                    auth.release_slot();
                    return Err(AppError::upstream(format!(
                        "账号 {account_id} 登录失败: {e:#}"
                    )));
                }
            }
        }

        Ok(auth)
    }

    /// 只读变体：解析 caller_id，不触碰账号池（响应缓存查询用）。
    pub fn determine_caller(&self, headers: &HeaderMap) -> Result<RequestAuth, AppError> {
        let token = extract_caller_token(headers);
        if token.is_empty() {
            return Err(AppError::unauthorized("缺少 API 密钥".to_string()));
        }
        if self.store.has_api_key(&token) {
            return Ok(RequestAuth {
                use_managed_key: true,
                caller_id: token,
                account_id: String::new(),
                account: None,
                deepseek_token: String::new(),
                tried_accounts: HashSet::new(),
                slot: None,
            });
        }
        Ok(RequestAuth::direct(&token))
    }

    /// 重新登录当前账号并更新 token。仅池化请求有意义。
    pub async fn refresh_token(&self, auth: &mut RequestAuth) -> bool {
        if !auth.use_managed_key || auth.account_id.is_empty() {
            return false;
        }
        let Some(account) = auth.account.clone() else {
            return false;
        };
        match (self.login)(account).await {
            Ok(fresh) => {
                if let Err(e) = self.store.set_account_token(&auth.account_id, &fresh) {
                    tracing::warn!(account = %auth.account_id, "刷新后写回 token 失败: {e:#}");
                }
                if let Some(acc) = auth.account.as_mut() {
                    acc.token = fresh.clone();
                }
                auth.deepseek_token = fresh;
                true
            }
            Err(e) => {
                tracing::warn!(account = %auth.account_id, "刷新 token 失败: {e:#}");
                false
            }
        }
    }

    /// 标记当前 token 失效：清空存储与上下文里的 token，
    /// 下次使用该账号时触发重新登录。
    pub fn mark_token_invalid(&self, auth: &mut RequestAuth) {
        if auth.use_managed_key && !auth.account_id.is_empty() {
            self.store.clear_account_token(&auth.account_id);
        }
        if let Some(acc) = auth.account.as_mut() {
            acc.token.clear();
        }
        auth.deepseek_token.clear();
    }

    /// 轮换到未试过的账号。失败（无其他账号可用）时当前位已释放。
    pub async fn switch_account(
        &self,
        cancel: &CancellationToken,
        auth: &mut RequestAuth,
    ) -> bool {
        if !auth.use_managed_key || auth.account_id.is_empty() {
            return false;
        }
        auth.tried_accounts.insert(auth.account_id.clone());
        auth.release_slot();

        let Some(account) = self
            .pool
            .acquire_wait(cancel, "", &auth.tried_accounts)
            .await
        else {
            return false;
        };

        let account_id = account.identifier();
        auth.slot = Some(SlotGuard {
            pool: self.pool.clone(),
            identifier: account_id.clone(),
        });
        auth.account_id = account_id.clone();
        auth.deepseek_token = account.token.clone();
        auth.account = Some(account.clone());

        if auth.deepseek_token.trim().is_empty() {
            match (self.login)(account).await {
                Ok(fresh) => {
                    if let Err(e) = self.store.set_account_token(&account_id, &fresh) {
                        tracing::warn!(account = %account_id, "登录成功但写回 token 失败: {e:#}");
                    }
                    if let Some(acc) = auth.account.as_mut() {
                        acc.token = fresh.clone();
                    }
                    auth.deepseek_token = fresh;
                }
                Err(e) => {
                    tracing::warn!(account = %account_id, "轮换后登录失败: {e:#}");
                    auth.release_slot();
                    return false;
                }
            }
        }
        true
    }

    /// 归还池位。重复调用安全。
    pub fn release(&self, auth: &mut RequestAuth) {
        auth.release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::parse_config_string;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                axum::http::HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    fn test_resolver(cfg_json: &str, login_ok: bool) -> Resolver {
        let store = Arc::new(Store::from_config(parse_config_string(cfg_json).unwrap()));
        let pool = Arc::new(Pool::new(&store));
        let login: LoginFn = Arc::new(move |_acc| {
            Box::pin(async move {
                if login_ok {
                    Ok("fresh-token".to_string())
                } else {
                    Err(anyhow::anyhow!("login failed"))
                }
            })
        });
        Resolver::new(store, pool, login)
    }

    fn default_resolver() -> Resolver {
        test_resolver(
            r#"{
                "keys":["managed-key"],
                "accounts":[
                    {"email":"acc1@test.com","token":"t1"},
                    {"email":"acc2@test.com","token":"t2"}
                ]
            }"#,
            true,
        )
    }

    #[test]
    fn token_extraction_rules() {
        let h = header_map(&[("authorization", "Bearer my-token")]);
        assert_eq!(extract_caller_token(&h), "my-token");

        let h = header_map(&[("authorization", "BEARER My-Token")]);
        assert_eq!(extract_caller_token(&h), "My-Token");

        let h = header_map(&[("authorization", "Bearer ")]);
        assert_eq!(extract_caller_token(&h), "");

        let h = header_map(&[("x-api-key", "x-api-key-token")]);
        assert_eq!(extract_caller_token(&h), "x-api-key-token");

        let h = header_map(&[
            ("authorization", "Bearer bearer-token"),
            ("x-api-key", "x-api-key-token"),
        ]);
        assert_eq!(extract_caller_token(&h), "bearer-token");

        assert_eq!(extract_caller_token(&HeaderMap::new()), "");

        let h = header_map(&[("authorization", "Basic abc123")]);
        assert_eq!(extract_caller_token(&h), "");
    }

    #[tokio::test]
    async fn determine_direct_token_skips_pool() {
        let r = default_resolver();
        let cancel = CancellationToken::new();
        let h = header_map(&[("authorization", "Bearer some-upstream-token")]);
        let auth = r.determine(&cancel, &h).await.unwrap();
        assert!(!auth.use_managed_key);
        assert!(auth.caller_id.starts_with("sha256:"));
        assert_eq!(auth.deepseek_token, "some-upstream-token");
        assert!(!auth.holds_slot());
        assert_eq!(r.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn determine_managed_key_acquires_account() {
        let r = default_resolver();
        let cancel = CancellationToken::new();
        let h = header_map(&[("authorization", "Bearer managed-key")]);
        let mut auth = r.determine(&cancel, &h).await.unwrap();
        assert!(auth.use_managed_key);
        assert_eq!(auth.caller_id, "managed-key");
        assert!(!auth.account_id.is_empty());
        assert_eq!(r.pool().status().in_use, 1);
        r.release(&mut auth);
        assert_eq!(r.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn determine_with_target_account_header() {
        let r = default_resolver();
        let cancel = CancellationToken::new();
        let h = header_map(&[
            ("authorization", "Bearer managed-key"),
            ("x-ds2-target-account", "acc2@test.com"),
        ]);
        let mut auth = r.determine(&cancel, &h).await.unwrap();
        assert_eq!(auth.account_id, "acc2@test.com");
        r.release(&mut auth);
    }

    #[tokio::test]
    async fn determine_logs_in_when_account_has_no_token() {
        let r = test_resolver(
            r#"{"keys":["managed-key"],"accounts":[{"email":"acc@test.com","password":"pwd"}]}"#,
            true,
        );
        let cancel = CancellationToken::new();
        let h = header_map(&[("authorization", "Bearer managed-key")]);
        let mut auth = r.determine(&cancel, &h).await.unwrap();
        assert_eq!(auth.deepseek_token, "fresh-token");
        r.release(&mut auth);
    }

    #[tokio::test]
    async fn determine_login_failure_releases_slot() {
        let r = test_resolver(
            r#"{"keys":["managed-key"],"accounts":[{"email":"acc@test.com","password":"pwd"}]}"#,
            false,
        );
        let cancel = CancellationToken::new();
        let h = header_map(&[("authorization", "Bearer managed-key")]);
        assert!(r.determine(&cancel, &h).await.is_err());
        assert_eq!(r.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn refresh_token_updates_store_and_auth() {
        let r = default_resolver();
        let cancel = CancellationToken::new();
        let h = header_map(&[("authorization", "Bearer managed-key")]);
        let mut auth = r.determine(&cancel, &h).await.unwrap();

        assert!(r.refresh_token(&mut auth).await);
        assert_eq!(auth.deepseek_token, "fresh-token");
        r.release(&mut auth);
    }

    #[tokio::test]
    async fn refresh_token_noop_for_direct_token() {
        let r = default_resolver();
        let mut auth = RequestAuth::direct("direct-token");
        assert!(!r.refresh_token(&mut auth).await);
    }

    #[tokio::test]
    async fn mark_token_invalid_clears_everywhere() {
        let r = default_resolver();
        let cancel = CancellationToken::new();
        let h = header_map(&[("authorization", "Bearer managed-key")]);
        let mut auth = r.determine(&cancel, &h).await.unwrap();
        let account_id = auth.account_id.clone();

        r.mark_token_invalid(&mut auth);
        assert!(auth.deepseek_token.is_empty());
        assert!(auth.account.as_ref().unwrap().token.is_empty());
        r.release(&mut auth);
        assert!(
            r.determine_caller(&h).is_ok(),
            "仅验证存储侧 token 已清空不影响后续解析"
        );
        let stored = r
            .pool()
            .status()
            .available_accounts
            .contains(&account_id);
        assert!(stored);
    }

    #[tokio::test]
    async fn switch_account_rotates_and_tracks_tried() {
        // 持有 acc1 时轮换应拿到 acc2 且 tried={acc1}；
        // 只有两个账号时再轮换一次返回 false 并释放。
        let r = default_resolver();
        let cancel = CancellationToken::new();
        let h = header_map(&[
            ("authorization", "Bearer managed-key"),
            ("x-ds2-target-account", "acc1@test.com"),
        ]);
        let mut auth = r.determine(&cancel, &h).await.unwrap();
        assert_eq!(auth.account_id, "acc1@test.com");

        assert!(r.switch_account(&cancel, &mut auth).await);
        assert_eq!(auth.account_id, "acc2@test.com");
        assert!(auth.tried_accounts.contains("acc1@test.com"));

        assert!(!r.switch_account(&cancel, &mut auth).await);
        assert_eq!(r.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_drop_guard_releases() {
        let r = default_resolver();
        let cancel = CancellationToken::new();
        let h = header_map(&[("authorization", "Bearer managed-key")]);
        let mut auth = r.determine(&cancel, &h).await.unwrap();
        r.release(&mut auth);
        r.release(&mut auth);
        assert_eq!(r.pool().status().in_use, 0);

        // Drop 兜底：作用域退出自动归还
        {
            let _auth = r.determine(&cancel, &h).await.unwrap();
            assert_eq!(r.pool().status().in_use, 1);
        }
        assert_eq!(r.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn determine_caller_has_no_pool_pressure() {
        let r = default_resolver();
        let h = header_map(&[("authorization", "Bearer managed-key")]);
        let auth = r.determine_caller(&h).unwrap();
        assert!(auth.use_managed_key);
        assert_eq!(auth.caller_id, "managed-key");
        assert_eq!(r.pool().status().in_use, 0);
    }
}
