use crate::config::Store;
use crate::error::AppError;
use anyhow::{Context, anyhow};
use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Once;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_JWT_SECRET: &str = "ds2api-insecure-default-secret";
pub const DEFAULT_JWT_EXPIRE_HOURS: i64 = 24;

static INSECURE_SECRET_WARN: Once = Once::new();

/// 管理端 JWT 密钥；未配置时退回默认值并告警一次。
pub fn jwt_secret(store: &Store) -> String {
    let from_env = store.env().jwt_secret.trim();
    if !from_env.is_empty() {
        return from_env.to_string();
    }
    INSECURE_SECRET_WARN.call_once(|| {
        tracing::warn!("未设置 DS2API_JWT_SECRET，管理端 JWT 使用不安全的默认密钥");
    });
    DEFAULT_JWT_SECRET.to_string()
}

pub fn jwt_expire_hours(store: &Store) -> i64 {
    if let Some(h) = store.env().jwt_expire_hours {
        return h;
    }
    let cfg_hours = store.snapshot().admin.jwt_expire_hours;
    if cfg_hours > 0 {
        cfg_hours
    } else {
        DEFAULT_JWT_EXPIRE_HOURS
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub iat: i64,
    pub exp: i64,
}

/// 签发 HS256 JWT。`expire_hours <= 0` 时使用默认有效期。
pub fn create_jwt(secret: &str, expire_hours: i64) -> anyhow::Result<String> {
    let hours = if expire_hours > 0 {
        expire_hours
    } else {
        DEFAULT_JWT_EXPIRE_HOURS
    };
    let now = Utc::now().timestamp();
    let claims = JwtClaims {
        iat: now,
        exp: now + hours * 3600,
    };

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(sonic_rs::to_vec(&claims).context("序列化 JWT 载荷失败")?);
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, signing_input.as_bytes())?);
    Ok(format!("{signing_input}.{signature}"))
}

/// 校验 JWT：签名、过期时间，以及 `valid_after`（吊销线）之前签发的一律拒绝。
pub fn verify_jwt(secret: &str, token: &str, valid_after_unix: i64) -> anyhow::Result<JwtClaims> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(anyhow!("JWT 格式不正确"));
    };

    let signing_input = format!("{header}.{payload}");
    let expected = sign(secret, signing_input.as_bytes())?;
    let got = URL_SAFE_NO_PAD
        .decode(signature)
        .context("JWT 签名不是合法 base64url")?;
    if !constant_time_eq(&expected, &got) {
        return Err(anyhow!("JWT 签名校验失败"));
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .context("JWT 载荷不是合法 base64url")?;
    let claims: JwtClaims =
        sonic_rs::from_slice(&payload_bytes).context("JWT 载荷解析失败")?;

    let now = Utc::now().timestamp();
    if claims.exp <= now {
        return Err(anyhow!("JWT 已过期"));
    }
    if valid_after_unix > 0 && claims.iat < valid_after_unix {
        return Err(anyhow!("JWT 已被吊销"));
    }
    Ok(claims)
}

fn sign(secret: &str, input: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("JWT 密钥不可用"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// 管理端请求鉴权：`Bearer <DS2API_ADMIN_KEY>` 或合法 JWT。
pub fn verify_admin_request(store: &Store, headers: &HeaderMap) -> Result<(), AppError> {
    let token = super::resolver::extract_caller_token(headers);
    if token.is_empty() {
        return Err(AppError::unauthorized("缺少管理凭据".to_string()));
    }

    let admin_key = store.env().admin_key.trim();
    if !admin_key.is_empty() && token == admin_key {
        return Ok(());
    }

    let valid_after = store.snapshot().admin.jwt_valid_after_unix;
    verify_jwt(&jwt_secret(store), &token, valid_after)
        .map(|_| ())
        .map_err(|e| AppError::unauthorized(format!("管理凭据无效: {e}")))
}

/// 管理端登录：密码与配置中的 sha256 哈希比对。
pub fn verify_admin_password(store: &Store, password: &str) -> bool {
    let hash = store.snapshot().admin.password_hash.trim().to_lowercase();
    if hash.is_empty() {
        // 未设置密码时退回 DS2API_ADMIN_KEY 直比
        let admin_key = store.env().admin_key.trim();
        return !admin_key.is_empty() && password == admin_key;
    }
    sha256_hex(password) == hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::parse_config_string;

    fn store_with(cfg: &str) -> Store {
        Store::from_config(parse_config_string(cfg).unwrap())
    }

    #[test]
    fn jwt_roundtrip() {
        let token = create_jwt("secret", 1).unwrap();
        let claims = verify_jwt("secret", &token, 0).unwrap();
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn jwt_default_expiry_on_zero() {
        let token = create_jwt("secret", 0).unwrap();
        assert!(verify_jwt("secret", &token, 0).is_ok());
    }

    #[test]
    fn jwt_rejects_bad_format_and_signature() {
        assert!(verify_jwt("secret", "not-a-jwt", 0).is_err());

        let token = create_jwt("secret", 1).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[2] = "invalid_signature";
        let tampered = parts.join(".");
        assert!(verify_jwt("secret", &tampered, 0).is_err());

        assert!(verify_jwt("other-secret", &token, 0).is_err());
    }

    #[test]
    fn jwt_rejects_issued_before_valid_after() {
        let token = create_jwt("secret", 1).unwrap();
        let future = Utc::now().timestamp() + 3600;
        assert!(verify_jwt("secret", &token, future).is_err());
    }

    #[test]
    fn admin_password_uses_sha256_hash() {
        let hash = sha256_hex("hunter2");
        let store = store_with(&format!(r#"{{"admin":{{"password_hash":"{hash}"}}}}"#));
        assert!(verify_admin_password(&store, "hunter2"));
        assert!(!verify_admin_password(&store, "wrong"));
    }

    #[test]
    fn admin_request_rejects_missing_and_basic_auth() {
        let store = store_with(r#"{"keys":[]}"#);
        let headers = HeaderMap::new();
        assert!(verify_admin_request(&store, &headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic abc123".parse().unwrap(),
        );
        assert!(verify_admin_request(&store, &headers).is_err());
    }

    #[test]
    fn admin_request_accepts_valid_jwt() {
        let store = store_with(r#"{"keys":[]}"#);
        let token = create_jwt(&jwt_secret(&store), 1).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        assert!(verify_admin_request(&store, &headers).is_ok());
    }
}
