use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// 一个池化的上游账号。
///
/// 标识符取 email、mobile 中第一个非空者；两者皆空但有 token 时，
/// 用 token 的 sha256 前缀合成 `token:<hash>` 标识。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mobile: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test_status: Option<String>,
}

impl Account {
    pub fn identifier(&self) -> String {
        let email = self.email.trim();
        if !email.is_empty() {
            return email.to_string();
        }
        let mobile = self.mobile.trim();
        if !mobile.is_empty() {
            return mobile.to_string();
        }
        let token = self.token.trim();
        if !token.is_empty() {
            return format!("token:{}", sha256_prefix(token, 16));
        }
        String::new()
    }

    pub fn has_credentials(&self) -> bool {
        !self.password.trim().is_empty()
            && (!self.email.trim().is_empty() || !self.mobile.trim().is_empty())
    }
}

pub fn sha256_prefix(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..hex.len().min(len)].to_string()
}

/// 账号池的运行时上限。0 表示"未设置"（global 为 0 时视为不限制）。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeLimits {
    #[serde(default)]
    pub account_max_inflight: usize,
    #[serde(default)]
    pub account_max_queue: usize,
    #[serde(default)]
    pub global_max_inflight: usize,
}

impl RuntimeLimits {
    pub const DEFAULT_ACCOUNT_MAX_INFLIGHT: usize = 1;
    pub const DEFAULT_ACCOUNT_MAX_QUEUE: usize = 20;

    pub fn effective_max_inflight(&self) -> usize {
        if self.account_max_inflight > 0 {
            self.account_max_inflight
        } else {
            Self::DEFAULT_ACCOUNT_MAX_INFLIGHT
        }
    }

    pub fn effective_max_queue(&self) -> usize {
        if self.account_max_queue > 0 {
            self.account_max_queue
        } else {
            Self::DEFAULT_ACCOUNT_MAX_QUEUE
        }
    }

    /// 0 = 不限制。
    pub fn effective_global_max(&self) -> usize {
        self.global_max_inflight
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolcallConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub early_emit_confidence: String,
}

impl ToolcallConfig {
    pub fn mode_enabled(&self) -> bool {
        // 默认 feature_match：调用方带 tools 即启用筛分器。
        !self.mode.trim().eq_ignore_ascii_case("off")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesConfig {
    #[serde(default)]
    pub store_ttl_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password_hash: String,
    #[serde(default)]
    pub jwt_expire_hours: i64,
    #[serde(default)]
    pub jwt_valid_after_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatConfig {
    #[serde(default = "default_true")]
    pub wide_input_strict_output: bool,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            wide_input_strict_output: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// 持久化配置（DS2API_CONFIG_JSON 的内容）。
///
/// 未识别的字段收进 `extra`，导出时原样回写。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub claude_mapping: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_aliases: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "runtime_is_unset")]
    pub runtime: RuntimeLimits,
    #[serde(default, skip_serializing_if = "toolcall_is_unset")]
    pub toolcall: ToolcallConfig,
    #[serde(default, skip_serializing_if = "responses_is_unset")]
    pub responses: ResponsesConfig,
    #[serde(default, skip_serializing_if = "embeddings_is_unset")]
    pub embeddings: EmbeddingsConfig,
    #[serde(default, skip_serializing_if = "admin_is_unset")]
    pub admin: AdminConfig,
    #[serde(default)]
    pub compat: CompatConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vercel_sync_hash: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub vercel_sync_time: i64,
    #[serde(flatten)]
    pub extra: HashMap<String, sonic_rs::Value>,
}

fn runtime_is_unset(v: &RuntimeLimits) -> bool {
    *v == RuntimeLimits::default()
}

fn toolcall_is_unset(v: &ToolcallConfig) -> bool {
    v.mode.is_empty() && v.early_emit_confidence.is_empty()
}

fn responses_is_unset(v: &ResponsesConfig) -> bool {
    v.store_ttl_seconds == 0
}

fn embeddings_is_unset(v: &EmbeddingsConfig) -> bool {
    v.provider.is_empty()
}

fn admin_is_unset(v: &AdminConfig) -> bool {
    v.password_hash.is_empty() && v.jwt_expire_hours == 0 && v.jwt_valid_after_unix == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

impl Config {
    pub fn find_account(&self, identifier: &str) -> Option<&Account> {
        let id = identifier.trim();
        if id.is_empty() {
            return None;
        }
        self.accounts.iter().find(|a| {
            a.identifier() == id || a.email.trim() == id || a.mobile.trim() == id
        })
    }

    pub fn has_api_key(&self, token: &str) -> bool {
        !token.is_empty() && self.keys.iter().any(|k| k == token)
    }
}

/// 已知上游模型及其能力。
const MODEL_TABLE: [(&str, bool, bool); 4] = [
    ("deepseek-chat", false, false),
    ("deepseek-reasoner", true, false),
    ("deepseek-chat-search", false, true),
    ("deepseek-reasoner-search", true, true),
];

/// 查询模型能力：(thinking_enabled, search_enabled, 已知)。大小写不敏感。
pub fn get_model_config(model: &str) -> (bool, bool, bool) {
    let m = model.trim().to_lowercase();
    for (name, thinking, search) in MODEL_TABLE {
        if m == name {
            return (thinking, search, true);
        }
    }
    (false, false, false)
}

pub fn known_models() -> Vec<&'static str> {
    MODEL_TABLE.iter().map(|(name, _, _)| *name).collect()
}

/// 管理端配置校验（零值/空串表示"未设置"，不参与校验）。
pub fn validate_config(c: &Config) -> Result<(), String> {
    let admin = &c.admin;
    if admin.jwt_expire_hours != 0 && !(1..=720).contains(&admin.jwt_expire_hours) {
        return Err("admin.jwt_expire_hours 必须在 1 到 720 之间".to_string());
    }
    validate_runtime_limits(&c.runtime)?;
    let ttl = c.responses.store_ttl_seconds;
    if ttl != 0 && !(30..=86_400).contains(&ttl) {
        return Err("responses.store_ttl_seconds 必须在 30 到 86400 之间".to_string());
    }
    let mode = c.toolcall.mode.trim();
    if !mode.is_empty() && mode != "feature_match" && mode != "off" {
        return Err("toolcall.mode 必须是 feature_match 或 off".to_string());
    }
    let level = c.toolcall.early_emit_confidence.trim();
    if !level.is_empty() && level != "high" && level != "low" && level != "off" {
        return Err("toolcall.early_emit_confidence 必须是 high、low 或 off".to_string());
    }
    Ok(())
}

pub fn validate_runtime_limits(runtime: &RuntimeLimits) -> Result<(), String> {
    if runtime.account_max_inflight != 0 && !(1..=256).contains(&runtime.account_max_inflight) {
        return Err("runtime.account_max_inflight 必须在 1 到 256 之间".to_string());
    }
    if runtime.account_max_queue != 0 && !(1..=200_000).contains(&runtime.account_max_queue) {
        return Err("runtime.account_max_queue 必须在 1 到 200000 之间".to_string());
    }
    if runtime.global_max_inflight != 0 && !(1..=200_000).contains(&runtime.global_max_inflight) {
        return Err("runtime.global_max_inflight 必须在 1 到 200000 之间".to_string());
    }
    if runtime.account_max_inflight > 0
        && runtime.global_max_inflight > 0
        && runtime.global_max_inflight < runtime.account_max_inflight
    {
        return Err("runtime.global_max_inflight 不能小于 runtime.account_max_inflight".to_string());
    }
    Ok(())
}
