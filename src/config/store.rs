use crate::config::env::EnvSettings;
use crate::config::types::{self, Account, Config, RuntimeLimits};
use anyhow::{Context, anyhow};
use arc_swap::ArcSwap;
use base64::Engine;
use std::sync::{Arc, Mutex};

/// 配置存储：读方经由原子指针拿快照，写方串行化后整体替换。
///
/// 每次变更都是 clone → 修改 → 发布新快照，读侧永远看到一致的配置。
#[derive(Debug)]
pub struct Store {
    current: ArcSwap<Config>,
    write_lock: Mutex<()>,
    env: EnvSettings,
}

impl Store {
    /// 从环境变量加载。DS2API_CONFIG_JSON 非法时直接失败（启动期 fail fast）。
    pub fn load() -> anyhow::Result<Self> {
        let env = EnvSettings::load();
        let cfg = if env.config_json.trim().is_empty() {
            Config::default()
        } else {
            parse_config_string(&env.config_json).context("解析 DS2API_CONFIG_JSON 失败")?
        };
        types::validate_config(&cfg).map_err(|e| anyhow!(e))?;
        Ok(Self::with_env(cfg, env))
    }

    /// 测试与内嵌场景：直接给定配置。
    pub fn from_config(cfg: Config) -> Self {
        Self::with_env(cfg, EnvSettings::default())
    }

    pub fn with_env(cfg: Config, env: EnvSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(cfg),
            write_lock: Mutex::new(()),
            env,
        }
    }

    pub fn env(&self) -> &EnvSettings {
        &self.env
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// 整体替换配置（管理端导入）。
    pub fn replace(&self, cfg: Config) -> anyhow::Result<()> {
        types::validate_config(&cfg).map_err(|e| anyhow!(e))?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.current.store(Arc::new(cfg));
        Ok(())
    }

    /// 基于当前快照做一次修改并发布。
    pub fn update<F>(&self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Config) -> anyhow::Result<()>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut cfg = (*self.current.load_full()).clone();
        f(&mut cfg)?;
        types::validate_config(&cfg).map_err(|e| anyhow!(e))?;
        self.current.store(Arc::new(cfg));
        Ok(())
    }

    pub fn has_api_key(&self, token: &str) -> bool {
        self.snapshot().has_api_key(token)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.snapshot().accounts.clone()
    }

    pub fn find_account(&self, identifier: &str) -> Option<Account> {
        self.snapshot().find_account(identifier).cloned()
    }

    /// 登录/刷新后把新 token 写回对应账号。
    pub fn set_account_token(&self, identifier: &str, token: &str) -> anyhow::Result<()> {
        let identifier = identifier.to_string();
        let token = token.to_string();
        self.update(move |cfg| {
            for acc in &mut cfg.accounts {
                if acc.identifier() == identifier {
                    acc.token = token.clone();
                    return Ok(());
                }
            }
            Err(anyhow!("未找到账号: {identifier}"))
        })
    }

    /// 清空账号 token（标记失效，下次使用触发重新登录）。
    pub fn clear_account_token(&self, identifier: &str) {
        let identifier = identifier.to_string();
        let _ = self.update(move |cfg| {
            for acc in &mut cfg.accounts {
                if acc.identifier() == identifier {
                    acc.token.clear();
                }
            }
            Ok(())
        });
    }

    /// claude_mapping，未配置的键补默认值。
    pub fn claude_mapping(&self) -> std::collections::HashMap<String, String> {
        let mut mapping = self.snapshot().claude_mapping.clone();
        mapping
            .entry("fast".to_string())
            .or_insert_with(|| "deepseek-chat".to_string());
        mapping
            .entry("slow".to_string())
            .or_insert_with(|| "deepseek-reasoner".to_string());
        mapping
    }

    /// 别名解析后的模型名（未命中别名时原样返回，去首尾空白）。
    pub fn resolve_model(&self, requested: &str) -> String {
        let requested = requested.trim();
        let snap = self.snapshot();
        if let Some(target) = snap.model_aliases.get(requested) {
            return target.trim().to_string();
        }
        // 别名表大小写不敏感兜底
        let lower = requested.to_lowercase();
        for (alias, target) in &snap.model_aliases {
            if alias.to_lowercase() == lower {
                return target.trim().to_string();
            }
        }
        requested.to_string()
    }

    /// 运行时上限：环境变量优先，其次持久化配置。
    pub fn runtime_limits(&self) -> RuntimeLimits {
        let mut limits = self.snapshot().runtime;
        if let Some(v) = self.env.account_max_inflight {
            limits.account_max_inflight = v;
        }
        if let Some(v) = self.env.account_max_queue {
            limits.account_max_queue = v;
        }
        limits
    }

    pub fn responses_store_ttl_seconds(&self) -> u64 {
        let ttl = self.snapshot().responses.store_ttl_seconds;
        if ttl == 0 { 900 } else { ttl }
    }

    pub fn toolcall_mode_enabled(&self) -> bool {
        self.snapshot().toolcall.mode_enabled()
    }

    pub fn toolcall_early_emit_confidence(&self) -> String {
        self.snapshot()
            .toolcall
            .early_emit_confidence
            .trim()
            .to_lowercase()
    }

    pub fn embeddings_provider(&self) -> String {
        self.snapshot().embeddings.provider.trim().to_string()
    }

    pub fn compat_wide_input_strict_output(&self) -> bool {
        self.snapshot().compat.wide_input_strict_output
    }

    pub fn export_json_and_base64(&self) -> anyhow::Result<(String, String)> {
        let snap = self.snapshot();
        let json = sonic_rs::to_string(&*snap).context("序列化配置失败")?;
        let b64 = base64::engine::general_purpose::STANDARD.encode(json.as_bytes());
        Ok((json, b64))
    }
}

/// 解析配置字符串：支持裸 JSON 与 `base64:<b64>` 前缀，两侧引号会被剥掉。
pub fn parse_config_string(input: &str) -> anyhow::Result<Config> {
    let normalized = normalize_config_input(input);
    if normalized.is_empty() {
        return Err(anyhow!("配置字符串为空"));
    }

    let json = if let Some(b64) = normalized.strip_prefix("base64:") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64.trim())
            .context("base64 解码失败")?;
        String::from_utf8(decoded).context("base64 内容不是 UTF-8")?
    } else {
        normalized
    };

    sonic_rs::from_str::<Config>(&json).context("配置 JSON 解析失败")
}

fn normalize_config_input(input: &str) -> String {
    let mut s = input.trim();
    let b = s.as_bytes();
    if b.len() >= 2 {
        let (first, last) = (b[0], b[b.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            s = &s[1..s.len() - 1];
        }
    }
    s.trim().to_string()
}
