use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7860;

/// 进程级环境变量设置（一次读取，启动后不变）。
///
/// 账号池相关的上限若在此处给出，优先级高于持久化配置 `runtime` 段。
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub host: String,
    pub port: u16,
    pub debug: String,

    pub config_json: String,
    pub account_max_inflight: Option<usize>,
    pub account_max_queue: Option<usize>,
    pub admin_key: String,
    pub jwt_secret: String,
    pub jwt_expire_hours: Option<i64>,
    pub pow_pool_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "DS2API_CONFIG_JSON")]
    ds2api_config_json: Option<String>,
    #[serde(alias = "DS2API_ACCOUNT_MAX_INFLIGHT")]
    ds2api_account_max_inflight: Option<String>,
    // DS2API_ACCOUNT_CONCURRENCY 是 MAX_INFLIGHT 的历史别名
    #[serde(alias = "DS2API_ACCOUNT_CONCURRENCY")]
    ds2api_account_concurrency: Option<String>,
    #[serde(alias = "DS2API_ACCOUNT_MAX_QUEUE")]
    ds2api_account_max_queue: Option<String>,
    // DS2API_ACCOUNT_QUEUE_SIZE 是 MAX_QUEUE 的历史别名
    #[serde(alias = "DS2API_ACCOUNT_QUEUE_SIZE")]
    ds2api_account_queue_size: Option<String>,
    #[serde(alias = "DS2API_ADMIN_KEY")]
    ds2api_admin_key: Option<String>,
    #[serde(alias = "DS2API_JWT_SECRET")]
    ds2api_jwt_secret: Option<String>,
    #[serde(alias = "DS2API_JWT_EXPIRE_HOURS")]
    ds2api_jwt_expire_hours: Option<String>,
    #[serde(alias = "DS2API_POW_POOL_SIZE")]
    ds2api_pow_pool_size: Option<String>,
}

impl EnvSettings {
    pub fn load() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnv) -> Self {
        let max_inflight = parse_positive(raw.ds2api_account_max_inflight.as_deref())
            .or_else(|| parse_positive(raw.ds2api_account_concurrency.as_deref()));
        let max_queue = parse_positive(raw.ds2api_account_max_queue.as_deref())
            .or_else(|| parse_positive(raw.ds2api_account_queue_size.as_deref()));

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            config_json: raw.ds2api_config_json.unwrap_or_default(),
            account_max_inflight: max_inflight,
            account_max_queue: max_queue,
            admin_key: raw.ds2api_admin_key.unwrap_or_default(),
            jwt_secret: raw.ds2api_jwt_secret.unwrap_or_default(),
            jwt_expire_hours: raw
                .ds2api_jwt_expire_hours
                .as_deref()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .filter(|v| *v > 0),
            pow_pool_size: parse_positive(raw.ds2api_pow_pool_size.as_deref()),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}

fn parse_positive(value: Option<&str>) -> Option<usize> {
    let v = value?.trim();
    if v.is_empty() {
        return None;
    }
    v.parse::<usize>().ok().filter(|n| *n > 0)
}
