use std::time::Duration;

pub const DEEPSEEK_HOST: &str = "chat.deepseek.com";
pub const DEEPSEEK_LOGIN_URL: &str = "https://chat.deepseek.com/api/v0/users/login";
pub const DEEPSEEK_CREATE_SESSION_URL: &str =
    "https://chat.deepseek.com/api/v0/chat_session/create";
pub const DEEPSEEK_CREATE_POW_URL: &str =
    "https://chat.deepseek.com/api/v0/chat/create_pow_challenge";
pub const DEEPSEEK_COMPLETION_URL: &str = "https://chat.deepseek.com/api/v0/chat/completion";

/// 上游要求的固定请求头（移动端指纹）。
pub const BASE_HEADERS: [(&str, &str); 8] = [
    ("Host", "chat.deepseek.com"),
    ("User-Agent", "DeepSeek/1.6.11 Android/35"),
    ("Accept", "application/json"),
    ("Content-Type", "application/json"),
    ("x-client-platform", "android"),
    ("x-client-version", "1.6.11"),
    ("x-client-locale", "zh_CN"),
    ("accept-charset", "UTF-8"),
];

pub const POW_RESPONSE_HEADER: &str = "X-Ds-Pow-Response";
pub const TARGET_ACCOUNT_HEADER: &str = "X-Ds2-Target-Account";

/// SSE 路径跳过表：命中即丢弃的簿记事件。
pub const SKIP_EXACT_PATHS: [&str; 1] = ["response/search_status"];

pub const SKIP_CONTAINS_PATTERNS: [&str; 8] = [
    "quasi_status",
    "elapsed_secs",
    "token_usage",
    "pending_fragment",
    "conversation_mode",
    "fragments/-1/status",
    "fragments/-2/status",
    "fragments/-3/status",
];

pub fn should_skip_path(path: &str) -> bool {
    if SKIP_EXACT_PATHS.contains(&path) {
        return true;
    }
    SKIP_CONTAINS_PATTERNS.iter().any(|p| path.contains(p))
}

/// keep-alive 周期；无内容时每个周期计一次数。
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// 已有内容后允许的最大空闲时长。
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// 从未有内容时允许的最大 keep-alive 次数。
pub const MAX_KEEPALIVE_COUNT: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_paths() {
        assert!(should_skip_path("response/quasi_status"));
        assert!(should_skip_path("response/elapsed_secs"));
        assert!(should_skip_path("response/token_usage"));
        assert!(should_skip_path("response/pending_fragment"));
        assert!(should_skip_path("response/conversation_mode"));
        assert!(should_skip_path("response/search_status"));
        assert!(should_skip_path("response/fragments/-1/status"));
        assert!(should_skip_path("response/fragments/-2/status"));
        assert!(should_skip_path("response/fragments/-3/status"));
        assert!(!should_skip_path("response/content"));
        assert!(!should_skip_path("response/thinking_content"));
    }
}
