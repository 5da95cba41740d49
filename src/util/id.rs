use uuid::Uuid;

pub fn chat_completion_id() -> String {
    let s = Uuid::new_v4().to_string();
    let prefix = s.split('-').next().unwrap_or(&s);
    let short = &prefix[..prefix.len().min(8)];
    format!("chatcmpl-{short}")
}

pub fn response_id() -> String {
    format!("resp_{}", Uuid::new_v4().simple())
}

pub fn message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

pub fn tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

pub fn session_title() -> String {
    // 上游会话标题无实际语义，仅要求非空且基本唯一。
    format!("ds2api-{}", Uuid::new_v4().simple())
}

pub fn random_u64() -> u64 {
    // 复用 UUID v4 的随机源，避免额外引入 rand/getrandom 依赖。
    let b = *Uuid::new_v4().as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_completion_id_has_prefix_and_short_suffix() {
        let id = chat_completion_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 8);
    }

    #[test]
    fn ids_are_unique_enough() {
        assert_ne!(response_id(), response_id());
        assert_ne!(tool_call_id(), tool_call_id());
    }
}
