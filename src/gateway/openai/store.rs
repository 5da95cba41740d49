use sonic_rs::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 按租户隔离的 responses 对象缓存。
///
/// 键是 `owner + NUL + response_id`；跨租户读取一律未命中。
/// 每次读写都先清扫过期条目。
#[derive(Debug)]
pub struct ResponseStore {
    ttl: Duration,
    items: Mutex<HashMap<String, StoredResponse>>,
}

#[derive(Debug, Clone)]
struct StoredResponse {
    owner: String,
    value: Value,
    expires_at: Instant,
}

fn store_key(owner: &str, id: &str) -> String {
    format!("{owner}\u{0}{id}")
}

impl ResponseStore {
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() {
            Duration::from_secs(900)
        } else {
            ttl
        };
        Self {
            ttl,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, owner: &str, id: &str, value: Value) {
        if owner.is_empty() || id.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        sweep(&mut items, now);
        items.insert(
            store_key(owner, id),
            StoredResponse {
                owner: owner.to_string(),
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn get(&self, owner: &str, id: &str) -> Option<Value> {
        if owner.is_empty() || id.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        sweep(&mut items, now);
        let item = items.get(&store_key(owner, id))?;
        if item.owner != owner {
            return None;
        }
        Some(item.value.clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn sweep(items: &mut HashMap<String, StoredResponse>, now: Instant) {
    items.retain(|_, v| v.expires_at > now);
}
