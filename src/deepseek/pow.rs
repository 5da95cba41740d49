use anyhow::anyhow;
use base64::Engine;
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use sonic_rs::{JsonValueTrait, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POW_POOL_SIZE: usize = 2;

/// 上游下发的 PoW 挑战。
#[derive(Debug, Clone, Default)]
pub struct PowChallenge {
    pub algorithm: String,
    pub challenge: String,
    pub salt: String,
    pub difficulty: u64,
    pub expire_at: i64,
    pub signature: String,
    pub target_path: String,
}

impl PowChallenge {
    pub fn from_value(v: &Value) -> Self {
        Self {
            algorithm: str_field(v, "algorithm"),
            challenge: str_field(v, "challenge"),
            salt: str_field(v, "salt"),
            difficulty: v
                .get("difficulty")
                .and_then(|d| d.as_u64())
                .unwrap_or(144_000),
            expire_at: v.get("expire_at").and_then(|d| d.as_i64()).unwrap_or(0),
            signature: str_field(v, "signature"),
            target_path: str_field(v, "target_path"),
        }
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("").to_string()
}

/// 把解出的 answer 连同挑战回显编码为 `X-Ds-Pow-Response` 头的值。
pub fn build_pow_header(challenge: &PowChallenge, answer: u64) -> String {
    #[derive(Serialize)]
    struct PowResponse<'a> {
        algorithm: &'a str,
        challenge: &'a str,
        salt: &'a str,
        answer: u64,
        signature: &'a str,
        target_path: &'a str,
    }

    let body = PowResponse {
        algorithm: &challenge.algorithm,
        challenge: &challenge.challenge,
        salt: &challenge.salt,
        answer,
        signature: &challenge.signature,
        target_path: &challenge.target_path,
    };
    let json = sonic_rs::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    base64::engine::general_purpose::STANDARD.encode(json.as_bytes())
}

/// PoW 求解器：固定容量的工作槽，封顶并发求解数但从不永久阻塞。
///
/// DeepSeekHashV1：对 `{salt}_{expire_at}_{nonce}` 求 sha3-256，
/// 取摘要前 8 字节为大端整数，小于 `u64::MAX / difficulty` 即命中。
#[derive(Debug, Clone)]
pub struct PowSolver {
    permits: Arc<Semaphore>,
}

impl PowSolver {
    pub fn new(pool_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    pub fn pool_size_from_env(env_value: Option<usize>) -> usize {
        env_value.filter(|v| *v > 0).unwrap_or(DEFAULT_POW_POOL_SIZE)
    }

    pub async fn solve(
        &self,
        cancel: &CancellationToken,
        challenge: &PowChallenge,
    ) -> anyhow::Result<u64> {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| anyhow!("PoW 求解池已关闭"))?
            }
            _ = cancel.cancelled() => return Err(anyhow!("等待 PoW 求解槽时请求被取消")),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_on_cancel = stop.clone();
        let cancel_watch = cancel.clone();
        let watcher = tokio::spawn(async move {
            cancel_watch.cancelled().await;
            stop_on_cancel.store(true, Ordering::Relaxed);
        });

        let prefix = format!("{}_{}_", challenge.salt, challenge.expire_at);
        let difficulty = challenge.difficulty.max(1);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let target = u64::MAX / difficulty;
            let mut nonce: u64 = 0;
            loop {
                if nonce % 4096 == 0 && stop.load(Ordering::Relaxed) {
                    return None;
                }
                let mut hasher = Sha3_256::new();
                hasher.update(prefix.as_bytes());
                hasher.update(nonce.to_string().as_bytes());
                let digest = hasher.finalize();
                let head = u64::from_be_bytes([
                    digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                    digest[7],
                ]);
                if head <= target {
                    return Some(nonce);
                }
                nonce = nonce.wrapping_add(1);
            }
        })
        .await;

        watcher.abort();
        match result {
            Ok(Some(answer)) => Ok(answer),
            Ok(None) => Err(anyhow!("PoW 求解被取消")),
            Err(e) => Err(anyhow!("PoW 求解线程异常: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_from_env_defaults() {
        assert_eq!(PowSolver::pool_size_from_env(None), DEFAULT_POW_POOL_SIZE);
        assert_eq!(PowSolver::pool_size_from_env(Some(0)), DEFAULT_POW_POOL_SIZE);
        assert_eq!(PowSolver::pool_size_from_env(Some(5)), 5);
    }

    #[test]
    fn challenge_parses_from_value() {
        let v: Value = sonic_rs::from_str(
            r#"{"algorithm":"DeepSeekHashV1","challenge":"abc123","salt":"salt456","difficulty":1000,"expire_at":1700000000,"signature":"sig789","target_path":"/api/v0/chat/completion"}"#,
        )
        .unwrap();
        let c = PowChallenge::from_value(&v);
        assert_eq!(c.algorithm, "DeepSeekHashV1");
        assert_eq!(c.difficulty, 1000);
        assert_eq!(c.target_path, "/api/v0/chat/completion");
    }

    #[test]
    fn header_is_base64_json_echo() {
        let c = PowChallenge {
            algorithm: "DeepSeekHashV1".into(),
            challenge: "abc123".into(),
            salt: "salt456".into(),
            difficulty: 10,
            expire_at: 0,
            signature: "sig789".into(),
            target_path: "/path".into(),
        };
        let header = build_pow_header(&c, 42);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(header)
            .unwrap();
        let v: Value = sonic_rs::from_slice(&decoded).unwrap();
        assert_eq!(v.get("answer").and_then(|x| x.as_u64()), Some(42));
        assert_eq!(v.get("challenge").and_then(|x| x.as_str()), Some("abc123"));
    }

    #[test]
    fn header_for_empty_challenge_is_nonempty() {
        let header = build_pow_header(&PowChallenge::default(), 0);
        assert!(!header.is_empty());
    }

    #[tokio::test]
    async fn solver_finds_answer_for_trivial_difficulty() {
        let solver = PowSolver::new(1);
        let c = PowChallenge {
            difficulty: 1,
            ..PowChallenge::default()
        };
        let answer = solver
            .solve(&CancellationToken::new(), &c)
            .await
            .expect("难度 1 应立即解出");
        // difficulty=1 时 target=u64::MAX，首个 nonce 即命中
        assert_eq!(answer, 0);
    }

    #[tokio::test]
    async fn solver_cancellation_fails_the_call() {
        let solver = PowSolver::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let c = PowChallenge {
            difficulty: u64::MAX,
            ..PowChallenge::default()
        };
        // 取消的上下文在等待求解槽或求解早期即退出
        let got = solver.solve(&cancel, &c).await;
        assert!(got.is_err());
    }
}
