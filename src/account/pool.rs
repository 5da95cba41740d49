use crate::config::{Account, RuntimeLimits, Store};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// 账号池：按账号限制并发、全局限流、FIFO 等待队列。
///
/// 不变式：
/// - 每账号 `0 <= inflight <= max_inflight`
/// - `sum(inflight) == total_inflight <= global_max`（global_max=0 不限）
/// - 队列长度 <= max_queue，唤醒严格按入队顺序尝试
#[derive(Debug)]
pub struct Pool {
    inner: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    entries: Vec<Entry>,
    total_inflight: usize,
    max_inflight: usize,
    global_max: usize,
    max_queue: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

#[derive(Debug)]
struct Entry {
    identifier: String,
    account: Account,
    inflight: usize,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    target: String,
    exclude: HashSet<String>,
    tx: oneshot::Sender<Account>,
}

/// 池状态快照（管理端展示用）。
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub max_inflight_per_account: usize,
    pub recommended_concurrency: usize,
    pub max_queue_size: usize,
    pub global_max_inflight: usize,
    pub available_accounts: Vec<String>,
    pub in_use_accounts: Vec<String>,
}

impl Pool {
    pub fn new(store: &Store) -> Self {
        let snapshot = store.snapshot();
        Self::from_parts(snapshot.accounts.clone(), store.runtime_limits())
    }

    pub fn from_parts(accounts: Vec<Account>, limits: RuntimeLimits) -> Self {
        Self {
            inner: Mutex::new(PoolState {
                entries: build_entries(accounts),
                total_inflight: 0,
                max_inflight: limits.effective_max_inflight(),
                global_max: limits.effective_global_max(),
                max_queue: limits.effective_max_queue(),
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// 非阻塞获取。target 为空表示任意账号；exclude 内的标识符被跳过。
    pub fn acquire(&self, target: &str, exclude: &HashSet<String>) -> Option<Account> {
        let mut state = self.lock();
        state.try_admit(target, exclude)
    }

    /// 阻塞获取：没有空位时入队等待，直到被唤醒或 `cancel` 取消。
    ///
    /// 入队即失败的情况：队列已满；指定了不存在的 target；
    /// 所有已配置账号都被 exclude。
    pub async fn acquire_wait(
        &self,
        cancel: &CancellationToken,
        target: &str,
        exclude: &HashSet<String>,
    ) -> Option<Account> {
        let (waiter_id, rx) = {
            let mut state = self.lock();
            if let Some(acc) = state.try_admit(target, exclude) {
                return Some(acc);
            }
            if state.entries.is_empty() {
                return None;
            }
            let target = target.trim();
            if !target.is_empty() && !state.entries.iter().any(|e| e.identifier == target) {
                return None;
            }
            if target.is_empty()
                && state.entries.iter().all(|e| exclude.contains(&e.identifier))
            {
                return None;
            }
            if state.waiters.len() >= state.max_queue {
                return None;
            }

            let (tx, rx) = oneshot::channel();
            state.next_waiter_id += 1;
            let id = state.next_waiter_id;
            state.waiters.push_back(Waiter {
                id,
                target: target.to_string(),
                exclude: exclude.clone(),
                tx,
            });
            (id, rx)
        };

        let mut rx = rx;
        tokio::select! {
            res = &mut rx => res.ok(),
            _ = cancel.cancelled() => {
                let was_queued = {
                    let mut state = self.lock();
                    state.remove_waiter(waiter_id)
                };
                if !was_queued {
                    // 取消与唤醒竞争：唤醒方已发出账号，把占到的位还回去。
                    if let Ok(acc) = rx.try_recv() {
                        self.release(&acc.identifier());
                    }
                }
                None
            }
        }
    }

    /// 归还一个账号位。未知标识符或计数已为 0 时为空操作。
    pub fn release(&self, identifier: &str) {
        let mut state = self.lock();
        let identifier = identifier.trim();
        let Some(entry) = state.entries.iter_mut().find(|e| e.identifier == identifier) else {
            return;
        };
        if entry.inflight == 0 {
            return;
        }
        entry.inflight -= 1;
        state.total_inflight = state.total_inflight.saturating_sub(1);
        state.wake_waiters();
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        let mut available_accounts = Vec::new();
        let mut in_use_accounts = Vec::new();
        for e in &state.entries {
            if e.inflight > 0 {
                in_use_accounts.push(e.identifier.clone());
            }
            if e.inflight < state.max_inflight
                && (state.global_max == 0 || state.total_inflight < state.global_max)
            {
                available_accounts.push(e.identifier.clone());
            }
        }
        let mut recommended = state.entries.len() * state.max_inflight;
        if state.global_max > 0 {
            recommended = recommended.min(state.global_max);
        }
        PoolStatus {
            total: state.entries.len(),
            available: available_accounts.len(),
            in_use: state.total_inflight,
            waiting: state.waiters.len(),
            max_inflight_per_account: state.max_inflight,
            recommended_concurrency: recommended,
            max_queue_size: state.max_queue,
            global_max_inflight: state.global_max,
            available_accounts,
            in_use_accounts,
        }
    }

    /// 热更新运行时上限。降低上限不会驱逐在途请求，只影响后续准入。
    pub fn apply_runtime_limits(&self, limits: RuntimeLimits) {
        let mut state = self.lock();
        state.max_inflight = limits.effective_max_inflight();
        state.max_queue = limits.effective_max_queue();
        state.global_max = limits.effective_global_max();
        state.wake_waiters();
    }

    /// 按最新配置重建（管理端增删账号后调用）。在途计数清零。
    pub fn reset(&self, store: &Store) {
        let snapshot = store.snapshot();
        let limits = store.runtime_limits();
        let mut state = self.lock();
        state.entries = build_entries(snapshot.accounts.clone());
        state.total_inflight = 0;
        state.max_inflight = limits.effective_max_inflight();
        state.max_queue = limits.effective_max_queue();
        state.global_max = limits.effective_global_max();

        // 指定了已不存在 target 的等待者永远无法满足，直接判失败。
        let valid: HashSet<String> =
            state.entries.iter().map(|e| e.identifier.clone()).collect();
        state
            .waiters
            .retain(|w| w.target.is_empty() || valid.contains(&w.target));
        state.wake_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PoolState {
    /// 在锁内尝试准入：选 inflight 最低者，相同按配置顺序。
    fn try_admit(&mut self, target: &str, exclude: &HashSet<String>) -> Option<Account> {
        if self.global_max > 0 && self.total_inflight >= self.global_max {
            return None;
        }
        let target = target.trim();

        let mut best: Option<usize> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if !target.is_empty() && e.identifier != target {
                continue;
            }
            if target.is_empty() && exclude.contains(&e.identifier) {
                continue;
            }
            if e.inflight >= self.max_inflight {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(j) if self.entries[i].inflight < self.entries[j].inflight => best = Some(i),
                _ => {}
            }
        }

        let idx = best?;
        self.entries[idx].inflight += 1;
        self.total_inflight += 1;
        Some(self.entries[idx].account.clone())
    }

    /// 按 FIFO 顺序唤醒：无法满足的等待者原位保留，继续尝试后面的。
    fn wake_waiters(&mut self) {
        let mut i = 0;
        while i < self.waiters.len() {
            if self.global_max > 0 && self.total_inflight >= self.global_max {
                return;
            }
            let (target, exclude) = {
                let w = &self.waiters[i];
                (w.target.clone(), w.exclude.clone())
            };
            match self.try_admit(&target, &exclude) {
                Some(acc) => {
                    let Some(w) = self.waiters.remove(i) else {
                        return;
                    };
                    if let Err(acc) = w.tx.send(acc) {
                        // 等待者已取消：把占到的位还回去，继续唤醒下一个。
                        self.undo_admit(&acc);
                    }
                }
                None => i += 1,
            }
        }
    }

    fn undo_admit(&mut self, account: &Account) {
        let id = account.identifier();
        if let Some(e) = self.entries.iter_mut().find(|e| e.identifier == id)
            && e.inflight > 0
        {
            e.inflight -= 1;
            self.total_inflight = self.total_inflight.saturating_sub(1);
        }
    }

    fn remove_waiter(&mut self, waiter_id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != waiter_id);
        self.waiters.len() != before
    }
}

fn build_entries(accounts: Vec<Account>) -> Vec<Entry> {
    let mut entries: Vec<Entry> = Vec::with_capacity(accounts.len());
    for acc in accounts {
        let identifier = acc.identifier();
        if identifier.is_empty() {
            continue;
        }
        if entries.iter().any(|e| e.identifier == identifier) {
            continue;
        }
        entries.push(Entry {
            identifier,
            account: acc,
            inflight: 0,
        });
    }
    entries
}
