pub mod claude;
pub mod frame;
pub mod openai;
pub mod standard;

use crate::account::Pool;
use crate::auth::Resolver;
use crate::config::Store;
use crate::deepseek::DeepSeekClient;
use crate::gateway::openai::store::ResponseStore;
use std::sync::Arc;

/// 三个 surface 共享的转发状态。
pub struct GatewayState {
    pub store: Arc<Store>,
    pub pool: Arc<Pool>,
    pub auth: Arc<Resolver>,
    pub client: DeepSeekClient,
    pub responses: Arc<ResponseStore>,
}

/// 上游重试次数：以账号数为准（至少一次）。
pub fn attempts_for(state: &GatewayState) -> usize {
    state.store.snapshot().accounts.len().max(1)
}
