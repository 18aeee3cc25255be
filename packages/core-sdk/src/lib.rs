pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod history;
pub mod llm;
pub mod models;
pub mod pool;
pub mod prompt;
pub mod registry;
pub mod server;
pub mod telemetry;

use std::sync::Arc;

use crate::{
    config::ConfigSource, dispatcher::Dispatcher, history::ConversationStore,
    llm::HttpClientFactory, pool::ProviderPool, prompt::SystemClock,
};

/**
 * \brief 按配置组装生产环境的分发器：HTTP 客户端工厂 + 空会话记录 + 系统时钟。
 * \param clock 需在异步运行时启动前用 [`SystemClock::from_config`] 构造
 */
pub fn build_dispatcher(config: Arc<dyn ConfigSource>, clock: SystemClock) -> Dispatcher {
    let pool = ProviderPool::from_config(config, Arc::new(HttpClientFactory));
    Dispatcher::new(Arc::new(pool), Arc::new(ConversationStore::new())).with_clock(Arc::new(clock))
}

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{ConfigSource, EnvConfig, MapConfig};
    pub use crate::dispatcher::{AnalysisOutcome, Dispatcher};
    pub use crate::error::AiError;
    pub use crate::history::ConversationStore;
    pub use crate::models::{ConversationEntry, MarketSnapshot, ProviderId};
    pub use crate::pool::ProviderPool;
    pub use crate::{fallback, llm, prompt, registry, server, telemetry};
}
