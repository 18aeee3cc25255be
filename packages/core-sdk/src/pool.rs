use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::Serialize;

use crate::{
    config::{ConfigSource, ACTIVE_PROVIDER_KEY},
    error::AiError,
    llm::{require_credential, ChatClient, ClientFactory},
    models::ProviderId,
    registry::{ProviderDescriptor, ProviderRegistry, ProviderSettings},
    telemetry,
};

/**
 * \brief 一次请求开始时取得的当前模型服务快照，请求期间不再重新读取。
 */
#[derive(Clone)]
pub struct ActiveProvider {
    pub settings: ProviderSettings,
    pub client: Option<Arc<dyn ChatClient>>,
}

impl ActiveProvider {
    pub fn id(&self) -> ProviderId {
        self.settings.id
    }

    pub fn is_available(&self) -> bool {
        self.settings.id != ProviderId::Disabled && self.client.is_some()
    }
}

/**
 * \brief 切换结果。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchOutcome {
    pub old_provider_id: ProviderId,
    pub new_provider_id: ProviderId,
    pub available: bool,
}

/**
 * \brief 当前模型服务状态，对外展示用。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub provider_id: ProviderId,
    pub available: bool,
    pub model: String,
    pub endpoint: String,
}

struct CachedClient {
    settings: ProviderSettings,
    client: Arc<dyn ChatClient>,
}

struct PoolState {
    current: ProviderSettings,
    current_client: Option<Arc<dyn ChatClient>>,
    clients: HashMap<ProviderId, CachedClient>,
}

/**
 * \brief 模型服务客户端池：同一时刻只有一个当前模型服务，切换要么完整成功要么不生效。
 */
pub struct ProviderPool {
    registry: ProviderRegistry,
    factory: Arc<dyn ClientFactory>,
    state: RwLock<PoolState>,
    switch_lock: Mutex<()>,
}

impl ProviderPool {
    /**
     * \brief 创建客户端池，初始为 `disabled`。
     */
    pub fn new(registry: ProviderRegistry, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            registry,
            factory,
            state: RwLock::new(PoolState {
                current: ProviderSettings::disabled(),
                current_client: None,
                clients: HashMap::new(),
            }),
            switch_lock: Mutex::new(()),
        }
    }

    /**
     * \brief 按 `AI_PROVIDER` 选择初始模型服务；失败时保持 `disabled` 并记录原因。
     */
    pub fn from_config(config: Arc<dyn ConfigSource>, factory: Arc<dyn ClientFactory>) -> Self {
        let initial = config.get_non_blank(ACTIVE_PROVIDER_KEY);
        let pool = Self::new(ProviderRegistry::new(config), factory);
        if let Some(initial) = initial {
            if let Err(e) = pool.switch_to(&initial) {
                telemetry::log_error(
                    "ai.pool",
                    &format!("initial provider {} unavailable, staying disabled: {}", initial, e),
                );
            }
        }
        pool
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /**
     * \brief 切换当前模型服务。
     * \details 先校验标识，再构建客户端，全部成功后才提交；任一步失败都保持原状态。
     */
    pub fn switch_to(&self, provider_id: &str) -> Result<SwitchOutcome, AiError> {
        let id: ProviderId = provider_id.parse()?;
        let _serial = self.switch_lock.lock().unwrap_or_else(|e| e.into_inner());

        let settings = self.registry.resolve(id);
        let client = match self.obtain_client(&settings) {
            Ok(client) => client,
            Err(e) => {
                telemetry::log_error(
                    "ai.pool",
                    &format!("switch to {} rejected: {}", id, e),
                );
                return Err(e);
            }
        };

        let mut state = self.write_state();
        let old = state.current.id;
        if let Some(c) = &client {
            state.clients.insert(
                id,
                CachedClient {
                    settings: settings.clone(),
                    client: Arc::clone(c),
                },
            );
        }
        let available = id != ProviderId::Disabled && client.is_some();
        state.current = settings;
        state.current_client = client;
        drop(state);

        telemetry::log_event(
            "ai.pool",
            &format!("switch {} -> {} available={}", old, id, available),
        );
        Ok(SwitchOutcome {
            old_provider_id: old,
            new_provider_id: id,
            available,
        })
    }

    /** \brief 复用配置未变化的客户端，否则重新构建。 */
    fn obtain_client(
        &self,
        settings: &ProviderSettings,
    ) -> Result<Option<Arc<dyn ChatClient>>, AiError> {
        if settings.id == ProviderId::Disabled {
            return Ok(None);
        }
        require_credential(settings)?;
        {
            let state = self.read_state();
            if let Some(cached) = state.clients.get(&settings.id) {
                if cached.settings == *settings {
                    return Ok(Some(Arc::clone(&cached.client)));
                }
            }
        }
        self.factory.build(settings)
    }

    /**
     * \brief 当前模型服务快照，供单次请求使用。
     */
    pub fn active(&self) -> ActiveProvider {
        let state = self.read_state();
        ActiveProvider {
            settings: state.current.clone(),
            client: state.current_client.clone(),
        }
    }

    pub fn current_id(&self) -> ProviderId {
        self.read_state().current.id
    }

    /**
     * \brief 当前模型服务的实际参数（配置覆盖项已合并）。
     */
    pub fn current_descriptor(&self) -> ProviderSettings {
        self.read_state().current.clone()
    }

    pub fn is_available(&self) -> bool {
        self.active().is_available()
    }

    pub fn current_status(&self) -> ProviderStatus {
        let active = self.active();
        ProviderStatus {
            provider_id: active.id(),
            available: active.is_available(),
            model: active.settings.model.clone(),
            endpoint: active.settings.endpoint.clone(),
        }
    }

    pub fn list_providers(&self) -> BTreeMap<ProviderId, ProviderDescriptor> {
        self.registry.describe_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::llm::{ChatCompletion, ChatRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoClient;

    #[async_trait]
    impl ChatClient for EchoClient {
        async fn chat_complete(&self, _request: &ChatRequest) -> Result<ChatCompletion, AiError> {
            Ok(ChatCompletion::from_text("echo"))
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
        fail_for: Option<ProviderId>,
    }

    impl ClientFactory for CountingFactory {
        fn build(
            &self,
            settings: &ProviderSettings,
        ) -> Result<Option<Arc<dyn ChatClient>>, AiError> {
            if Some(settings.id) == self.fail_for {
                return Err(AiError::ClientBuild("boom".to_string()));
            }
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Arc::new(EchoClient)))
        }
    }

    fn pool_with(config: Arc<MapConfig>, factory: Arc<CountingFactory>) -> ProviderPool {
        ProviderPool::new(ProviderRegistry::new(config), factory)
    }

    #[test]
    fn test_starts_disabled() {
        let pool = pool_with(Arc::new(MapConfig::new()), Arc::new(CountingFactory::default()));
        assert_eq!(pool.current_id(), ProviderId::Disabled);
        assert!(!pool.is_available());
        let status = pool.current_status();
        assert_eq!(status.provider_id, ProviderId::Disabled);
        assert!(!status.available);
    }

    #[test]
    fn test_switch_each_known_provider() {
        let config = Arc::new(MapConfig::new());
        for id in ProviderId::ALL {
            if let Some(key) = crate::config::credential_keys(id).first() {
                config.set(key, "sk-test");
            }
        }
        let pool = pool_with(config, Arc::new(CountingFactory::default()));
        for id in ProviderId::ALL {
            let outcome = pool.switch_to(id.as_str()).expect("switch");
            assert_eq!(outcome.new_provider_id, id);
            assert_eq!(outcome.available, id != ProviderId::Disabled);
            assert_eq!(pool.current_id(), id);
            assert_eq!(pool.is_available(), id != ProviderId::Disabled);
        }
    }

    #[test]
    fn test_unknown_provider_leaves_state() {
        let pool = pool_with(Arc::new(MapConfig::new()), Arc::new(CountingFactory::default()));
        pool.switch_to("lmstudio").expect("switch lmstudio");
        let err = pool.switch_to("gemini").unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_PROVIDER");
        assert_eq!(pool.current_id(), ProviderId::LmStudio);
    }

    #[test]
    fn test_missing_credential_rolls_back() {
        let pool = pool_with(Arc::new(MapConfig::new()), Arc::new(CountingFactory::default()));
        pool.switch_to("lmstudio").expect("switch lmstudio");
        let err = pool.switch_to("openai").unwrap_err();
        assert!(matches!(err, AiError::MissingCredential { ref env_key, .. } if env_key == "OPENAI_API_KEY"));
        assert_eq!(pool.current_id(), ProviderId::LmStudio);
        assert!(pool.is_available());
    }

    #[test]
    fn test_client_build_failure_rolls_back() {
        let config = Arc::new(MapConfig::new().with("ZHIPU_API_KEY", "k"));
        let factory = Arc::new(CountingFactory {
            fail_for: Some(ProviderId::Zhipu),
            ..CountingFactory::default()
        });
        let pool = pool_with(config, factory);
        assert!(pool.switch_to("zhipu").is_err());
        assert_eq!(pool.current_id(), ProviderId::Disabled);
    }

    #[test]
    fn test_clients_are_cached_until_config_changes() {
        let config = Arc::new(MapConfig::new().with("DEEPSEEK_API_KEY", "k1"));
        let factory = Arc::new(CountingFactory::default());
        let pool = pool_with(Arc::clone(&config), Arc::clone(&factory));
        pool.switch_to("deepseek").expect("first");
        pool.switch_to("disabled").expect("disable");
        pool.switch_to("deepseek").expect("second");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

        config.set("DEEPSEEK_MODEL", "deepseek-reasoner");
        pool.switch_to("deepseek").expect("third");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(pool.current_descriptor().model, "deepseek-reasoner");
    }

    #[test]
    fn test_switch_rereads_credentials() {
        let config = Arc::new(MapConfig::new());
        let pool = pool_with(Arc::clone(&config), Arc::new(CountingFactory::default()));
        assert!(pool.switch_to("moonshot").is_err());
        config.set("MOONSHOT_API_KEY", "sk-late");
        let outcome = pool.switch_to("moonshot").expect("switch after key set");
        assert_eq!(outcome.old_provider_id, ProviderId::Disabled);
        assert!(outcome.available);
    }

    #[test]
    fn test_from_config_falls_back_to_disabled() {
        let config = Arc::new(MapConfig::new().with(ACTIVE_PROVIDER_KEY, "claude"));
        let pool = ProviderPool::from_config(config, Arc::new(CountingFactory::default()));
        assert_eq!(pool.current_id(), ProviderId::Disabled);

        let config = Arc::new(
            MapConfig::new()
                .with(ACTIVE_PROVIDER_KEY, "claude")
                .with("CLAUDE_API_KEY", "sk-ant"),
        );
        let pool = ProviderPool::from_config(config, Arc::new(CountingFactory::default()));
        assert_eq!(pool.current_id(), ProviderId::Claude);
    }

    #[test]
    fn test_active_snapshot_is_stable_across_switch() {
        let pool = pool_with(Arc::new(MapConfig::new()), Arc::new(CountingFactory::default()));
        pool.switch_to("lmstudio").expect("switch");
        let snapshot = pool.active();
        pool.switch_to("disabled").expect("disable");
        assert_eq!(snapshot.id(), ProviderId::LmStudio);
        assert!(snapshot.is_available());
        assert!(!pool.is_available());
    }
}
