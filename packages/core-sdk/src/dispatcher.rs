use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use crate::{
    error::AiError,
    fallback,
    history::ConversationStore,
    llm::{ChatClient, ChatRequest},
    models::{ConversationEntry, MarketSnapshot, ProviderId},
    pool::{ProviderPool, ProviderStatus, SwitchOutcome},
    prompt::{self, Clock, SystemClock},
    registry::{ProviderDescriptor, ProviderSettings},
    telemetry,
};

/** \brief 远程调用超时时间。 */
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/**
 * \brief 一轮分析的结果。
 * \details `provider_id_used` 是本轮尝试的模型服务，即使降级到本地分析也不变；
 *          `degraded` 标记文本是否来自本地分析。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub text: String,
    pub provider_id_used: ProviderId,
    pub degraded: bool,
    pub entry_id: u64,
    pub timestamp: String,
}

/**
 * \brief 分析分发器：调用当前模型服务，失败、超时或未启用时降级到本地分析，并记录会话。
 */
pub struct Dispatcher {
    pool: Arc<ProviderPool>,
    store: Arc<ConversationStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(pool: Arc<ProviderPool>, store: Arc<ConversationStore>) -> Self {
        Self {
            pool,
            store,
            clock: Arc::new(SystemClock::default()),
            timeout: REMOTE_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /**
     * \brief 处理一轮对话。
     * \details 只有空消息会返回错误；远程调用的任何失败都降级为本地分析。
     */
    pub async fn analyze(
        &self,
        user_message: &str,
        snapshot: Option<&MarketSnapshot>,
    ) -> Result<AnalysisOutcome, AiError> {
        if user_message.trim().is_empty() {
            return Err(AiError::EmptyUserMessage);
        }

        let active = self.pool.active();
        let provider_id = active.id();
        let now = self.clock.now();

        let remote = match &active.client {
            Some(client) if active.is_available() => {
                let system_prompt = prompt::build_system_prompt(snapshot, now);
                match self
                    .call_remote(client.as_ref(), &active.settings, &system_prompt, user_message)
                    .await
                {
                    Ok(text) => Some(text),
                    Err(e) => {
                        telemetry::log_error(
                            "ai.dispatch",
                            &format!(
                                "provider={} model={} code={} falling back: {}",
                                provider_id,
                                active.settings.model,
                                e.code(),
                                e
                            ),
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let degraded = remote.is_none();
        let text = remote.unwrap_or_else(|| fallback::analyze_locally(user_message, snapshot));

        let timestamp = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        let entry = ConversationEntry {
            id: self.store.next_id(),
            timestamp: timestamp.clone(),
            user_message: user_message.to_string(),
            ai_response: text.clone(),
            provider_id_used: provider_id,
            snapshot_ref: snapshot.map(MarketSnapshot::snapshot_ref),
        };
        let entry_id = entry.id;
        self.store.append(entry);

        telemetry::log_event(
            "ai.dispatch",
            &format!(
                "entry={} provider={} degraded={} message_len={}",
                entry_id,
                provider_id,
                degraded,
                user_message.chars().count()
            ),
        );

        Ok(AnalysisOutcome {
            text,
            provider_id_used: provider_id,
            degraded,
            entry_id,
            timestamp,
        })
    }

    /**
     * \brief 远程调用与超时竞争；超时后调用 future 被丢弃，连接随之释放。
     */
    async fn call_remote(
        &self,
        client: &dyn ChatClient,
        settings: &ProviderSettings,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, AiError> {
        let request = ChatRequest::new(settings, system_prompt, user_message);
        let completion = tokio::time::timeout(self.timeout, client.chat_complete(&request))
            .await
            .map_err(|_| AiError::RemoteCallTimeout(self.timeout.as_secs()))??;
        completion
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| AiError::remote("响应中没有有效的回复内容"))
    }

    pub fn switch_to(&self, provider_id: &str) -> Result<SwitchOutcome, AiError> {
        self.pool.switch_to(provider_id)
    }

    pub fn current_status(&self) -> ProviderStatus {
        self.pool.current_status()
    }

    pub fn list_providers(&self) -> BTreeMap<ProviderId, ProviderDescriptor> {
        self.pool.list_providers()
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<ConversationEntry> {
        self.store.list(limit)
    }

    pub fn clear_history(&self) {
        self.store.clear();
        telemetry::log_event("ai.history", "history cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MapConfig,
        llm::{ChatCompletion, ClientFactory},
        models::{DailyBar, PeriodSummary},
        prompt::FixedClock,
        registry::ProviderRegistry,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    enum Behavior {
        Reply(ChatCompletion),
        Fail,
        Hang,
    }

    struct StubClient {
        behavior: Behavior,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatClient for StubClient {
        async fn chat_complete(&self, request: &ChatRequest) -> Result<ChatCompletion, AiError> {
            self.seen
                .lock()
                .expect("lock seen requests")
                .push(request.clone());
            match &self.behavior {
                Behavior::Reply(c) => Ok(c.clone()),
                Behavior::Fail => Err(AiError::remote("503 service unavailable")),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    struct StubFactory(Arc<StubClient>);

    impl ClientFactory for StubFactory {
        fn build(
            &self,
            _settings: &ProviderSettings,
        ) -> Result<Option<Arc<dyn ChatClient>>, AiError> {
            let client: Arc<dyn ChatClient> = self.0.clone();
            Ok(Some(client))
        }
    }

    fn setup(behavior: Behavior, provider: &str) -> (Dispatcher, Arc<StubClient>) {
        let client = Arc::new(StubClient {
            behavior,
            seen: Mutex::new(Vec::new()),
        });
        let config = Arc::new(MapConfig::new().with("OPENAI_API_KEY", "sk-test"));
        let pool = ProviderPool::new(
            ProviderRegistry::new(config),
            Arc::new(StubFactory(Arc::clone(&client))),
        );
        pool.switch_to(provider).expect("switch provider");
        let dispatcher = Dispatcher::new(Arc::new(pool), Arc::new(ConversationStore::new()))
            .with_clock(Arc::new(FixedClock(datetime!(2024-05-06 09:30 UTC))));
        (dispatcher, client)
    }

    fn snapshot(change: f64) -> MarketSnapshot {
        MarketSnapshot {
            code: Some("000001.SH".to_string()),
            name: Some("上证指数".to_string()),
            current_price: Some(3100.0),
            data: vec![DailyBar {
                date: "2024-05-06".to_string(),
                open: 3090.0,
                close: 3100.0,
                high: 3120.0,
                low: 3080.0,
                volume: 5000.0,
            }],
            summary: Some(PeriodSummary {
                change_percent: Some(change),
                max_price: Some(3200.0),
                min_price: Some(2900.0),
                avg_volume: Some(4000.0),
            }),
            period_range: None,
        }
    }

    #[tokio::test]
    async fn test_remote_success_is_logged() {
        let (dispatcher, client) =
            setup(Behavior::Reply(ChatCompletion::from_text("模型回答")), "openai");
        let snap = snapshot(2.0);
        let outcome = dispatcher
            .analyze("分析一下", Some(&snap))
            .await
            .expect("analyze");
        assert_eq!(outcome.text, "模型回答");
        assert_eq!(outcome.provider_id_used, ProviderId::OpenAI);
        assert!(!outcome.degraded);
        assert_eq!(outcome.timestamp, "2024-05-06T09:30:00Z");

        let seen = client.seen.lock().expect("lock").clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model, "gpt-3.5-turbo");
        assert!(seen[0].messages[0].content.contains("当前日期：2024年05月06日"));
        assert!(seen[0].messages[0].content.contains("上证指数"));
        assert_eq!(seen[0].messages[1].content, "分析一下");

        let history = dispatcher.history(Some(1));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].ai_response, "模型回答");
        assert_eq!(
            history[0].snapshot_ref.as_ref().map(|r| r.code.as_str()),
            Some("000001.SH")
        );
    }

    #[tokio::test]
    async fn test_empty_choices_falls_back() {
        let (dispatcher, _client) = setup(Behavior::Reply(ChatCompletion::default()), "openai");
        let snap = snapshot(15.0);
        let outcome = dispatcher
            .analyze("趋势如何", Some(&snap))
            .await
            .expect("analyze");
        assert!(outcome.degraded);
        assert_eq!(outcome.provider_id_used, ProviderId::OpenAI);
        assert!(outcome.text.contains("**强势上涨**"));
        let history = dispatcher.history(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].provider_id_used, ProviderId::OpenAI);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back() {
        let (dispatcher, _client) = setup(Behavior::Fail, "lmstudio");
        let outcome = dispatcher.analyze("你好", None).await.expect("analyze");
        assert!(outcome.degraded);
        assert_eq!(outcome.text, fallback::NO_SNAPSHOT_REPLY);
        assert_eq!(outcome.provider_id_used, ProviderId::LmStudio);
    }

    #[tokio::test]
    async fn test_disabled_never_calls_remote() {
        let (dispatcher, client) =
            setup(Behavior::Reply(ChatCompletion::from_text("x")), "disabled");
        let outcome = dispatcher.analyze("你好", None).await.expect("analyze");
        assert!(outcome.degraded);
        assert_eq!(outcome.provider_id_used, ProviderId::Disabled);
        assert!(client.seen.lock().expect("lock").is_empty());
        let history = dispatcher.history(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].snapshot_ref, None);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_without_side_effects() {
        let (dispatcher, client) =
            setup(Behavior::Reply(ChatCompletion::from_text("x")), "openai");
        let err = dispatcher.analyze("   \n", None).await.unwrap_err();
        assert_eq!(err, AiError::EmptyUserMessage);
        assert!(client.seen.lock().expect("lock").is_empty());
        assert!(dispatcher.history(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_remote_times_out_once() {
        let (dispatcher, _client) = setup(Behavior::Hang, "openai");
        let started = tokio::time::Instant::now();
        let outcome = dispatcher.analyze("风险", None).await.expect("analyze");
        let elapsed = started.elapsed();
        assert!(elapsed >= REMOTE_TIMEOUT);
        assert!(elapsed < REMOTE_TIMEOUT + Duration::from_secs(1));
        assert!(outcome.degraded);
        assert_eq!(dispatcher.history(Some(10)).len(), 1);
    }

    #[tokio::test]
    async fn test_facade_passthroughs() {
        let (dispatcher, _client) =
            setup(Behavior::Reply(ChatCompletion::from_text("x")), "openai");
        assert_eq!(dispatcher.current_status().provider_id, ProviderId::OpenAI);
        assert_eq!(dispatcher.list_providers().len(), 7);
        let outcome = dispatcher.switch_to("disabled").expect("disable");
        assert_eq!(outcome.old_provider_id, ProviderId::OpenAI);
        assert!(!outcome.available);
        dispatcher.analyze("hi", None).await.expect("analyze");
        dispatcher.clear_history();
        assert!(dispatcher.history(None).is_empty());
    }
}
