use std::{collections::HashMap, sync::RwLock};

use crate::models::ProviderId;

/** \brief 启动时选择模型服务的配置项。 */
pub const ACTIVE_PROVIDER_KEY: &str = "AI_PROVIDER";
/** \brief 遥测开关配置项，值为 1/true 时开启。 */
pub const TELEMETRY_KEY: &str = "FINCHAT_TELEMETRY";
/** \brief 本地时区偏移配置项，如 `+08:00` 或 `8`。 */
pub const UTC_OFFSET_KEY: &str = "FINCHAT_UTC_OFFSET";

/**
 * \brief 配置来源抽象，每次查询都实时读取，便于切换时感知最新配置。
 */
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /** \brief 读取并去除首尾空白，空值视为未配置。 */
    fn get_non_blank(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/**
 * \brief 进程环境变量配置。
 */
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/**
 * \brief 内存配置，测试与嵌入场景使用，可在运行期修改。
 */
#[derive(Debug, Default)]
pub struct MapConfig {
    values: RwLock<HashMap<String, String>>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: &str) {
        let mut guard = self.values.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, key: &str) {
        let mut guard = self.values.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(key);
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.values.read().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }
}

/**
 * \brief 单个模型服务的配置覆盖项，全部可选。
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOverrides {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/** \brief 密钥配置项名称；`claude` 同时接受 `ANTHROPIC_API_KEY`。 */
pub fn credential_keys(id: ProviderId) -> Vec<String> {
    match (id.requires_credential(), id.config_prefix()) {
        (true, Some(prefix)) => {
            let mut keys = vec![format!("{}_API_KEY", prefix)];
            if id == ProviderId::Claude {
                keys.push("ANTHROPIC_API_KEY".to_string());
            }
            keys
        }
        _ => Vec::new(),
    }
}

/**
 * \brief 读取某个模型服务的覆盖项；无法解析的数值被忽略。
 */
pub fn read_overrides(config: &dyn ConfigSource, id: ProviderId) -> ProviderOverrides {
    let Some(prefix) = id.config_prefix() else {
        return ProviderOverrides::default();
    };
    let key = |suffix: &str| format!("{}_{}", prefix, suffix);
    ProviderOverrides {
        api_key: credential_keys(id)
            .iter()
            .find_map(|k| config.get_non_blank(k)),
        endpoint: config.get_non_blank(&key("BASE_URL")),
        model: config.get_non_blank(&key("MODEL")),
        max_tokens: config
            .get_non_blank(&key("MAX_TOKENS"))
            .and_then(|v| v.parse::<u32>().ok()),
        temperature: config
            .get_non_blank(&key("TEMPERATURE"))
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|t| t.is_finite()),
    }
}

/** \brief 解析布尔开关：1/true/yes/on。 */
pub fn flag_enabled(config: &dyn ConfigSource, key: &str) -> bool {
    config
        .get_non_blank(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_overrides_ignores_blank_and_invalid() {
        let config = MapConfig::new()
            .with("OPENAI_API_KEY", "  ")
            .with("OPENAI_MODEL", "gpt-4o-mini")
            .with("OPENAI_MAX_TOKENS", "lots")
            .with("OPENAI_TEMPERATURE", "0.2");
        let overrides = read_overrides(&config, ProviderId::OpenAI);
        assert_eq!(overrides.api_key, None);
        assert_eq!(overrides.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(overrides.max_tokens, None);
        assert_eq!(overrides.temperature, Some(0.2));
    }

    #[test]
    fn test_claude_accepts_anthropic_key() {
        let config = MapConfig::new().with("ANTHROPIC_API_KEY", "sk-ant");
        let overrides = read_overrides(&config, ProviderId::Claude);
        assert_eq!(overrides.api_key.as_deref(), Some("sk-ant"));
    }

    #[test]
    fn test_disabled_has_no_overrides() {
        let config = MapConfig::new().with("DISABLED_MODEL", "x");
        assert_eq!(
            read_overrides(&config, ProviderId::Disabled),
            ProviderOverrides::default()
        );
        assert!(credential_keys(ProviderId::LmStudio).is_empty());
    }

    #[test]
    fn test_flag_enabled() {
        let config = MapConfig::new().with(TELEMETRY_KEY, "TRUE");
        assert!(flag_enabled(&config, TELEMETRY_KEY));
        config.set(TELEMETRY_KEY, "0");
        assert!(!flag_enabled(&config, TELEMETRY_KEY));
        config.remove(TELEMETRY_KEY);
        assert!(!flag_enabled(&config, TELEMETRY_KEY));
    }
}
