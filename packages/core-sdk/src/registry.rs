use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;

use crate::{
    config::{credential_keys, read_overrides, ConfigSource},
    error::AiError,
    models::ProviderId,
};

/**
 * \brief 各模型服务的内置默认值。
 */
struct ProviderDefaults {
    id: ProviderId,
    display_name: &'static str,
    model: &'static str,
    endpoint: &'static str,
    max_tokens: u32,
    temperature: f32,
}

const DEFAULTS: [ProviderDefaults; 7] = [
    ProviderDefaults {
        id: ProviderId::OpenAI,
        display_name: "OpenAI",
        model: "gpt-3.5-turbo",
        endpoint: "https://api.openai.com/v1",
        max_tokens: 2000,
        temperature: 0.7,
    },
    ProviderDefaults {
        id: ProviderId::Zhipu,
        display_name: "智谱 GLM",
        model: "glm-4",
        endpoint: "https://open.bigmodel.cn/api/paas/v4",
        max_tokens: 2000,
        temperature: 0.7,
    },
    ProviderDefaults {
        id: ProviderId::Moonshot,
        display_name: "Moonshot Kimi",
        model: "moonshot-v1-8k",
        endpoint: "https://api.moonshot.cn/v1",
        max_tokens: 2000,
        temperature: 0.7,
    },
    ProviderDefaults {
        id: ProviderId::DeepSeek,
        display_name: "DeepSeek",
        model: "deepseek-chat",
        endpoint: "https://api.deepseek.com/v1",
        max_tokens: 2000,
        temperature: 0.7,
    },
    ProviderDefaults {
        id: ProviderId::Claude,
        display_name: "Claude",
        model: "claude-3-haiku-20240307",
        endpoint: "https://api.anthropic.com",
        max_tokens: 2000,
        temperature: 0.7,
    },
    ProviderDefaults {
        id: ProviderId::LmStudio,
        display_name: "LM Studio",
        model: "local-model",
        endpoint: "http://localhost:1234/v1",
        max_tokens: 2000,
        temperature: 0.7,
    },
    ProviderDefaults {
        id: ProviderId::Disabled,
        display_name: "本地分析",
        model: "none",
        endpoint: "",
        max_tokens: 0,
        temperature: 0.0,
    },
];

fn defaults_for(id: ProviderId) -> &'static ProviderDefaults {
    // DEFAULTS 与 ProviderId::ALL 一一对应
    &DEFAULTS[ProviderId::ALL
        .iter()
        .position(|candidate| *candidate == id)
        .unwrap_or(DEFAULTS.len() - 1)]
}

/**
 * \brief 模型服务描述，对外展示用，不含密钥。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub display_name: String,
    /** \brief 密钥配置项名称，无需密钥时为空。 */
    pub credential_key: Option<String>,
    pub required_credential_present: bool,
    /** \brief 是否可以切换过去：无需密钥，或密钥已配置。 */
    pub configured: bool,
    pub default_model: String,
    pub default_endpoint: String,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
}

/**
 * \brief 合并配置覆盖项后的实际调用参数。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub id: ProviderId,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ProviderSettings {
    /** \brief `disabled` 的固定参数，不读取任何配置。 */
    pub fn disabled() -> Self {
        let d = defaults_for(ProviderId::Disabled);
        Self {
            id: ProviderId::Disabled,
            api_key: None,
            endpoint: d.endpoint.to_string(),
            model: d.model.to_string(),
            max_tokens: d.max_tokens,
            temperature: d.temperature,
        }
    }
}

/**
 * \brief 模型服务注册表：静态默认值 + 实时配置。
 */
#[derive(Clone)]
pub struct ProviderRegistry {
    config: Arc<dyn ConfigSource>,
}

impl ProviderRegistry {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<dyn ConfigSource> {
        &self.config
    }

    /**
     * \brief 列出全部模型服务及其是否已配置。
     */
    pub fn describe_all(&self) -> BTreeMap<ProviderId, ProviderDescriptor> {
        ProviderId::ALL
            .into_iter()
            .map(|id| (id, self.descriptor_for(id)))
            .collect()
    }

    /**
     * \brief 描述单个模型服务，未知标识返回 `UnknownProvider`。
     */
    pub fn describe(&self, provider_id: &str) -> Result<ProviderDescriptor, AiError> {
        let id: ProviderId = provider_id.parse()?;
        Ok(self.descriptor_for(id))
    }

    pub fn descriptor_for(&self, id: ProviderId) -> ProviderDescriptor {
        let d = defaults_for(id);
        let present = read_overrides(self.config.as_ref(), id).api_key.is_some();
        ProviderDescriptor {
            id,
            display_name: d.display_name.to_string(),
            credential_key: credential_keys(id).into_iter().next(),
            required_credential_present: present,
            configured: !id.requires_credential() || present,
            default_model: d.model.to_string(),
            default_endpoint: d.endpoint.to_string(),
            default_max_tokens: d.max_tokens,
            default_temperature: d.temperature,
        }
    }

    /**
     * \brief 将配置覆盖项合并到默认值上。
     */
    pub fn resolve(&self, id: ProviderId) -> ProviderSettings {
        if id == ProviderId::Disabled {
            return ProviderSettings::disabled();
        }
        let d = defaults_for(id);
        let overrides = read_overrides(self.config.as_ref(), id);
        ProviderSettings {
            id,
            api_key: overrides.api_key,
            endpoint: overrides
                .endpoint
                .map(|e| e.trim_end_matches('/').to_string())
                .unwrap_or_else(|| d.endpoint.to_string()),
            model: overrides.model.unwrap_or_else(|| d.model.to_string()),
            max_tokens: overrides.max_tokens.unwrap_or(d.max_tokens),
            temperature: overrides.temperature.unwrap_or(d.temperature),
        }
    }
}
