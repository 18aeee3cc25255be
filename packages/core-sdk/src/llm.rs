use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    config::credential_keys,
    error::AiError,
    models::{Message, ProviderId},
    registry::ProviderSettings,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/**
 * \brief 统一的聊天补全请求：`{model, messages, max_tokens, temperature}`。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(settings: &ProviderSettings, system_prompt: &str, user_message: &str) -> Self {
        Self {
            model: settings.model.clone(),
            messages: vec![Message::system(system_prompt), Message::user(user_message)],
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }
}

/**
 * \brief 统一的聊天补全响应：`{choices:[{message:{content}}]}`。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletion {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ChoiceMessage {
                    content: Some(text.into()),
                },
            }],
        }
    }

    /** \brief 第一个选项的非空内容；没有选项或内容为空时返回 `None`。 */
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|c| !c.trim().is_empty())
    }
}

/**
 * \brief 模型服务客户端能力。
 */
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat_complete(&self, request: &ChatRequest) -> Result<ChatCompletion, AiError>;
}

/**
 * \brief 根据模型服务标识构建客户端。
 */
pub trait ClientFactory: Send + Sync {
    /**
     * \brief 构建客户端；`disabled` 返回 `Ok(None)`。
     */
    fn build(&self, settings: &ProviderSettings) -> Result<Option<Arc<dyn ChatClient>>, AiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireProtocol {
    OpenAICompatible { bearer: bool },
    Anthropic,
    None,
}

/** \brief 策略表：新增模型服务只需要在这里加一行。 */
fn wire_protocol(id: ProviderId) -> WireProtocol {
    match id {
        ProviderId::OpenAI | ProviderId::Zhipu | ProviderId::Moonshot | ProviderId::DeepSeek => {
            WireProtocol::OpenAICompatible { bearer: true }
        }
        ProviderId::LmStudio => WireProtocol::OpenAICompatible { bearer: false },
        ProviderId::Claude => WireProtocol::Anthropic,
        ProviderId::Disabled => WireProtocol::None,
    }
}

/**
 * \brief 生产环境客户端工厂，每个客户端持有独立的 reqwest 连接池。
 */
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn build(&self, settings: &ProviderSettings) -> Result<Option<Arc<dyn ChatClient>>, AiError> {
        let protocol = wire_protocol(settings.id);
        if protocol == WireProtocol::None {
            return Ok(None);
        }
        let api_key = require_credential(settings)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AiError::ClientBuild(e.to_string()))?;
        let client: Arc<dyn ChatClient> = match protocol {
            WireProtocol::OpenAICompatible { bearer } => Arc::new(OpenAICompatibleClient {
                http,
                endpoint: settings.endpoint.clone(),
                api_key: if bearer { api_key } else { None },
            }),
            WireProtocol::Anthropic => Arc::new(AnthropicClient {
                http,
                endpoint: settings.endpoint.clone(),
                api_key: api_key.unwrap_or_default(),
            }),
            WireProtocol::None => return Ok(None),
        };
        Ok(Some(client))
    }
}

/**
 * \brief 需要密钥的模型服务在密钥缺失时返回 `MissingCredential`。
 */
pub fn require_credential(settings: &ProviderSettings) -> Result<Option<String>, AiError> {
    if !settings.id.requires_credential() {
        return Ok(settings.api_key.clone());
    }
    match settings.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(Some(key.to_string())),
        _ => Err(AiError::MissingCredential {
            provider: settings.id.to_string(),
            env_key: credential_keys(settings.id)
                .into_iter()
                .next()
                .unwrap_or_default(),
        }),
    }
}

/**
 * \brief OpenAI 兼容协议客户端（OpenAI/智谱/Moonshot/DeepSeek/LM Studio）。
 */
pub struct OpenAICompatibleClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[async_trait]
impl ChatClient for OpenAICompatibleClient {
    async fn chat_complete(&self, request: &ChatRequest) -> Result<ChatCompletion, AiError> {
        chat_once_openai(&self.http, &self.endpoint, self.api_key.as_deref(), request)
            .await
            .map_err(|e| AiError::remote(e.to_string()))
    }
}

async fn chat_once_openai(
    http: &reqwest::Client,
    endpoint: &str,
    api_key: Option<&str>,
    request: &ChatRequest,
) -> Result<ChatCompletion> {
    let url = format!("{}/chat/completions", endpoint.trim_end_matches('/'));
    let body = json!({
        "model": request.model,
        "messages": request.messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "stream": false
    });

    let mut req = http
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .json(&body);
    if let Some(key) = api_key {
        req = req.header(AUTHORIZATION, format!("Bearer {}", key));
    }
    let resp = req.send().await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    parse_openai_completion(v)
}

/**
 * \brief Anthropic Messages 协议客户端，响应适配为 choices 结构。
 */
pub struct AnthropicClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[async_trait]
impl ChatClient for AnthropicClient {
    async fn chat_complete(&self, request: &ChatRequest) -> Result<ChatCompletion, AiError> {
        chat_once_claude(&self.http, &self.endpoint, &self.api_key, request)
            .await
            .map_err(|e| AiError::remote(e.to_string()))
    }
}

async fn chat_once_claude(
    http: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    request: &ChatRequest,
) -> Result<ChatCompletion> {
    let url = format!("{}/v1/messages", endpoint.trim_end_matches('/'));
    let (system_prompt, payload_messages) = anthropic_payload(&request.messages);

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "messages": payload_messages,
    });
    if let Some(sys) = system_prompt {
        body["system"] = json!(sys);
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );

    let resp = http.post(url).headers(headers).json(&body).send().await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("claude request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(adapt_anthropic_content(&v))
}

fn parse_openai_completion(v: Value) -> Result<ChatCompletion> {
    if !v.get("choices").map(Value::is_array).unwrap_or(false) {
        return Err(anyhow!("unexpected completion payload: {}", v));
    }
    Ok(serde_json::from_value(v)?)
}

fn adapt_anthropic_content(v: &Value) -> ChatCompletion {
    let blocks = v
        .get("content")
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if blocks.is_empty() {
        ChatCompletion::default()
    } else {
        ChatCompletion::from_text(blocks.join(""))
    }
}

fn anthropic_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "assistant" => items.push(json!({
                "role": "assistant",
                "content": [{"type": "text", "text": msg.content}]
            })),
            _ => items.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(id: ProviderId, api_key: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            id,
            api_key: api_key.map(str::to_string),
            endpoint: "http://127.0.0.1:9".to_string(),
            model: "m".to_string(),
            max_tokens: 16,
            temperature: 0.1,
        }
    }

    #[test]
    fn test_first_content_rejects_empty_choices() {
        assert_eq!(ChatCompletion::default().first_content(), None);
        let blank = ChatCompletion::from_text("   ");
        assert_eq!(blank.first_content(), None);
        let ok = ChatCompletion::from_text("上涨");
        assert_eq!(ok.first_content(), Some("上涨"));
    }

    #[test]
    fn test_parse_openai_completion_shapes() {
        let parsed = parse_openai_completion(json!({
            "choices": [{"message": {"role": "assistant", "content": "hi"}}]
        }))
        .expect("parse");
        assert_eq!(parsed.first_content(), Some("hi"));

        let empty = parse_openai_completion(json!({"choices": []})).expect("parse empty");
        assert_eq!(empty.first_content(), None);

        assert!(parse_openai_completion(json!({"error": "boom"})).is_err());
    }

    #[test]
    fn test_adapt_anthropic_content() {
        let v = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(adapt_anthropic_content(&v).first_content(), Some("ab"));
        assert!(adapt_anthropic_content(&json!({"content": []})).choices.is_empty());
    }

    #[test]
    fn test_anthropic_payload_lifts_system_prompt() {
        let messages = vec![Message::system("sys"), Message::user("hello")];
        let (system, items) = anthropic_payload(&messages);
        assert_eq!(system.as_deref(), Some("sys"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["role"], "user");
    }

    #[test]
    fn test_factory_requires_credentials() {
        let factory = HttpClientFactory;
        let err = factory
            .build(&settings(ProviderId::OpenAI, None))
            .err()
            .expect("missing key must fail");
        assert_eq!(err.code(), "MISSING_CREDENTIAL");

        assert!(factory
            .build(&settings(ProviderId::LmStudio, None))
            .expect("lmstudio builds")
            .is_some());
        assert!(factory
            .build(&settings(ProviderId::Disabled, None))
            .expect("disabled builds")
            .is_none());
        assert!(factory
            .build(&settings(ProviderId::Claude, Some("sk-ant")))
            .expect("claude builds")
            .is_some());
    }

    #[test]
    fn test_chat_request_layout() {
        let req = ChatRequest::new(&settings(ProviderId::OpenAI, Some("k")), "sys", "q");
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].content, "q");
        assert_eq!(req.max_tokens, 16);
    }
}
