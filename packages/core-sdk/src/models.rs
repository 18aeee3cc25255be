use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::AiError;

/**
 * \brief 支持的模型服务标识，固定枚举。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAI,
    Zhipu,
    Moonshot,
    DeepSeek,
    Claude,
    LmStudio,
    Disabled,
}

impl ProviderId {
    /** \brief 全部支持的标识，顺序即展示顺序。 */
    pub const ALL: [ProviderId; 7] = [
        ProviderId::OpenAI,
        ProviderId::Zhipu,
        ProviderId::Moonshot,
        ProviderId::DeepSeek,
        ProviderId::Claude,
        ProviderId::LmStudio,
        ProviderId::Disabled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::OpenAI => "openai",
            ProviderId::Zhipu => "zhipu",
            ProviderId::Moonshot => "moonshot",
            ProviderId::DeepSeek => "deepseek",
            ProviderId::Claude => "claude",
            ProviderId::LmStudio => "lmstudio",
            ProviderId::Disabled => "disabled",
        }
    }

    /**
     * \brief 配置项前缀，如 `OPENAI` -> `OPENAI_API_KEY`；`disabled` 没有配置项。
     */
    pub fn config_prefix(self) -> Option<&'static str> {
        match self {
            ProviderId::OpenAI => Some("OPENAI"),
            ProviderId::Zhipu => Some("ZHIPU"),
            ProviderId::Moonshot => Some("MOONSHOT"),
            ProviderId::DeepSeek => Some("DEEPSEEK"),
            ProviderId::Claude => Some("CLAUDE"),
            ProviderId::LmStudio => Some("LMSTUDIO"),
            ProviderId::Disabled => None,
        }
    }

    /** \brief 是否需要密钥才能构建客户端。 */
    pub fn requires_credential(self) -> bool {
        !matches!(self, ProviderId::LmStudio | ProviderId::Disabled)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ProviderId::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| AiError::UnknownProvider(s.to_string()))
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 单日 K 线。缺失或无法解析的数值一律按 0 处理。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub open: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub close: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub high: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub low: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub volume: f64,
}

/**
 * \brief 区间统计，字段可能缺失。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    #[serde(default, deserialize_with = "lenient_opt_number")]
    pub change_percent: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_number")]
    pub max_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_number")]
    pub min_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_number")]
    pub avg_volume: Option<f64>,
}

/**
 * \brief 数据区间，可能只有部分字段。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default, alias = "totalDays", deserialize_with = "lenient_opt_number")]
    pub total_trading_days: Option<f64>,
}

/**
 * \brief 一轮对话携带的行情快照，由上游数据服务提供，本模块只读。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    #[serde(default, alias = "symbolCode")]
    pub code: Option<String>,
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_number")]
    pub current_price: Option<f64>,
    /** \brief 日线，按日期升序。 */
    #[serde(default, alias = "bars", deserialize_with = "lenient_bars")]
    pub data: Vec<DailyBar>,
    #[serde(default, deserialize_with = "lenient_object")]
    pub summary: Option<PeriodSummary>,
    #[serde(default, alias = "dateRange", deserialize_with = "lenient_object")]
    pub period_range: Option<PeriodRange>,
}

impl MarketSnapshot {
    pub fn has_bars(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn latest_bar(&self) -> Option<&DailyBar> {
        self.data.last()
    }

    /** \brief 最近 `n` 根 K 线，仍按时间升序。 */
    pub fn recent_bars(&self, n: usize) -> &[DailyBar] {
        let start = self.data.len().saturating_sub(n);
        &self.data[start..]
    }

    pub fn code_or_placeholder(&self) -> &str {
        non_blank(self.code.as_deref()).unwrap_or("未知代码")
    }

    pub fn name_or_placeholder(&self) -> &str {
        non_blank(self.name.as_deref()).unwrap_or("未知标的")
    }

    /** \brief 当前价：优先快照字段，其次最新收盘价。 */
    pub fn effective_price(&self) -> Option<f64> {
        self.current_price
            .or_else(|| self.latest_bar().map(|bar| bar.close))
    }

    pub fn summary_or_default(&self) -> PeriodSummary {
        self.summary.clone().unwrap_or_default()
    }

    pub fn snapshot_ref(&self) -> SnapshotRef {
        SnapshotRef {
            code: self.code_or_placeholder().to_string(),
            name: self.name_or_placeholder().to_string(),
            current_price: self.effective_price(),
        }
    }
}

/**
 * \brief 会话记录中保存的快照摘要。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    pub code: String,
    pub name: String,
    pub current_price: Option<f64>,
}

/**
 * \brief 一次完成的对话（成功或降级均会记录），创建后不可变。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub id: u64,
    /** \brief RFC3339 时间戳 */
    pub timestamp: String,
    pub user_message: String,
    pub ai_response: String,
    pub provider_id_used: ProviderId,
    pub snapshot_ref: Option<SnapshotRef>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn number_from_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value).unwrap_or(0.0))
}

fn lenient_opt_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

fn lenient_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .filter(Value::is_object)
        .and_then(|v| serde_json::from_value(v).ok()))
}

fn lenient_bars<'de, D>(deserializer: D) -> Result<Vec<DailyBar>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let items = match value {
        Some(Value::Array(items)) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter(|item| item.is_object())
        .filter_map(|item| serde_json::from_value::<DailyBar>(item).ok())
        .collect())
}
