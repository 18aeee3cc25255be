use std::fmt::Write as _;

use crate::models::MarketSnapshot;

pub const NO_SNAPSHOT_REPLY: &str = "您好！我是智能金融分析助手。请先在上方选择一只股票或指数并加载图表数据，我就可以基于行情数据为您分析走势、风险和投资机会。";

pub const FALLBACK_DISCLAIMER: &str = "⚠️ 以上分析基于历史数据的规则计算，仅供参考，不构成投资建议。";

const TREND_KEYWORDS: [&str; 4] = ["趋势", "走势", "trend", "movement"];
const RISK_KEYWORDS: [&str; 3] = ["风险", "波动", "risk"];
const INVEST_KEYWORDS: [&str; 5] = ["买", "投资", "建仓", "buy", "invest"];

/**
 * \brief 区间涨跌幅的五档趋势分类。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendBand {
    StrongRise,
    ModerateRise,
    Sideways,
    ModerateFall,
    SharpFall,
}

impl TrendBand {
    pub fn classify(change_percent: f64) -> Self {
        if change_percent > 10.0 {
            TrendBand::StrongRise
        } else if change_percent > 3.0 {
            TrendBand::ModerateRise
        } else if change_percent > -3.0 {
            TrendBand::Sideways
        } else if change_percent > -10.0 {
            TrendBand::ModerateFall
        } else {
            TrendBand::SharpFall
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TrendBand::StrongRise => "强势上涨",
            TrendBand::ModerateRise => "温和上涨",
            TrendBand::Sideways => "横盘震荡",
            TrendBand::ModerateFall => "温和下跌",
            TrendBand::SharpFall => "大幅下跌",
        }
    }
}

/**
 * \brief 波动率三档分类。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn classify(volatility: f64) -> Self {
        if volatility > 30.0 {
            RiskLevel::High
        } else if volatility < 15.0 {
            RiskLevel::Low
        } else {
            RiskLevel::Medium
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::High => "高风险",
            RiskLevel::Medium => "中等风险",
            RiskLevel::Low => "低风险",
        }
    }
}

/**
 * \brief 基于区间涨跌幅的投资建议分档。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvestmentAdvice {
    Accumulate,
    CautionOnHighs,
    WaitForStabilization,
}

impl InvestmentAdvice {
    pub fn classify(change_percent: f64) -> Self {
        if change_percent > 20.0 {
            InvestmentAdvice::CautionOnHighs
        } else if change_percent >= 0.0 {
            InvestmentAdvice::Accumulate
        } else {
            InvestmentAdvice::WaitForStabilization
        }
    }

    pub fn advice(self) -> &'static str {
        match self {
            InvestmentAdvice::Accumulate => {
                "走势相对健康，可考虑分批建仓、逢低布局，并设置好止损位。"
            }
            InvestmentAdvice::CautionOnHighs => {
                "区间涨幅较大，注意高位追涨风险，可等待回调后再考虑介入。"
            }
            InvestmentAdvice::WaitForStabilization => {
                "当前处于调整阶段，建议等待企稳信号出现后再做决策。"
            }
        }
    }
}

/** \brief 波动率 `(max-min)/min*100`，`min <= 0` 时不计算。 */
pub fn volatility(max_price: f64, min_price: f64) -> Option<f64> {
    (min_price > 0.0).then(|| (max_price - min_price) / min_price * 100.0)
}

/** \brief 区间最高点到最新收盘的回撤，`max <= 0` 时不计算。 */
pub fn max_drawdown(max_price: f64, latest_close: f64) -> Option<f64> {
    (max_price > 0.0).then(|| ((max_price - latest_close) / max_price * 100.0).max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    Trend,
    Risk,
    Invest,
}

impl Topic {
    fn keywords(self) -> &'static [&'static str] {
        match self {
            Topic::Trend => &TREND_KEYWORDS,
            Topic::Risk => &RISK_KEYWORDS,
            Topic::Invest => &INVEST_KEYWORDS,
        }
    }
}

/** \brief 命中的话题，按关键词在消息中首次出现的位置排序。 */
fn matched_topics(message: &str) -> Vec<Topic> {
    let mut hits: Vec<(usize, Topic)> = [Topic::Trend, Topic::Risk, Topic::Invest]
        .into_iter()
        .filter_map(|topic| {
            topic
                .keywords()
                .iter()
                .filter_map(|k| message.find(k))
                .min()
                .map(|pos| (pos, topic))
        })
        .collect();
    hits.sort_by_key(|(pos, _)| *pos);
    hits.into_iter().map(|(_, topic)| topic).collect()
}

/**
 * \brief 本地规则分析。纯函数，不访问网络，总是返回非空文本。
 */
pub fn analyze_locally(user_message: &str, snapshot: Option<&MarketSnapshot>) -> String {
    let Some(snapshot) = snapshot.filter(|s| s.has_bars()) else {
        return NO_SNAPSHOT_REPLY.to_string();
    };

    let message = user_message.to_lowercase();
    let summary = snapshot.summary_or_default();
    let change = summary.change_percent.unwrap_or(0.0);
    let max_price = summary.max_price.unwrap_or(0.0);
    let min_price = summary.min_price.unwrap_or(0.0);
    let latest_close = snapshot.latest_bar().map(|b| b.close).unwrap_or(0.0);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "📊 **{}（{}）数据分析**\n",
        snapshot.name_or_placeholder(),
        snapshot.code_or_placeholder()
    );

    let topics = matched_topics(&message);
    for topic in &topics {
        match topic {
            Topic::Trend => write_trend_block(&mut out, change, max_price, min_price),
            Topic::Risk => write_risk_block(&mut out, max_price, min_price, latest_close),
            Topic::Invest => write_invest_block(&mut out, change),
        }
    }

    if topics.is_empty() {
        let _ = writeln!(
            out,
            "您可以询问我关于**趋势**、**风险**或**投资**相关的问题，我会基于当前图表数据给出分析。\n"
        );
    }

    let _ = writeln!(out, "**📌 关键数据**");
    let _ = writeln!(out, "- 最新价格：{:.2}", snapshot.effective_price().unwrap_or(0.0));
    let _ = writeln!(out, "- 价格区间：{:.2} - {:.2}", min_price, max_price);
    let _ = writeln!(
        out,
        "- 平均成交量：{:.0}\n",
        summary.avg_volume.unwrap_or(0.0)
    );
    out.push_str(FALLBACK_DISCLAIMER);
    out
}

fn write_trend_block(out: &mut String, change: f64, max_price: f64, min_price: f64) {
    let band = TrendBand::classify(change);
    let _ = writeln!(out, "**📈 趋势分析**");
    let _ = writeln!(out, "- 区间表现：**{}**，涨跌幅 {:.2}%", band.label(), change);
    match volatility(max_price, min_price) {
        Some(spread) => {
            let _ = writeln!(out, "- 最高价与最低价差幅：{:.2}%\n", spread);
        }
        None => {
            let _ = writeln!(out, "- 最高价与最低价差幅：数据不足\n");
        }
    }
}

fn write_risk_block(out: &mut String, max_price: f64, min_price: f64, latest_close: f64) {
    let _ = writeln!(out, "**⚠️ 风险评估**");
    match volatility(max_price, min_price) {
        Some(vol) => {
            let level = RiskLevel::classify(vol);
            let _ = writeln!(out, "- 区间波动率：{:.2}%，属于**{}**", vol, level.label());
        }
        None => {
            let _ = writeln!(out, "- 区间波动率：最低价数据缺失，无法计算");
        }
    }
    match max_drawdown(max_price, latest_close) {
        Some(dd) => {
            let _ = writeln!(out, "- 距区间高点回撤：{:.2}%\n", dd);
        }
        None => {
            let _ = writeln!(out, "- 距区间高点回撤：数据不足\n");
        }
    }
}

fn write_invest_block(out: &mut String, change: f64) {
    let advice = InvestmentAdvice::classify(change);
    let _ = writeln!(out, "**💡 投资参考**");
    let _ = writeln!(out, "- 区间涨跌幅 {:.2}%：{}\n", change, advice.advice());
}
