use std::fmt::Write as _;

use time::{macros::format_description, OffsetDateTime, UtcOffset};

use crate::{
    config::{ConfigSource, UTC_OFFSET_KEY},
    models::{DailyBar, MarketSnapshot, PeriodRange},
};

/** \brief 提示词中展示的最近 K 线数量。 */
pub const RECENT_BAR_WINDOW: usize = 10;

const NA: &str = "N/A";

const PERSONA: &str = "你是一位专业的金融数据分析助手，擅长解读股票与指数的历史行情。

## 你的能力
- 分析价格走势与趋势强度
- 评估波动率、回撤等风险指标
- 解读成交量变化与量价关系
- 结合区间统计给出客观的市场观察

## 回答要求
- 使用简体中文回答
- 结构清晰，分点说明，结论先行
- 关键数字与结论使用 **加粗** 标注
- 只基于提供的数据进行分析，数据不足时明确说明";

const DISCLAIMER: &str =
    "## 免责声明\n以上分析仅基于历史数据，不构成任何投资建议。市场有风险，投资需谨慎。";

/**
 * \brief 时钟抽象，提示词日期与会话时间戳都经由它获取。
 */
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/**
 * \brief 系统时钟，按固定偏移换算本地时间。
 * \details 多线程运行时内无法可靠读取本地时区，偏移需在运行时启动前确定。
 */
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /** \brief 读取操作系统时区，失败时使用 UTC。 */
    pub fn local() -> Self {
        Self::new(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
    }

    /** \brief 优先使用 `FINCHAT_UTC_OFFSET`，未配置或无法解析时回退到 [`SystemClock::local`]。 */
    pub fn from_config(config: &dyn ConfigSource) -> Self {
        config
            .get_non_blank(UTC_OFFSET_KEY)
            .and_then(|raw| parse_utc_offset(&raw))
            .map(Self::new)
            .unwrap_or_else(Self::local)
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(UtcOffset::UTC)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/** \brief 解析 `+08:00`、`-05:30` 或整数小时形式的偏移。 */
pub fn parse_utc_offset(raw: &str) -> Option<UtcOffset> {
    let raw = raw.trim();
    if let Ok(hours) = raw.parse::<i8>() {
        return UtcOffset::from_hms(hours, 0, 0).ok();
    }
    UtcOffset::parse(
        raw,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .ok()
}

/**
 * \brief 固定时钟，测试使用。
 */
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/**
 * \brief 构建系统提示词。相同快照与日期得到相同结果，任何快照字段缺失都不会失败。
 */
pub fn build_system_prompt(snapshot: Option<&MarketSnapshot>, now: OffsetDateTime) -> String {
    let mut out = String::with_capacity(2048);
    out.push_str(PERSONA);
    out.push_str("\n\n");
    let _ = writeln!(out, "当前日期：{}", format_date(now));

    if let Some(snapshot) = snapshot.filter(|s| s.has_bars()) {
        out.push('\n');
        write_market_section(&mut out, snapshot);
    }

    out.push('\n');
    out.push_str(DISCLAIMER);
    out
}

/** \brief `2024年01月02日` */
pub fn format_date(now: OffsetDateTime) -> String {
    format!(
        "{}年{:02}月{:02}日",
        now.year(),
        u8::from(now.month()),
        now.day()
    )
}

fn write_market_section(out: &mut String, snapshot: &MarketSnapshot) {
    let summary = snapshot.summary_or_default();

    let _ = writeln!(out, "## 当前分析标的");
    let _ = writeln!(out, "- 代码：{}", snapshot.code_or_placeholder());
    let _ = writeln!(out, "- 名称：{}", snapshot.name_or_placeholder());
    let _ = writeln!(out, "- 当前价格：{}", fmt_price(snapshot.effective_price()));
    let _ = writeln!(
        out,
        "- 数据区间：{}",
        render_period(snapshot.period_range.as_ref(), snapshot.data.len())
    );

    let _ = writeln!(out, "\n## 区间统计");
    let _ = writeln!(out, "- 区间涨跌幅：{}", fmt_percent(summary.change_percent));
    let _ = writeln!(out, "- 区间最高价：{}", fmt_price(summary.max_price));
    let _ = writeln!(out, "- 区间最低价：{}", fmt_price(summary.min_price));
    let _ = writeln!(out, "- 平均成交量：{}", fmt_volume(summary.avg_volume));

    if let Some(latest) = snapshot.latest_bar() {
        let _ = writeln!(out, "\n## 最新交易日（{}）", date_or_placeholder(latest));
        let _ = writeln!(out, "- 开盘：{:.2}", latest.open);
        let _ = writeln!(out, "- 收盘：{:.2}", latest.close);
        let _ = writeln!(out, "- 最高：{:.2}", latest.high);
        let _ = writeln!(out, "- 最低：{:.2}", latest.low);
        let _ = writeln!(out, "- 成交量：{:.0}", latest.volume);
        let _ = writeln!(out, "- 振幅：{}", fmt_percent(amplitude(latest)));
    }

    let recent = snapshot.recent_bars(RECENT_BAR_WINDOW);
    let _ = writeln!(out, "\n## 最近{}个交易日", recent.len());
    let _ = writeln!(out, "| 日期 | 开盘 | 收盘 | 最高 | 最低 | 成交量 | 涨跌幅 |");
    let _ = writeln!(out, "|------|------|------|------|------|--------|--------|");
    let mut previous: Option<&DailyBar> = None;
    for bar in recent {
        let change = previous.map(|prev| day_change(prev, bar)).unwrap_or(0.0);
        let _ = writeln!(
            out,
            "| {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.0} | {:.2}% |",
            date_or_placeholder(bar),
            bar.open,
            bar.close,
            bar.high,
            bar.low,
            bar.volume,
            change
        );
        previous = Some(bar);
    }
}

fn render_period(range: Option<&PeriodRange>, bar_count: usize) -> String {
    let complete = range.and_then(|r| {
        let start = r.start.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let end = r.end.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some((start, end, r.total_trading_days))
    });
    match complete {
        Some((start, end, days)) => {
            let days = days.map(|d| d.max(0.0) as u64).unwrap_or(bar_count as u64);
            format!("{} 至 {}（共 {} 个交易日）", start, end, days)
        }
        None => "近期数据".to_string(),
    }
}

/** \brief 日内振幅 `(high-low)/low*100`，`low <= 0` 时不计算。 */
pub fn amplitude(bar: &DailyBar) -> Option<f64> {
    (bar.low > 0.0).then(|| (bar.high - bar.low) / bar.low * 100.0)
}

fn day_change(prev: &DailyBar, bar: &DailyBar) -> f64 {
    if prev.close > 0.0 {
        (bar.close - prev.close) / prev.close * 100.0
    } else {
        0.0
    }
}

fn date_or_placeholder(bar: &DailyBar) -> &str {
    let trimmed = bar.date.trim();
    if trimmed.is_empty() {
        NA
    } else {
        trimmed
    }
}

fn fmt_price(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| NA.to_string())
}

fn fmt_percent(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}%", v))
        .unwrap_or_else(|| NA.to_string())
}

fn fmt_volume(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.0}", v))
        .unwrap_or_else(|| NA.to_string())
}
