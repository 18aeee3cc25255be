use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/** \brief 日志目录配置项，默认 `logs`。 */
pub const LOG_DIR_KEY: &str = "FINCHAT_LOG_DIR";

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

static LOG_DIR_OVERRIDE: Lazy<std::sync::RwLock<Option<PathBuf>>> =
    Lazy::new(|| std::sync::RwLock::new(None));

/**
 * \brief 指定日志目录，优先于 `FINCHAT_LOG_DIR`。传入 `None` 恢复默认。
 */
pub fn set_log_dir(dir: Option<PathBuf>) {
    if let Ok(mut guard) = LOG_DIR_OVERRIDE.write() {
        *guard = dir;
    }
}

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 记录常规事件，仅在开关打开时写入。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件，不受开关影响；写文件失败时输出到 stderr。
 */
pub fn log_error(category: &str, message: &str) {
    if let Err(err) = write_line("ERROR", category, message) {
        eprintln!("telemetry write failed: {}", err);
        eprintln!("[ERROR] {} - {}", category, message);
    }
}

fn log_dir() -> PathBuf {
    let overridden = LOG_DIR_OVERRIDE.read().ok().and_then(|g| g.clone());
    if let Some(dir) = overridden {
        return dir;
    }
    // 单元测试不在 crate 目录下留日志
    if cfg!(test) {
        return std::env::temp_dir().join("finchat-unit-logs");
    }
    std::env::var(LOG_DIR_KEY)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"))
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = log_dir();
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("finchat.log"))?;
    writeln!(file, "{}", format_line(&timestamp, level, category, message))?;
    Ok(())
}

fn format_line(timestamp: &str, level: &str, category: &str, message: &str) -> String {
    // 单条记录保持一行
    let flat = message.replace(['\r', '\n'], " ");
    format!("{} [{}] {} - {}", timestamp, level, category, flat)
}
