use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use finchat_core_sdk::{
    build_dispatcher,
    config::{flag_enabled, ConfigSource, EnvConfig, TELEMETRY_KEY},
    models::MarketSnapshot,
    prompt::SystemClock,
    server, telemetry,
};

/**
 * \brief CLI 程序入口：启动服务或在终端直接对话。
 */
#[derive(Parser, Debug)]
#[command(name = "finchat", version, about = "FinChat market data assistant")]
struct Cli {
    /** \brief 开启事件遥测（也可通过 FINCHAT_TELEMETRY=1 开启）。 */
    #[arg(long, global = true, default_value_t = false)]
    telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
    },

    /**
     * \brief 发送一条消息并打印分析结果。
     * \param prompt   用户消息
     * \param snapshot 行情快照 JSON 文件
     * \param provider 本次使用的模型服务
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        snapshot: Option<std::path::PathBuf>,
        #[arg(long)]
        provider: Option<String>,
    },

    /**
     * \brief 列出支持的模型服务及配置状态。
     */
    Providers,

    /**
     * \brief 显示当前模型服务状态。
     */
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config: Arc<dyn ConfigSource> = Arc::new(EnvConfig);

    // 本地时区只能在单线程时读取，须早于运行时启动
    let clock = SystemClock::from_config(config.as_ref());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime failed")?
        .block_on(run(cli, config, clock))
}

async fn run(cli: Cli, config: Arc<dyn ConfigSource>, clock: SystemClock) -> Result<()> {
    telemetry::set_enabled(cli.telemetry || flag_enabled(config.as_ref(), TELEMETRY_KEY));

    let dispatcher = Arc::new(build_dispatcher(config, clock));

    match cli.command {
        Commands::Serve { addr } => {
            server::run(&addr, dispatcher).await?;
        }
        Commands::Chat {
            prompt,
            snapshot,
            provider,
        } => {
            if let Some(provider) = provider {
                let outcome = dispatcher
                    .switch_to(&provider)
                    .with_context(|| format!("switch provider to {} failed", provider))?;
                println!(
                    "Provider {} -> {} (available={})",
                    outcome.old_provider_id, outcome.new_provider_id, outcome.available
                );
            }

            let snapshot = match snapshot {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("read snapshot {} failed", path.display()))?;
                    let parsed: MarketSnapshot =
                        serde_json::from_str(&raw).context("parse snapshot json failed")?;
                    Some(parsed)
                }
                None => None,
            };

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "provider={} prompt_len={} snapshot={}",
                    dispatcher.current_status().provider_id,
                    prompt.chars().count(),
                    snapshot.is_some()
                ),
            );

            let outcome = dispatcher
                .analyze(&prompt, snapshot.as_ref())
                .await
                .context("analyze failed")?;
            println!("{}", outcome.text);
            if outcome.degraded {
                eprintln!("(local analysis, provider={})", outcome.provider_id_used);
            }
        }
        Commands::Providers => {
            let current = dispatcher.current_status().provider_id;
            for (id, d) in dispatcher.list_providers() {
                println!(
                    "{} {:<9} {:<14} configured={:<5} model={} endpoint={}",
                    if id == current { "*" } else { " " },
                    id.as_str(),
                    d.display_name,
                    d.configured,
                    d.default_model,
                    if d.default_endpoint.is_empty() {
                        "-"
                    } else {
                        d.default_endpoint.as_str()
                    }
                );
            }
        }
        Commands::Status => {
            let status = dispatcher.current_status();
            println!(
                "provider={} available={} model={} endpoint={}",
                status.provider_id, status.available, status.model, status.endpoint
            );
        }
    }

    Ok(())
}
