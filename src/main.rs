//! Hive - 命令行对话入口
//!
//! 从标准输入逐行读取消息，交给编排核心处理，打印回复与本轮元数据（JSON）。
//!
//! ```bash
//! cargo run -- --config config/default.toml --user alice --conversation demo
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hive::{observability, process_message, OrchestratorRuntime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(about = "Chat with the Hive orchestration core over stdin")]
struct Args {
    /// 配置文件路径（缺省按 config/default.toml 等位置查找）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 用户 ID；无会话 ID 时按用户保存历史
    #[arg(long = "user")]
    user_id: Option<String>,

    /// 会话 ID
    #[arg(long = "conversation")]
    conversation_id: Option<String>,

    /// 只打印回复，不打印元数据
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();

    let runtime = OrchestratorRuntime::from_config(args.config.clone())
        .await
        .context("Failed to load configuration")?;
    tracing::info!(tools = ?runtime.tool_names(), "hive ready");

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!("Received Ctrl+C, shutting down");
            token.cancel();
        }
    });

    println!("Hive ready. Type a message, or /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "/quit" || message == "/exit" {
            break;
        }

        let turn = process_message(
            &runtime,
            message,
            args.user_id.as_deref(),
            args.conversation_id.as_deref(),
            None,
        )
        .await;

        println!("\n{}\n", turn.reply);
        if !args.quiet {
            let meta = serde_json::to_string_pretty(&turn.metadata)
                .context("Failed to serialize turn metadata")?;
            println!("{meta}\n");
        }
    }

    Ok(())
}
