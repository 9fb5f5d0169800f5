//! Concierge 命令行入口
//!
//! 初始化日志、加载配置、构建组件，然后逐行读取标准输入交给编排 Pipeline。
//! 单次请求进行中按 Ctrl-C 取消该请求；空闲时 Ctrl-C 或 EOF 退出。

use anyhow::Context;
use concierge::{build_components, config::load_config, observability};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

const LOCAL_SESSION: &str = "local";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load configuration")?;
    let components = build_components(&cfg).context("Failed to build components")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("Concierge ready. Type a question, or Ctrl-D to quit.");

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        let reply = tokio::select! {
            reply = components.pipeline.process_user_message(&line, LOCAL_SESSION, &cancel) => reply,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                concierge::core::reply::CANCELLED_REPLY.to_string()
            }
        };
        println!("{reply}\n");

        let (prompt, completion, total) = components.llm.token_usage();
        tracing::debug!(prompt, completion, total, "Token usage");
    }

    tracing::info!("Bye");
    Ok(())
}
