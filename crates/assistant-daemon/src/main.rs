// assistant-daemon/crates/assistant-daemon/src/main.rs

#[cfg(feature = "cli")]
use assistant_daemon::{
    config::Config, run_daemon, telemetry, Correlator, HttpBusClient, TerminalPresenter, UserCommand,
};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use dotenvy::dotenv;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "assistant-daemon", version, about = "Streaming assistant over a local language model")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Run the daemon and serve the bus over HTTP
    Serve,
    /// Chat with a running daemon from the terminal
    Chat {
        /// Bus address, overrides ASSISTANT_URL
        #[arg(long)]
        url: Option<String>,
    },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_daemon(cfg).await,
        Command::Chat { url } => chat(cfg, url).await,
    }
}

#[cfg(feature = "cli")]
async fn chat(cfg: Config, url: Option<String>) -> anyhow::Result<()> {
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc;

    telemetry::init_tracing_with_default("warn");

    let bus = Arc::new(HttpBusClient::new(url.unwrap_or_else(|| cfg.assistant_url.clone()))?);
    let presenter = TerminalPresenter::new(std::io::stdout());
    let correlator = Correlator::connect(bus, presenter, cfg.render_interval()).await?;

    eprintln!("Connected. Type a message, /stop to interrupt, /clear to forget, /reasoning on|off, Ctrl-D to quit.");

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let command = match line.trim() {
                "" => continue,
                "/stop" => UserCommand::Stop,
                "/clear" => UserCommand::ClearHistory,
                "/reasoning on" => UserCommand::SetReasoning(true),
                "/reasoning off" => UserCommand::SetReasoning(false),
                text => UserCommand::Send(text.to_string()),
            };
            if tx.send(command).await.is_err() {
                break;
            }
        }
    });

    correlator.run(rx).await?;
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
