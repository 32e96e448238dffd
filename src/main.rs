//! nvim-rpc - command line access to a running Neovim.
//!
//! Connects to an instance started with `nvim --listen <addr>`, runs one
//! command and prints the result as JSON.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nvim_rpc::{AutocmdOptions, ClientConfig, Endpoint, Nvim, Value};

#[derive(Parser, Debug)]
#[command(name = "nvim-rpc", version, about = "Talk to a running Neovim over msgpack-RPC")]
struct Cli {
    /// host:port or socket path of the Neovim instance
    #[arg(long, env = "NVIM_RPC_ADDR")]
    addr: Option<Endpoint>,

    /// Per-call timeout in milliseconds (0 waits forever)
    #[arg(long, env = "NVIM_RPC_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a Vimscript expression
    Eval { expr: String },
    /// Call an API function; each argument is parsed as JSON
    Call {
        method: String,
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print autocmd events as they fire
    Listen {
        #[arg(required = true)]
        events: Vec<String>,
        #[arg(long)]
        pattern: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nvim_rpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    info!("Connecting to {}", config.endpoint);
    let nvim = Nvim::connect(config)
        .await
        .context("Failed to connect to Neovim")?;

    let result = run(&nvim, cli.command).await;
    nvim.client().close().await;
    result
}

fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("Invalid environment configuration")?;
    if let Some(addr) = &cli.addr {
        config.endpoint = addr.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        config.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }
    Ok(config)
}

async fn run(nvim: &Nvim, command: Command) -> Result<()> {
    match command {
        Command::Eval { expr } => {
            let value = nvim.eval(&expr).await.context("nvim_eval failed")?;
            print_json(&value)
        }
        Command::Call { method, args } => {
            let args = args
                .iter()
                .map(|arg| {
                    serde_json::from_str(arg)
                        .map(|json| Value::from_json(&json))
                        .with_context(|| format!("Argument is not valid JSON: {arg}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let value = nvim
                .client()
                .call(&method, args)
                .await
                .with_context(|| format!("{method} failed"))?;
            print_json(&value)
        }
        Command::Listen { events, pattern } => {
            let events: Vec<&str> = events.iter().map(String::as_str).collect();
            let opts = AutocmdOptions {
                pattern,
                ..Default::default()
            };
            let mut subscription = nvim
                .create_autocmd(&events, opts)
                .await
                .context("Failed to create autocmd")?;
            info!("Listening for {}", events.join(", "));

            loop {
                tokio::select! {
                    event = subscription.next() => match event {
                        Some(event) => print_json(&event)?,
                        None => {
                            info!("Connection closed");
                            return Ok(());
                        }
                    },
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    let json = serde_json::to_string_pretty(&value.to_json())?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_call_arguments() {
        let cli = Cli::try_parse_from([
            "nvim-rpc",
            "--addr",
            "127.0.0.1:7777",
            "call",
            "nvim_buf_get_lines",
            "0",
            "-1",
            "false",
        ])
        .unwrap();

        assert_eq!(cli.addr.unwrap().to_string(), "127.0.0.1:7777");
        match cli.command {
            Command::Call { method, args } => {
                assert_eq!(method, "nvim_buf_get_lines");
                assert_eq!(args, vec!["0", "-1", "false"]);
            }
            other => panic!("Expected call, got {other:?}"),
        }
    }

    #[test]
    fn test_listen_requires_an_event() {
        assert!(Cli::try_parse_from(["nvim-rpc", "listen"]).is_err());
    }
}
