//! `qtalk` command-line front-end.
//!
//! ```text
//! qtalk call tcp://127.0.0.1:9090/echo '{"hello": "world"}'
//! ```

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use qtalk::{CallArgs, CancellationToken, JsonCodec};
use serde_json::Value;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Parser)]
#[command(name = "qtalk", version, about = "Bidirectional RPC over qmux")]
struct Cli {
    /// Diagnostic verbosity on stderr.
    #[arg(long, global = true, default_value = "warn")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Call a selector on a remote peer and print the JSON reply.
    Call {
        /// Endpoint URL; the path is the selector, e.g. tcp://host:port/echo
        url: String,
        /// Arguments, each parsed as JSON (bare words become strings).
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(cli.log_level.as_filter())
        .with_target(false)
        .try_init();

    let result = match cli.command {
        Command::Call { url, args } => call(&url, &args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("qtalk: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn call(url: &str, raw_args: &[String]) -> Result<(), String> {
    let (addr, selector) = parse_endpoint(url)?;

    let args = if raw_args.is_empty() {
        Value::Null
    } else {
        Value::Array(raw_args.iter().map(|a| parse_arg(a)).collect())
    };

    let peer = qtalk::dial_tcp(&*addr, JsonCodec)
        .await
        .map_err(|e| format!("dial {addr}: {e}"))?;

    let resp = peer
        .call::<_, (Value,)>(CancellationToken::new(), &selector, CallArgs::value(args))
        .await
        .map_err(|e| e.to_string())?;

    let pretty =
        serde_json::to_string_pretty(&resp.reply.0).map_err(|e| format!("format reply: {e}"))?;
    println!("{pretty}");

    peer.close().await.map_err(|e| e.to_string())?;
    Ok(())
}

/// Split `tcp://host:port/selector` into a dialable address and a selector.
fn parse_endpoint(raw: &str) -> Result<(String, String), String> {
    let url = url::Url::parse(raw).map_err(|e| format!("invalid url {raw}: {e}"))?;
    if url.scheme() != "tcp" {
        return Err(format!("unsupported scheme: {}", url.scheme()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| format!("missing host in {raw}"))?;
    let port = url.port().ok_or_else(|| format!("missing port in {raw}"))?;
    Ok((format!("{host}:{port}"), url.path().to_string()))
}

/// Each argument is JSON if it parses, a bare string otherwise.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
