use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use warmsearch::client::{ClientError, DaemonClient};
use warmsearch::config::{default_profile_dir, ClientConfig, DaemonConfig};
use warmsearch::logging::{self, LogFormat, LogLevel};
use warmsearch::protocol::StatusReport;
use warmsearch::server::BindError;
use warmsearch::{daemon, DaemonContext};
use warmsearch_core::Visibility;
use warmsearch_local::{ChromiumConfig, ChromiumDriver, ResultsMarkdownParser};

#[derive(Parser, Debug)]
#[command(name = "warmsearch")]
#[command(
    about = "Web search through a warm, persistent browser daemon",
    long_about = "Searches are answered by a background daemon that keeps one browser open between calls. \
The daemon starts on first use and exits after WARMSEARCH_IDLE_TIMEOUT_SECS of inactivity. \
Use `warmsearch -- <query>` to search for words that collide with a subcommand name."
)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Search query; words are joined with single spaces.
    query: Vec<String>,
    /// Print daemon status instead of searching. Never starts a daemon.
    #[arg(long, conflicts_with_all = ["stop", "query"])]
    status: bool,
    /// Ask a running daemon to shut down.
    #[arg(long, conflicts_with = "query")]
    stop: bool,
    /// Start the daemon (if this call starts one) with a visible browser window.
    #[arg(long)]
    headed: bool,
    /// Socket path (default: WARMSEARCH_SOCKET or the per-user runtime path).
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Output format: text|json
    #[arg(long = "output", alias = "format", default_value = "text")]
    output: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the search daemon in the foreground.
    Daemon(DaemonCmd),
    /// Run as an MCP stdio server; tool calls go through the daemon.
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct DaemonCmd {
    /// Socket path to listen on.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Run the browser with a visible window.
    #[arg(long)]
    headed: bool,
    /// Override WARMSEARCH_IDLE_TIMEOUT_SECS (0 disables idle shutdown).
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn json_output(output: &str) -> bool {
    output.eq_ignore_ascii_case("json")
}

async fn run_daemon(args: DaemonCmd) -> Result<()> {
    logging::init(
        logging::level_from_env(LogLevel::Info),
        LogFormat::from_env(),
    );
    let mut config = DaemonConfig::from_env();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if args.headed {
        config.visibility = Visibility::Headed;
    }
    if let Some(secs) = args.idle_timeout_secs {
        config.idle_timeout = std::time::Duration::from_secs(secs);
    }

    let driver = Arc::new(ChromiumDriver::new(ChromiumConfig::from_env(
        default_profile_dir(),
    )));
    let ctx = DaemonContext::new(config, driver, Arc::new(ResultsMarkdownParser::default()));
    match daemon::run(ctx).await {
        Ok(_) => Ok(()),
        Err(BindError::AlreadyRunning(path)) => {
            anyhow::bail!("a daemon is already listening on {}", path.display())
        }
        Err(e) => Err(e.into()),
    }
}

fn client_config(cli: &Cli) -> ClientConfig {
    let mut config = ClientConfig::from_env();
    if let Some(socket) = &cli.socket {
        config.socket_path = socket.clone();
    }
    if cli.headed {
        config.visibility = Visibility::Headed;
    }
    config
}

fn report_failure(e: &ClientError, json: bool) -> anyhow::Error {
    if json {
        let mut v = serde_json::json!({
            "ok": false,
            "error": e.to_string(),
            "code": e.code(),
        });
        if let Some(hint) = e.hint() {
            v["hint"] = serde_json::json!(hint);
        }
        if let ClientError::Server {
            retry_after_ms: Some(ms),
            ..
        } = e
        {
            v["retryAfterMs"] = serde_json::json!(ms);
        }
        println!("{v}");
    } else if let Some(hint) = e.hint() {
        eprintln!("hint: {hint}");
    }
    anyhow::anyhow!("{e}")
}

fn print_status(s: &StatusReport) {
    println!("status:    {}", s.status);
    println!("uptime:    {}s", s.uptime);
    println!("cache:     {} entries", s.cache_size);
    println!("browser:   {:?}", s.browser);
    if let Some(headless) = s.headless {
        println!("headless:  {headless}");
    }
    if let (Some(active), Some(queued)) = (s.active, s.queued) {
        println!("requests:  {active} active, {queued} queued");
    }
    if let Some(pool) = s.pool_size {
        println!("idle tabs: {pool}");
    }
    if let Some(state) = &s.challenge_state {
        println!(
            "challenge: {state} ({} consecutive)",
            s.consecutive_challenges.unwrap_or(0)
        );
    }
}

async fn run_client(cli: Cli) -> Result<()> {
    logging::init(logging::level_from_env(LogLevel::Warn), LogFormat::Pretty);
    let json = json_output(&cli.output);
    let client = DaemonClient::new(client_config(&cli));

    if cli.status {
        return match client.status().await {
            Ok(s) if json => {
                println!("{}", serde_json::to_string(&s)?);
                Ok(())
            }
            Ok(s) => {
                print_status(&s);
                Ok(())
            }
            Err(ClientError::NotRunning(path)) => {
                if json {
                    println!("{}", serde_json::json!({"status": "stopped"}));
                } else {
                    println!("not running ({})", path.display());
                }
                Ok(())
            }
            Err(e) => Err(report_failure(&e, json)),
        };
    }

    if cli.stop {
        let stopped = client.stop().await.map_err(|e| report_failure(&e, json))?;
        if json {
            println!("{}", serde_json::json!({ "stopped": stopped }));
        } else if stopped {
            println!("stopped");
        } else {
            println!("not running");
        }
        return Ok(());
    }

    let query = cli.query.join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("missing query (try `warmsearch --help`)");
    }
    let found = client
        .search(&query)
        .await
        .map_err(|e| report_failure(&e, json))?;
    if json {
        println!("{}", serde_json::to_string(&found)?);
    } else {
        println!("{}", found.markdown);
        tracing::info!(from_cache = found.from_cache, time_ms = found.time_ms, "done");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    match cli.command.take() {
        Some(Commands::Daemon(args)) => run_daemon(args).await,
        #[cfg(feature = "stdio")]
        Some(Commands::McpStdio) => {
            logging::init(logging::level_from_env(LogLevel::Warn), LogFormat::from_env());
            warmsearch::mcp::serve_stdio(ClientConfig::from_env())
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))
        }
        Some(Commands::Version(args)) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "warmsearch",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("warmsearch {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
            Ok(())
        }
        None => run_client(cli).await,
    }
}
