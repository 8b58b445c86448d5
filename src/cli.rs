//! The CLI front end: `start`/`stop`/`status`/`code` subcommands plus a
//! hidden `serve` target used to launch the detached daemon. This is the
//! only caller of the Supervisor's public API.
//!
//! `start`/`stop`/`status`/`code` talk to the daemon purely through the
//! on-disk PID/refcount files and the HTTP `/health` endpoint — never
//! through in-process shared state.

use std::process::Stdio;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::metrics;
use crate::server::{self, AppState};
use crate::supervisor::{wait_for_shutdown_signal, Supervisor};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(150);
const HEALTH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "modelmux")]
#[command(about = "Local reverse proxy that routes a coding assistant's requests across LLM providers")]
pub struct Cli {
    /// Path to the proxy's configuration file.
    #[arg(short, long, env = "MODELMUX_CONFIG", default_value = "~/.modelmux/config.json")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Launch the daemon unless one is already running.
    Start,
    /// Stop the running daemon.
    Stop,
    /// Report whether the daemon is live, its PID, port, and refcount.
    Status,
    /// Ensure the daemon is up, run a child client command against it, and
    /// tear the daemon down again if no other session still needs it.
    Code {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Runs the daemon in the foreground. Not part of the public surface —
    /// `start`/`code` exec this as a detached child of themselves.
    #[command(hide = true)]
    Serve,
}

/// Loads config, wires up logging, and dispatches to the requested
/// subcommand. Returns the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = shellexpand::tilde(&cli.config).into_owned();
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("modelmux: failed to load config {config_path}: {e}");
            return Ok(1);
        }
    };

    let _log_guard = init_tracing(&config);
    tracing::info!(path = %config_path, "loaded configuration");

    let code = match cli.command {
        Command::Start => run_start(&config, &config_path).await,
        Command::Stop => run_stop(),
        Command::Status => run_status(),
        Command::Code { args } => run_code(&config, &config_path, args).await,
        Command::Serve => run_serve(config).await,
    };
    Ok(code)
}

/// Stderr always gets a `fmt` layer; the `log` config flag additionally
/// layers a rolling file appender under the supervisor's state directory,
/// one ISO-8601-prefixed record per line.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "modelmux=info,tower_http=info".into());

    if !config.log_enabled() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return None;
    }

    let dir = crate::supervisor::state_dir();
    std::fs::create_dir_all(&dir).ok();
    let file_appender = tracing_appender::rolling::daily(&dir, "modelmux.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();
    Some(guard)
}

fn daemon_url(config: &Config, path: &str) -> String {
    format!("http://{}:{}{}", config.listen().host, config.listen().port, path)
}

async fn wait_for_health(config: &Config) -> bool {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + HEALTH_WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if client.get(daemon_url(config, "/health")).send().await.is_ok() {
            return true;
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
    false
}

/// Spawns a detached copy of this same binary running `serve`, then waits
/// (bounded) for the HTTP port to answer `/health`.
async fn spawn_detached_daemon(config_path: &str) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("serve")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}

async fn run_start(config: &Config, config_path: &str) -> i32 {
    let supervisor = Supervisor::new();
    match supervisor.live_pid() {
        Ok(Some(pid)) => {
            eprintln!("modelmux: already running (pid {pid})");
            return 1;
        }
        Ok(None) => {}
        Err(e) => {
            eprintln!("modelmux: failed to read daemon state: {e}");
            return 1;
        }
    }

    if let Err(e) = spawn_detached_daemon(config_path).await {
        eprintln!("modelmux: failed to launch daemon: {e}");
        return 1;
    }

    if wait_for_health(config).await {
        println!("modelmux: daemon started on {}:{}", config.listen().host, config.listen().port);
        0
    } else {
        eprintln!("modelmux: daemon did not become healthy within {HEALTH_WAIT_TIMEOUT:?}");
        1
    }
}

fn run_stop() -> i32 {
    let supervisor = Supervisor::new();
    match supervisor.live_pid() {
        Ok(Some(_)) => match supervisor.signal_shutdown() {
            Ok(()) => {
                println!("modelmux: stop signal sent");
                0
            }
            Err(e) => {
                eprintln!("modelmux: failed to signal daemon: {e}");
                1
            }
        },
        Ok(None) => {
            println!("modelmux: no daemon running");
            0
        }
        Err(e) => {
            eprintln!("modelmux: failed to read daemon state: {e}");
            1
        }
    }
}

fn run_status() -> i32 {
    let supervisor = Supervisor::new();
    match supervisor.status() {
        Ok(status) if status.running => {
            println!(
                "running pid={} refcount={}",
                status.pid.unwrap_or_default(),
                status.refcount
            );
            0
        }
        Ok(_) => {
            println!("not running");
            0
        }
        Err(e) => {
            eprintln!("modelmux: failed to read daemon state: {e}");
            1
        }
    }
}

/// Ensures the daemon is up, bumps the refcount, execs the child client
/// with environment overrides pointed at the loopback proxy, then
/// decrements on exit and stops the daemon if no one else needs it.
async fn run_code(config: &Config, config_path: &str, args: Vec<String>) -> i32 {
    let Some((program, child_args)) = args.split_first() else {
        eprintln!("modelmux: `code` requires a command to run");
        return 1;
    };

    let supervisor = Supervisor::new();
    if supervisor.live_pid().ok().flatten().is_none() {
        if spawn_detached_daemon(config_path).await.is_err() || !wait_for_health(config).await {
            eprintln!("modelmux: could not bring the daemon up");
            return 1;
        }
    }

    if let Err(e) = supervisor.increment_refcount() {
        eprintln!("modelmux: failed to bump refcount: {e}");
        return 1;
    }

    let secret = config.shared_secret().unwrap_or("placeholder");
    let status = std::process::Command::new(program)
        .args(child_args)
        .env("ANTHROPIC_BASE_URL", daemon_url(config, ""))
        .env("ANTHROPIC_AUTH_TOKEN", secret)
        .env("API_TIMEOUT_MS", config.request_timeout_ms().to_string())
        .status();

    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("modelmux: failed to launch {program}: {e}");
            1
        }
    };

    match supervisor.decrement_refcount() {
        Ok(0) => {
            let _ = supervisor.signal_shutdown();
        }
        Ok(_) => {}
        Err(e) => eprintln!("modelmux: failed to decrement refcount: {e}"),
    }

    exit_code
}

/// Runs the daemon itself: claims the singleton role, serves HTTP until a
/// shutdown signal arrives, then drains and releases.
async fn run_serve(config: Config) -> i32 {
    let supervisor = Supervisor::new();
    if let Err(e) = supervisor.claim() {
        eprintln!("modelmux: {e}");
        return 1;
    }

    metrics::register();
    let state = AppState::new(config.clone());
    let active_requests = state.active_requests.clone();
    let app = server::build_router(state);

    let listener = match tokio::net::TcpListener::bind((config.listen().host.as_str(), config.listen().port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("modelmux: failed to bind {}:{}: {e}", config.listen().host, config.listen().port);
            supervisor.release();
            return 1;
        }
    };

    tracing::info!(host = %config.listen().host, port = config.listen().port, "serving");

    let shutdown = async {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, draining in-flight requests");
        supervisor.drain(&active_requests).await;
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        tracing::error!(error = %e, "server exited with error");
    }

    supervisor.release();
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;

    fn sample_config() -> Config {
        let json = r#"{
            "listen": {"host": "127.0.0.1", "port": 4000},
            "providers": [{"name":"p1","baseURL":"https://x","apiKey":"k","models":["m1"]}],
            "routes": {"default": "p1,m1"}
        }"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        Config::from_parsed(file).unwrap()
    }

    #[test]
    fn daemon_url_joins_host_port_and_path() {
        let config = sample_config();
        assert_eq!(daemon_url(&config, "/health"), "http://127.0.0.1:4000/health");
        assert_eq!(daemon_url(&config, ""), "http://127.0.0.1:4000");
    }
}
