//! `foreman`: Kanban orchestrator for sandboxed agent coding sessions.
//!
//! `foreman run [flags] [workspace ...]` starts the HTTP server; `foreman
//! env` prints configuration diagnostics. Fatal initialization errors exit
//! with code 1.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent_runner::{recover_orphaned_tasks, Runner, RunnerConfig};
use foreman_core::Store;

use crate::state::AppState;

const DEFAULT_SANDBOX_IMAGE: &str = "ghcr.io/foreman-dev/sandbox:latest";
const DEFAULT_CONTAINER_CMD: &str = "docker";
const DEFAULT_ADDR: &str = "127.0.0.1:8080";
const TOKEN_KEY: &str = "CLAUDE_CODE_OAUTH_TOKEN";
const TOKEN_PLACEHOLDER: &str = "your-oauth-token-here";

#[derive(Parser)]
#[command(name = "foreman", version, about = "Kanban orchestrator for sandboxed agent coding sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the Kanban server
    Run(RunArgs),
    /// Show configuration and env file status
    Env,
}

#[derive(Args)]
struct RunArgs {
    /// Listen address (env: ADDR)
    #[arg(long)]
    addr: Option<String>,

    /// Data directory (env: DATA_DIR)
    #[arg(long)]
    data: Option<PathBuf>,

    /// Container runtime command (env: CONTAINER_CMD)
    #[arg(long)]
    container: Option<String>,

    /// Sandbox container image (env: SANDBOX_IMAGE)
    #[arg(long)]
    image: Option<String>,

    /// Env file for the agent container token (env: ENV_FILE)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log output format: "text" or "json" (env: LOG_FORMAT)
    #[arg(long)]
    log_format: Option<String>,

    /// Directories to mount in the sandbox (default: current directory)
    #[arg(value_name = "workspace")]
    workspaces: Vec<PathBuf>,
}

fn env_or(value: Option<String>, key: &str, fallback: &str) -> String {
    value
        .or_else(|| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| fallback.to_string())
}

fn env_or_path(value: Option<PathBuf>, key: &str, fallback: PathBuf) -> PathBuf {
    value
        .or_else(|| std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or(fallback)
}

fn config_dir() -> anyhow::Result<PathBuf> {
    let base = directories::BaseDirs::new().context("cannot determine home directory")?;
    Ok(base.home_dir().join(".foreman"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Run(args) => run_server(args).await,
        Command::Env => {
            env_check();
            Ok(())
        }
    }
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let ansi = std::env::var_os("NO_COLOR").is_none()
        && std::env::var("TERM").map(|term| term != "dumb").unwrap_or(true);

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(ansi)
            .init();
    }
}

async fn run_server(args: RunArgs) -> anyhow::Result<()> {
    let log_format = env_or(args.log_format, "LOG_FORMAT", "text");
    init_logging(&log_format);

    let config_dir = config_dir()?;
    let data_dir = env_or_path(args.data, "DATA_DIR", config_dir.join("data"));
    let env_file = env_or_path(args.env_file, "ENV_FILE", config_dir.join(".env"));
    let container_cmd = env_or(args.container, "CONTAINER_CMD", DEFAULT_CONTAINER_CMD);
    let sandbox_image = env_or(args.image, "SANDBOX_IMAGE", DEFAULT_SANDBOX_IMAGE);
    let addr = env_or(args.addr, "ADDR", DEFAULT_ADDR);

    init_config_dir(&config_dir, &env_file)?;

    // Positional args are workspace directories; default to the cwd.
    let mut workspaces = args.workspaces;
    if workspaces.is_empty() {
        workspaces.push(std::env::current_dir().context("getwd")?);
    }
    let mut resolved = Vec::with_capacity(workspaces.len());
    for workspace in workspaces {
        let abs = workspace
            .canonicalize()
            .with_context(|| format!("resolve workspace {}", workspace.display()))?;
        if !abs.is_dir() {
            bail!("workspace is not a directory: {}", abs.display());
        }
        resolved.push(abs);
    }

    let store = Arc::new(Store::open(&data_dir).await.context("open store")?);
    info!(path = %data_dir.display(), "store loaded");

    let worktrees_dir = config_dir.join("worktrees");
    tokio::fs::create_dir_all(&worktrees_dir)
        .await
        .context("create worktrees dir")?;

    ensure_image(&container_cmd, &sandbox_image).await;

    let runner = Runner::new(
        store.clone(),
        RunnerConfig {
            command: container_cmd,
            sandbox_image,
            env_file: Some(env_file),
            workspaces: resolved.clone(),
            worktrees_dir,
        },
    );

    runner.prune_orphaned_worktrees().await;
    recover_orphaned_tasks(&store).await;
    runner.spawn_container_monitor();

    info!(
        workspaces = %resolved
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
        "workspaces"
    );

    let app = routes::router(AppState::new(store, runner, resolved));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            // Fall back to an ephemeral port on the same host.
            warn!(%addr, error = %err, "requested address unavailable, finding free port");
            let host = addr
                .rsplit_once(':')
                .map(|(host, _)| host)
                .filter(|host| !host.is_empty())
                .unwrap_or("127.0.0.1");
            tokio::net::TcpListener::bind((host, 0))
                .await
                .context("listen")?
        }
    };

    let local_addr: SocketAddr = listener.local_addr().context("local addr")?;
    info!(addr = %local_addr, "listening");

    axum::serve(listener, app).await.context("server")?;
    Ok(())
}

/// Create the config directory and a `.env` token template on first run.
fn init_config_dir(config_dir: &Path, env_file: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(config_dir).context("create config dir")?;

    if !env_file.exists() {
        std::fs::write(env_file, format!("{TOKEN_KEY}={TOKEN_PLACEHOLDER}\n"))
            .context("create env file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(env_file, std::fs::Permissions::from_mode(0o600));
        }
        info!(path = %env_file.display(), "created env file — edit it and set your agent token");
    }
    Ok(())
}

/// Pull the sandbox image when it is not present locally. Failures are
/// warnings: a transient network issue must not prevent startup, and the
/// first container run will surface a truly missing image.
async fn ensure_image(container_cmd: &str, image: &str) {
    let present = tokio::process::Command::new(container_cmd)
        .args(["images", "-q", image])
        .output()
        .await
        .map(|out| out.status.success() && !String::from_utf8_lossy(&out.stdout).trim().is_empty())
        .unwrap_or(false);
    if present {
        return;
    }

    info!(image, "sandbox image not found locally, pulling from registry");
    let pulled = tokio::process::Command::new(container_cmd)
        .args(["pull", image])
        .status()
        .await;
    match pulled {
        Ok(status) if status.success() => {}
        Ok(_) | Err(_) => {
            warn!(image, "failed to pull sandbox image; tasks may fail if the image is unavailable");
        }
    }
}

/// `foreman env`: print configuration and diagnose the local setup.
fn env_check() {
    let config_dir = match config_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("[!] {err}");
            std::process::exit(1);
        }
    };
    let env_file = env_or_path(None, "ENV_FILE", config_dir.join(".env"));
    let data_dir = env_or_path(None, "DATA_DIR", config_dir.join("data"));
    let container_cmd = env_or(None, "CONTAINER_CMD", DEFAULT_CONTAINER_CMD);
    let image = env_or(None, "SANDBOX_IMAGE", DEFAULT_SANDBOX_IMAGE);

    println!("Config directory:  {}", config_dir.display());
    println!("Data directory:    {}", data_dir.display());
    println!("Env file:          {}", env_file.display());
    println!("Container command: {container_cmd}");
    println!("Sandbox image:     {image}");
    println!();

    match std::fs::metadata(&config_dir) {
        Err(_) => println!("[!] Config directory does not exist (run 'foreman run' to auto-create)"),
        Ok(meta) if !meta.is_dir() => println!("[!] {} is not a directory", config_dir.display()),
        Ok(_) => println!("[ok] Config directory exists"),
    }

    let raw = match std::fs::read_to_string(&env_file) {
        Ok(raw) => raw,
        Err(_) => {
            println!("[!] Env file not found: {}", env_file.display());
            println!("    Run 'foreman run' once to auto-create a template, then set your token.");
            return;
        }
    };
    println!("[ok] Env file exists");

    let mut token_set = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() == TOKEN_KEY {
            let value = value.trim();
            if value.is_empty() || value == TOKEN_PLACEHOLDER {
                println!("[!] {TOKEN_KEY} is not set — edit {}", env_file.display());
            } else {
                println!(
                    "[ok] {TOKEN_KEY} is set ({}...{})",
                    &value[..value.len().min(4)],
                    &value[value.len().saturating_sub(4)..]
                );
                token_set = true;
            }
        }
    }
    if !token_set {
        println!("[!] {TOKEN_KEY} not found in {}", env_file.display());
    }

    let runtime_ok = std::process::Command::new(&container_cmd)
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !runtime_ok {
        println!("[!] Container runtime not found: {container_cmd}");
        return;
    }
    println!("[ok] Container runtime found: {container_cmd}");

    let image_present = std::process::Command::new(&container_cmd)
        .args(["images", "-q", &image])
        .output()
        .map(|out| out.status.success() && !String::from_utf8_lossy(&out.stdout).trim().is_empty())
        .unwrap_or(false);
    if image_present {
        println!("[ok] Sandbox image found: {image}");
    } else {
        println!("[!] Sandbox image not found locally: {image}");
        println!("    Run 'foreman run' to pull it automatically, or manually:");
        println!("    {container_cmd} pull {image}");
    }
}
