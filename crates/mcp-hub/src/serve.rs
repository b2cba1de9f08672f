//! Process entry point for the `serve` subcommand: resolves a [`Layout`],
//! loads backend configuration, starts the [`Hub`] and (optionally) the
//! upstream HTTP transport, then waits for Ctrl+C. No control socket, RPC
//! socket or project registry: a single hub instance needs none of them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::clock::{SystemClock, SystemRandom};
use crate::config::load_backend_configs;
use crate::credential::EnvCredentialProvider;
use crate::events::InMemoryEventSink;
use crate::hub::Hub;
use crate::paths::{Layout, default_root};
use crate::web::http::{self, HttpState};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Override the workspace root directory (defaults to $MCP_HUB_ROOT or ~/.mcp-hub).
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Bind address for the upstream MCP HTTP endpoint (e.g. 127.0.0.1:8787).
    /// Omit to run with no HTTP transport (stdio-only deployments wire the
    /// virtual endpoint directly; not exposed by this binary today).
    #[arg(long, value_name = "ADDR")]
    pub http_bind: Option<SocketAddr>,
    /// Shared-secret token required of upstream clients (fallback env MCP_HUB_HTTP_TOKEN).
    #[arg(long, value_name = "TOKEN")]
    pub http_auth_token: Option<String>,
    /// Expose only the meta-tools (chain execution, discovery), hiding every
    /// backend-sourced capability from list_tools/list_resources/list_prompts.
    #[arg(long)]
    pub meta_only: bool,
}

pub async fn run(mut args: ServeArgs) -> Result<()> {
    let layout = resolve_layout(args.root.clone())?;
    layout.ensure()?;
    let _tracing_guard = init_tracing(&layout)?;

    if let Err(err) = run_impl(layout, &mut args).await {
        error!(error = ?err, "hub terminated with error");
        return Err(err);
    }
    info!("hub exited cleanly");
    Ok(())
}

async fn run_impl(layout: Layout, args: &mut ServeArgs) -> Result<()> {
    let ServeArgs { http_bind, http_auth_token, meta_only, .. } = args;
    let http_bind = *http_bind;
    let meta_only = *meta_only;
    let mut http_auth_token = http_auth_token.take();
    if http_auth_token.is_none() {
        http_auth_token = std::env::var("MCP_HUB_HTTP_TOKEN").ok();
    }

    let config_path = layout.backend_config_path();
    let configs = if config_path.exists() {
        load_backend_configs(&config_path)
            .with_context(|| format!("failed to load backend config {}", config_path.display()))?
    } else {
        warn!(path = %config_path.display(), "no backend config file found, starting with no backends");
        Vec::new()
    };

    let sink = Arc::new(InMemoryEventSink::new(Some(layout.logs_dir().to_path_buf())));
    let hub = Hub::start(
        configs,
        Arc::new(EnvCredentialProvider),
        sink,
        Arc::new(SystemClock::default()),
        Arc::new(SystemRandom),
        meta_only,
    )
    .await
    .context("failed to start hub")?;

    let http_handle = if let Some(addr) = http_bind {
        let state = HttpState {
            endpoint: hub.endpoint.clone(),
            auth: http::HttpAuth::new(http_auth_token.clone()),
        };
        Some(http::spawn_http_server(state, addr).await?)
    } else {
        None
    };

    info!(
        backends = hub.manager.list().await.len(),
        http_addr = http_handle.as_ref().map(|h| h.addr().to_string()),
        "hub ready"
    );

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    match (&mut ctrl_c).await {
        Ok(()) => info!("received Ctrl+C, shutting down hub"),
        Err(err) => warn!(error = ?err, "failed to listen for Ctrl+C"),
    }

    if let Some(handle) = http_handle {
        handle.shutdown();
    }
    hub.shutdown().await;

    info!("hub stopped cleanly");
    Ok(())
}

fn resolve_layout(root_override: Option<PathBuf>) -> Result<Layout> {
    let root = match root_override {
        Some(path) => expand_tilde(path)?,
        None => default_root()?,
    };
    debug!(root = %root.display(), "resolved workspace root");
    Ok(Layout::new(root))
}

fn expand_tilde(path: PathBuf) -> Result<PathBuf> {
    if let Some(str_path) = path.to_str() {
        if let Some(stripped) = str_path.strip_prefix('~') {
            let home = dirs_home().context("cannot expand '~', HOME unset")?;
            if stripped.is_empty() {
                return Ok(home);
            }
            let stripped = stripped.strip_prefix('/').unwrap_or(stripped);
            return Ok(home.join(stripped));
        }
    }
    Ok(path)
}

fn dirs_home() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Some(PathBuf::from(profile));
        }
    }
    None
}

fn init_tracing(layout: &Layout) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();

    let stderr_layer =
        fmt::layer().with_target(true).with_file(true).with_line_number(true).with_writer(std::io::stderr);

    let hub_log_dir = layout.logs_dir().join("hub");
    std::fs::create_dir_all(&hub_log_dir)
        .with_context(|| format!("failed to create hub log directory {}", hub_log_dir.display()))?;
    let file_appender = rolling::hourly(hub_log_dir, "hub.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer =
        fmt::layer().with_target(true).with_file(true).with_line_number(true).json().with_writer(file_writer);

    tracing_subscriber::registry().with(env_filter).with(stderr_layer).with(file_layer).init();

    Ok(guard)
}
