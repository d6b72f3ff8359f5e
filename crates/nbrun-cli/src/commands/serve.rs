//! `nbrun serve` command.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use nbrun_host::http::{HttpState, spawn_http_server};
use nbrun_host::{ExecutionStack, HostConfig, KernelManager, KernelSpec, NotebookStore};
use tokio::sync::broadcast;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "NBRUN_BIND")]
    pub bind: Option<SocketAddr>,

    /// Kernel spec, `NAME=COMMAND ARGS...` (repeatable)
    #[arg(
        long = "kernel",
        value_name = "NAME=COMMAND",
        value_parser = KernelSpec::parse
    )]
    pub kernels: Vec<KernelSpec>,

    /// Start a kernel from the named spec at boot (repeatable)
    #[arg(long = "start", value_name = "NAME")]
    pub start: Vec<String>,

    /// Seconds an unretrieved result is kept
    #[arg(long, env = "NBRUN_RESULT_TTL_SECS")]
    pub result_ttl_secs: Option<u64>,

    /// Seconds between sweeps for expired results
    #[arg(long, env = "NBRUN_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: Option<u64>,

    /// Tell kernels not to ask for interactive input
    #[arg(long)]
    pub no_stdin: bool,
}

impl ServeArgs {
    fn apply(&self, config: &mut HostConfig) {
        if let Some(bind) = self.bind {
            config.http.bind = bind;
        }
        if let Some(secs) = self.result_ttl_secs {
            config.result_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sweep_interval_secs {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if self.no_stdin {
            config.allow_stdin = false;
        }
        for spec in &self.kernels {
            config.upsert_kernel_spec(spec.clone());
        }
    }
}

pub async fn cmd_serve(args: &ServeArgs) -> Result<()> {
    let mut config = HostConfig::from_env();
    args.apply(&mut config);

    let kernels = Arc::new(KernelManager::from_config(&config));
    for name in &args.start {
        let kernel_id = kernels
            .start(name)
            .with_context(|| format!("start kernel {name}"))?;
        tracing::info!(kernel = %kernel_id, spec = %name, "kernel started");
    }

    let documents = Arc::new(NotebookStore::new());
    let stack = ExecutionStack::new(kernels.clone(), documents.clone(), config.result_ttl);
    stack.spawn_sweeper(config.sweep_interval);

    let (shutdown_tx, _) = broadcast::channel(1);

    // Handle Ctrl-C and SIGTERM for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_tx_clone.send(());
    });

    let http_bind = config.http.bind;
    let state = HttpState::new(
        stack.clone(),
        kernels.clone(),
        documents,
        shutdown_tx.clone(),
    );
    let handle = spawn_http_server(config.http.clone(), state);
    tracing::info!(
        "HTTP docs available at http://{}/api/docs/ (OpenAPI: /api/openapi.json)",
        http_bind
    );
    handle.await.context("http server task")?;

    stack.shutdown();
    kernels.shutdown_all();
    Ok(())
}
