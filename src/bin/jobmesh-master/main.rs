use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobmesh::app::AppState;
use jobmesh::config::{Args, Config};
use jobmesh::dispatch::{self, DispatchConfig};
use jobmesh::health::{self, HealthConfig, ProbeOutcome};
use jobmesh::http::build_router;
use jobmesh::store::Store;

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if debug {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug);

    match run(args).await {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            tracing::error!(error = %err, "fatal error");
            ExitCode::from(2)
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_args(&args).context("building configuration from arguments")?;

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;

    if config.requeue_running_on_start {
        tokio::time::sleep(config.requeue_grace).await;
        match store.fail_stale_running().await {
            Ok(count) if count > 0 => tracing::warn!(count, "swept stale RUNNING jobs to FAILED on startup"),
            Ok(_) => {},
            Err(err) => tracing::error!(error = %err, "startup sweep of stale RUNNING jobs failed"),
        }
    }

    let bind_addr = (config.http_host, config.http_port);
    let probe_interval = config.probe_interval;
    let probe_timeout = config.probe_timeout;
    let dispatch_interval = config.dispatch_interval;

    let state = AppState::new(store, config);
    let shutdown = state.shutdown.clone();

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}:{}", bind_addr.0, bind_addr.1))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let health_state = state.clone();
    let health_shutdown = shutdown.clone();
    let health_handle = tokio::spawn(async move {
        health::run(
            &health_state.registry,
            HealthConfig { probe_interval, probe_timeout },
            health_shutdown,
            |node_id| {
                let state = health_state.clone();
                async move {
                    // Mirrors `client.connection.ping()` + a bounded wait in
                    // the original master: queue a real WebSocket `Ping`
                    // through the connection's writer task and wait for the
                    // matching `Pong` on the read loop. `run` wraps this
                    // whole future in `probe_timeout`, so a node that never
                    // pongs back surfaces as `TimedOut`, not `Alive`.
                    let Some(client) = state.registry.get(node_id).await else {
                        return ProbeOutcome::Closed;
                    };
                    let pong = client.pong_signal();
                    let notified = pong.notified();
                    client.send_ping(Vec::new());
                    notified.await;
                    ProbeOutcome::Alive
                }
            },
        )
        .await;
    });

    let dispatch_state = state.clone();
    let dispatch_shutdown = shutdown.clone();
    let dispatch_handle = tokio::spawn(async move {
        dispatch::run(
            &dispatch_state.store,
            &dispatch_state.registry,
            &dispatch_state.config,
            DispatchConfig { interval: dispatch_interval, candidate_limit: 200 },
            dispatch_shutdown,
        )
        .await;
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            signal_shutdown.cancel();
        }
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    shutdown.cancel();
    let _ = tokio::join!(health_handle, dispatch_handle);
    state.store.close().await;

    Ok(())
}
