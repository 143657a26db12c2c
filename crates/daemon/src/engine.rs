//! Engine — lifecycle supervisor for the daemon.
//!
//! Startup: open the store (fatal on failure), wire the scheduler and the
//! HTTP ingress as two supervised tasks, install signal handlers, block.
//!
//! Shutdown state machine: Idle → Draining → Stopped. Draining cancels
//! the scheduler (no new claims) and the ingress (no new requests), waits
//! up to 30 s for in-flight executions, aborts stragglers, then closes
//! the store. The ingress may accept pulse creations for a short window
//! after draining begins; those pulses simply wait for the next start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use reeve_domain::config::Config;

use crate::api;
use crate::executor::PulseExecutor;
use crate::scheduler::Scheduler;
use crate::sentinel::Sentinel;
use crate::state::AppState;
use crate::store::PulseStore;

/// Grace window for in-flight executions during drain.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

pub struct Engine {
    config: Arc<Config>,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal. Returns an error only on fatal
    /// startup failure.
    pub async fn run(&self) -> anyhow::Result<()> {
        let config = self.config.clone();
        tracing::info!(
            db = %config.db_path.display(),
            desk = %config.desk_path.display(),
            max_concurrent = config.max_concurrent,
            "reeve engine starting"
        );

        // ── Store (fatal on failure) ─────────────────────────────────
        let store = PulseStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening pulse store at {}", config.db_path.display()))?;

        // ── Components ───────────────────────────────────────────────
        let executor = Arc::new(PulseExecutor::new(
            config.agent_command.clone(),
            config.desk_path.clone(),
        ));
        let sentinel = Arc::new(Sentinel::from_config(&config));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            executor,
            sentinel,
            config.max_concurrent,
        ));

        // ── Shutdown signal ──────────────────────────────────────────
        let shutdown = CancellationToken::new();
        spawn_signal_listener(shutdown.clone());

        // ── Scheduler task ───────────────────────────────────────────
        let scheduler_task = {
            let scheduler = scheduler.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        // ── HTTP ingress task ────────────────────────────────────────
        let state = AppState::new(config.clone(), store.clone());
        let app = api::router(state);
        let addr = format!("127.0.0.1:{}", config.api_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding API to {addr}"))?;
        tracing::info!(addr = %addr, "pulse API listening");

        let api_task = {
            let token = shutdown.clone();
            tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "API server error");
                }
            })
        };

        // ── Block until shutdown ─────────────────────────────────────
        shutdown.cancelled().await;
        tracing::info!("shutdown signal received, draining");

        // ── Draining ─────────────────────────────────────────────────
        let _ = scheduler_task.await;
        scheduler.drain(DRAIN_GRACE).await;
        let _ = api_task.await;
        store.close().await;

        tracing::info!("reeve engine stopped");
        Ok(())
    }
}

/// Install SIGINT/SIGTERM handlers that fire the shutdown token.
pub fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let sigint = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "installing SIGTERM handler failed");
                    let _ = sigint.await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = sigint => tracing::info!("received SIGINT"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = sigint.await;
            tracing::info!("received ctrl-c");
        }
        shutdown.cancel();
    });
}
