use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use crm_api::app::{AppState, build_app};
use crm_auth::TokenService;
use crm_infra::{AdminBootstrapper, Config, Readiness, Runtime, bootstrap_admin};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    crm_observability::init(&config.logging);

    let runtime = Runtime::start(config.clone())
        .await
        .context("failed to start runtime")?;

    // Resources are closed whether serving ended cleanly or not.
    let served = serve(&runtime, &config).await;
    tracing::info!("shutting down");
    let closed = runtime.shutdown().await;
    served?;
    closed.context("failed to close resources")?;
    Ok(())
}

async fn serve(runtime: &Runtime, config: &Config) -> anyhow::Result<()> {
    let engine = runtime.engine()?;
    let users = runtime.user_store()?;

    let readiness = Arc::new(Readiness::new());
    let bootstrapper = AdminBootstrapper::new(
        users.clone(),
        engine.clone(),
        config.auth.super_admin.clone(),
        config.auth.password,
    );
    bootstrap_admin(&bootstrapper, &readiness, config.lifecycle.init_timeout()).await;

    let tokens = Arc::new(TokenService::new(
        config.auth.jwt_secret.as_bytes(),
        chrono::Duration::minutes(config.auth.token_ttl_minutes),
    ));
    let app = build_app(AppState {
        engine,
        users,
        tokens,
        readiness,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
