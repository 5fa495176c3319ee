use std::sync::Arc;

use anyhow::Context as _;

use gatekeep_api::app::{router, services::build_services};
use gatekeep_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gatekeep_observability::init();

    let config = ApiConfig::from_env().context("reading configuration")?;
    let bind = config.bind;
    let services = Arc::new(build_services(config)?);
    let app = router(services.clone());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("server error")?;

    services.shutdown();
    Ok(())
}
