use anyhow::Context;

use civicbrief_infra::BriefsConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    civicbrief_observability::init();

    let config = BriefsConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;

    let app = civicbrief_api::app::build_app(config, civicbrief_api::app::AppOptions::default())
        .await
        .context("failed to wire services")?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
