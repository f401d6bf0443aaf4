use crate::server::DicomWebServer;
use crate::settings::DicomWebEnvOptions;
use anyhow::Context;

/// Runs the server using configuration from `DICOMWEB_*` environment
/// variables, with in-memory storage backends, until interrupted.
pub async fn run_server_from_env() -> anyhow::Result<()> {
    let settings =
        DicomWebEnvOptions::from_env().context("invalid DICOMWEB_* configuration")?;
    let base_url = settings.base_url();
    let server = DicomWebServer::in_memory(settings);
    server.start().await.context("could not bind listener")?;
    tracing::info!(base_url, "DICOMweb services ready");
    tokio::signal::ctrl_c()
        .await
        .context("could not listen for shutdown signal")?;
    server.stop().await;
    Ok(())
}
