//! HTTP variants of the catalogue, underwriting and payment clients.
//!
//! Provider payloads differ in field naming; every client normalizes them
//! into the core contracts so the flow engine sees one shape regardless of
//! which variant is wired in.

pub mod catalogue;
pub mod normalize;
pub mod payment;
pub mod transport;
pub mod underwriting;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use insureflow_core::config::{IntegrationMode, IntegrationsConfig};
use insureflow_core::integrations::IntegrationClients;

pub use catalogue::HttpCatalogueClient;
pub use payment::HttpPaymentClient;
pub use transport::HttpTransport;
pub use underwriting::HttpUnderwritingClient;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("`{0}` must be set when integrations.mode is `real`")]
    MissingUrl(&'static str),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Selects the client variant for this process from configuration.
pub fn build_clients(config: &IntegrationsConfig) -> Result<IntegrationClients, BuildError> {
    match config.mode {
        IntegrationMode::Mock => {
            info!(event_name = "integrations.mode.selected", mode = "mock", "using mock integrations");
            Ok(IntegrationClients::mock())
        }
        IntegrationMode::Real => {
            let catalogue = transport(config, "integrations.catalogue_url", &config.catalogue_url)?;
            let underwriting =
                transport(config, "integrations.underwriting_url", &config.underwriting_url)?;
            let payment = transport(config, "integrations.payment_url", &config.payment_url)?;
            info!(event_name = "integrations.mode.selected", mode = "real", "using HTTP integrations");
            Ok(IntegrationClients {
                catalogue: Arc::new(HttpCatalogueClient::new(catalogue)),
                underwriting: Arc::new(HttpUnderwritingClient::new(underwriting)),
                payment: Arc::new(HttpPaymentClient::new(payment)),
            })
        }
    }
}

fn transport(
    config: &IntegrationsConfig,
    key: &'static str,
    url: &Option<String>,
) -> Result<HttpTransport, BuildError> {
    let base_url = url.as_deref().ok_or(BuildError::MissingUrl(key))?;
    Ok(HttpTransport::new(base_url, config.api_key.clone(), config.timeout_secs)?)
}
