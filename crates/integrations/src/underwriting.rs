use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use insureflow_core::domain::quote::{Quote, QuoteRequest};
use insureflow_core::errors::IntegrationError;
use insureflow_core::integrations::UnderwritingClient;

use crate::normalize;
use crate::transport::HttpTransport;

/// Underwriting provider: `POST /quotes`.
pub struct HttpUnderwritingClient {
    transport: HttpTransport,
}

impl HttpUnderwritingClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl UnderwritingClient for HttpUnderwritingClient {
    async fn submit_quote(&self, request: &QuoteRequest) -> Result<Quote, IntegrationError> {
        let body = json!({
            "product_type": request.flow_id,
            "product_id": request.product_id,
            "details": request.inputs,
        });
        let payload = self.transport.post_json("submit_quote", "quotes", &body).await?;
        let quote = normalize::quote("submit_quote", &payload)?;
        info!(
            event_name = "integration.quote.received",
            quote_id = %quote.quote_id.0,
            decision = quote.status.as_str(),
            "underwriting decision received"
        );
        Ok(quote)
    }
}
