use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::IntegrationsConfig;
use crate::domain::payment::{PaymentInitiation, PaymentRequest, PaymentStatus};
use crate::domain::product::Product;
use crate::domain::quote::{Quote, QuoteRequest};
use crate::errors::IntegrationError;
use crate::integrations::IntegrationClients;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GatewaySettings {
    pub timeout: Duration,
    pub read_retries: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), read_retries: 2 }
    }
}

impl From<&IntegrationsConfig> for GatewaySettings {
    fn from(config: &IntegrationsConfig) -> Self {
        Self { timeout: Duration::from_secs(config.timeout_secs), read_retries: config.read_retries }
    }
}

/// Boundary in front of the integration clients.
///
/// Every call is bounded by the configured timeout. Read-only calls are
/// retried on transient failures; quote submission and payment initiation
/// run exactly once.
#[derive(Clone)]
pub struct IntegrationGateway {
    clients: IntegrationClients,
    settings: GatewaySettings,
}

impl IntegrationGateway {
    pub fn new(clients: IntegrationClients, settings: GatewaySettings) -> Self {
        Self { clients, settings }
    }

    /// Upper bound of a single provider call.
    pub fn call_timeout(&self) -> Duration {
        self.settings.timeout
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, IntegrationError> {
        self.read("list_products", || self.clients.catalogue.list_products()).await
    }

    pub async fn get_product(&self, product_id: &str) -> Result<Product, IntegrationError> {
        self.read("get_product", || self.clients.catalogue.get_product(product_id)).await
    }

    pub async fn check_status(&self, transaction_ref: &str) -> Result<PaymentStatus, IntegrationError> {
        self.read("check_status", || self.clients.payment.check_status(transaction_ref)).await
    }

    pub async fn submit_quote(&self, request: &QuoteRequest) -> Result<Quote, IntegrationError> {
        self.once("submit_quote", self.clients.underwriting.submit_quote(request)).await
    }

    pub async fn initiate_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentInitiation, IntegrationError> {
        self.once("initiate_payment", self.clients.payment.initiate_payment(request)).await
    }

    async fn once<T, F>(&self, operation: &'static str, call: F) -> Result<T, IntegrationError>
    where
        F: Future<Output = Result<T, IntegrationError>>,
    {
        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(IntegrationError::Timeout {
                operation: operation.to_string(),
                timeout_secs: self.settings.timeout.as_secs(),
            }),
        }
    }

    async fn read<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, IntegrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        let mut attempt = 0;
        loop {
            match self.once(operation, call()).await {
                Err(error) if error.is_retryable() && attempt < self.settings.read_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "integration.read.retry",
                        operation,
                        attempt,
                        error = %error,
                        "retrying read-only integration call"
                    );
                }
                result => return result,
            }
        }
    }
}
