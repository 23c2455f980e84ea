//! Integration client port.
//!
//! Each external capability (catalogue, underwriting, payment) is a trait with
//! a deterministic mock in [`mock`] and an HTTP implementation in the
//! `insureflow-integrations` crate. The variant is chosen once when the
//! process starts; the flow engine only ever talks to [`IntegrationGateway`].

pub mod gateway;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::payment::{PaymentInitiation, PaymentRequest, PaymentStatus};
use crate::domain::product::Product;
use crate::domain::quote::{Quote, QuoteRequest};
use crate::errors::IntegrationError;

pub use gateway::{GatewaySettings, IntegrationGateway};
pub use mock::{MockCatalogueClient, MockPaymentClient, MockUnderwritingClient};

#[async_trait]
pub trait CatalogueClient: Send + Sync {
    async fn list_products(&self) -> Result<Vec<Product>, IntegrationError>;

    /// Fails with [`IntegrationError::NotFound`] for unknown ids.
    async fn get_product(&self, product_id: &str) -> Result<Product, IntegrationError>;
}

#[async_trait]
pub trait UnderwritingClient: Send + Sync {
    async fn submit_quote(&self, request: &QuoteRequest) -> Result<Quote, IntegrationError>;
}

#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Starts a payment. A successful call is always reported as pending.
    async fn initiate_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentInitiation, IntegrationError>;

    async fn check_status(&self, transaction_ref: &str) -> Result<PaymentStatus, IntegrationError>;
}

/// The three capability clients selected for this process.
#[derive(Clone)]
pub struct IntegrationClients {
    pub catalogue: Arc<dyn CatalogueClient>,
    pub underwriting: Arc<dyn UnderwritingClient>,
    pub payment: Arc<dyn PaymentClient>,
}

impl IntegrationClients {
    pub fn mock() -> Self {
        let catalogue = MockCatalogueClient::default();
        let underwriting = MockUnderwritingClient::new(catalogue.products().to_vec());
        Self {
            catalogue: Arc::new(catalogue),
            underwriting: Arc::new(underwriting),
            payment: Arc::new(MockPaymentClient::default()),
        }
    }
}
