use async_trait::async_trait;

use insureflow_core::domain::product::Product;
use insureflow_core::errors::IntegrationError;
use insureflow_core::integrations::CatalogueClient;

use crate::normalize;
use crate::transport::HttpTransport;

/// Catalogue provider: `GET /products` and `GET /products/{id}`.
pub struct HttpCatalogueClient {
    transport: HttpTransport,
}

impl HttpCatalogueClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl CatalogueClient for HttpCatalogueClient {
    async fn list_products(&self) -> Result<Vec<Product>, IntegrationError> {
        let payload = self.transport.get_json("list_products", "products").await?;
        normalize::product_list("list_products", &payload)
    }

    async fn get_product(&self, product_id: &str) -> Result<Product, IntegrationError> {
        let path = format!("products/{}", product_id.trim());
        match self.transport.find_json("get_product", &path).await? {
            Some(payload) => normalize::product("get_product", &payload),
            None => Err(IntegrationError::not_found("product", product_id)),
        }
    }
}
