use async_trait::async_trait;
use serde_json::json;

use insureflow_core::domain::payment::{PaymentInitiation, PaymentRequest, PaymentStatus};
use insureflow_core::errors::IntegrationError;
use insureflow_core::integrations::PaymentClient;

use crate::normalize;
use crate::transport::HttpTransport;

/// Payment provider: `POST /payments` and `GET /payments/{ref}/status`.
pub struct HttpPaymentClient {
    transport: HttpTransport,
}

impl HttpPaymentClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PaymentClient for HttpPaymentClient {
    async fn initiate_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentInitiation, IntegrationError> {
        let body = json!({
            "session_id": request.session_id,
            "amount": request.amount.to_string(),
            "currency": request.currency,
            "method": request.method,
            "phone_number": request.payer_phone,
            "quote_id": request.quote_id,
        });
        let payload = self.transport.post_json("initiate_payment", "payments", &body).await?;
        normalize::payment_initiation("initiate_payment", &payload)
    }

    async fn check_status(&self, transaction_ref: &str) -> Result<PaymentStatus, IntegrationError> {
        let path = format!("payments/{}/status", transaction_ref.trim());
        match self.transport.find_json("check_status", &path).await? {
            Some(payload) => normalize::payment_status("check_status", &payload),
            None => Err(IntegrationError::not_found("payment", transaction_ref)),
        }
    }
}
