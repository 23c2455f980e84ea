use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::session::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "processing" | "initiated" => Some(Self::Pending),
            "completed" | "success" | "successful" | "paid" => Some(Self::Completed),
            "failed" | "failure" | "declined" | "cancelled" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub session_id: SessionId,
    pub amount: Decimal,
    pub currency: String,
    pub method: String,
    pub payer_phone: Option<String>,
    pub quote_id: Option<String>,
}

/// Acknowledgement of a payment instruction. Always pending at this point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiation {
    pub transaction_ref: String,
    pub status: PaymentStatus,
}
