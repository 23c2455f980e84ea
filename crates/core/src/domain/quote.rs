use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteDecision {
    Approved,
    Referred,
    Declined,
}

impl QuoteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Referred => "referred",
            Self::Declined => "declined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" | "accepted" => Some(Self::Approved),
            "referred" | "pending" | "review" => Some(Self::Referred),
            "declined" | "rejected" => Some(Self::Declined),
            _ => None,
        }
    }
}

/// Inputs collected by a flow and forwarded to underwriting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub flow_id: String,
    pub product_id: Option<String>,
    pub inputs: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: QuoteId,
    pub premium: Decimal,
    pub currency: String,
    pub status: QuoteDecision,
}
