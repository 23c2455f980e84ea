//! Maps provider payloads onto the core contracts.
//!
//! Providers disagree on field names (`product_id` vs `productId` vs `id`,
//! `premium` vs `premium_amount`, ...). Each reader tries the known aliases in
//! order and fails with a decode error naming the missing contract field.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use insureflow_core::domain::payment::{PaymentInitiation, PaymentStatus};
use insureflow_core::domain::product::{Product, ProductId};
use insureflow_core::domain::quote::{Quote, QuoteDecision, QuoteId};
use insureflow_core::errors::IntegrationError;
use insureflow_core::integrations::mock::DEFAULT_CURRENCY;

pub fn product(operation: &str, payload: &Value) -> Result<Product, IntegrationError> {
    let object = object(operation, payload)?;
    Ok(Product {
        product_id: ProductId(required_text(operation, object, "product_id", &["product_id", "productId", "id"])?),
        name: required_text(operation, object, "name", &["name", "product_name", "productName"])?,
        category: text(object, &["category", "product_category", "productCategory"]).unwrap_or_default(),
        description: text(object, &["description", "summary"]).unwrap_or_default(),
        currency: text(object, &["currency"]).unwrap_or_else(|| DEFAULT_CURRENCY.to_owned()),
        base_premium: required_decimal(
            operation,
            object,
            "base_premium",
            &["base_premium", "premium", "basePremium"],
        )?,
    })
}

/// Accepts a bare array or an envelope with `products` / `data`.
pub fn product_list(operation: &str, payload: &Value) -> Result<Vec<Product>, IntegrationError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(object) => ["products", "data"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_array))
            .ok_or_else(|| IntegrationError::decode(operation, "expected a product array"))?,
        _ => return Err(IntegrationError::decode(operation, "expected a product array")),
    };
    items.iter().map(|item| product(operation, item)).collect()
}

pub fn quote(operation: &str, payload: &Value) -> Result<Quote, IntegrationError> {
    let object = object(operation, payload)?;
    let status_text = required_text(operation, object, "status", &["status", "decision_status", "decision"])?;
    let status = QuoteDecision::parse(&status_text).ok_or_else(|| {
        IntegrationError::decode(operation, format!("unknown quote decision `{status_text}`"))
    })?;
    Ok(Quote {
        quote_id: QuoteId(required_text(operation, object, "quote_id", &["quote_id", "quoteId", "id"])?),
        premium: required_decimal(operation, object, "premium", &["premium", "premium_amount", "premiumAmount"])?,
        currency: text(object, &["currency"]).unwrap_or_else(|| DEFAULT_CURRENCY.to_owned()),
        status,
    })
}

/// Initiation is reported as pending whatever the provider says; completion
/// is only ever learned through a status check.
pub fn payment_initiation(operation: &str, payload: &Value) -> Result<PaymentInitiation, IntegrationError> {
    let object = object(operation, payload)?;
    Ok(PaymentInitiation {
        transaction_ref: required_text(
            operation,
            object,
            "transaction_ref",
            &["transaction_ref", "reference", "transactionRef", "transaction_id"],
        )?,
        status: PaymentStatus::Pending,
    })
}

pub fn payment_status(operation: &str, payload: &Value) -> Result<PaymentStatus, IntegrationError> {
    let object = object(operation, payload)?;
    let raw = required_text(operation, object, "status", &["status", "payment_status", "state"])?;
    PaymentStatus::parse(&raw)
        .ok_or_else(|| IntegrationError::decode(operation, format!("unknown payment status `{raw}`")))
}

fn object<'a>(operation: &str, payload: &'a Value) -> Result<&'a Map<String, Value>, IntegrationError> {
    payload.as_object().ok_or_else(|| IntegrationError::decode(operation, "expected a JSON object"))
}

fn text(object: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|key| match object.get(*key)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_owned()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    })
}

fn required_text(
    operation: &str,
    object: &Map<String, Value>,
    field: &str,
    aliases: &[&str],
) -> Result<String, IntegrationError> {
    text(object, aliases).ok_or_else(|| IntegrationError::decode(operation, format!("missing `{field}`")))
}

fn required_decimal(
    operation: &str,
    object: &Map<String, Value>,
    field: &str,
    aliases: &[&str],
) -> Result<Decimal, IntegrationError> {
    let raw = required_text(operation, object, field, aliases)?;
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| IntegrationError::decode(operation, format!("`{field}` is not a number: {raw}")))
}
