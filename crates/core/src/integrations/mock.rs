use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::payment::{PaymentInitiation, PaymentRequest, PaymentStatus};
use crate::domain::product::{Product, ProductId};
use crate::domain::quote::{Quote, QuoteDecision, QuoteId, QuoteRequest};
use crate::errors::IntegrationError;
use crate::integrations::{CatalogueClient, PaymentClient, UnderwritingClient};

pub const DEFAULT_CURRENCY: &str = "UGX";
pub const DEFAULT_PREMIUM: i64 = 50_000;

const BUILTIN_PRODUCTS: &[(&str, &str, &str, &str, i64)] = &[
    ("worldwide_essential", "Worldwide Essential", "travel", "Medical and travel cover worldwide", 50_000),
    ("worldwide_elite", "Worldwide Elite", "travel", "Higher limits worldwide, including sports cover", 120_000),
    ("schengen_essential", "Schengen Essential", "travel", "Cover meeting Schengen visa requirements", 60_000),
    ("schengen_elite", "Schengen Elite", "travel", "Extended Schengen cover with trip cancellation", 110_000),
    ("student_cover", "Student Cover", "travel", "Long-stay cover for students studying abroad", 80_000),
    ("africa_asia", "Africa & Asia", "travel", "Regional cover for Africa and Asia", 40_000),
    ("inbound_karibu", "Inbound Karibu", "travel", "Cover for visitors travelling into Uganda", 30_000),
    ("pa_basic", "Personal Accident Basic", "personal_accident", "Essential accident cover", 45_000),
    ("pa_standard", "Personal Accident Standard", "personal_accident", "Broader accident benefits", 90_000),
    ("pa_premium", "Personal Accident Premium", "personal_accident", "Highest accident cover and benefits", 150_000),
    ("motor_third_party", "Motor Third Party", "motor", "Legal third party liability cover", 120_000),
    ("motor_comprehensive", "Motor Comprehensive", "motor", "Own damage, theft and third party cover", 350_000),
    ("serenicare_essential", "Serenicare Essential", "health", "Inpatient UGX 15M per family, outpatient UGX 1.5M per person", 50_000),
    ("serenicare_classic", "Serenicare Classic", "health", "Inpatient UGX 30M per family, outpatient UGX 2M per person", 80_000),
    ("serenicare_comprehensive", "Serenicare Comprehensive", "health", "Inpatient UGX 60M per family, outpatient UGX 3M per person", 120_000),
    ("serenicare_premium", "Serenicare Premium", "health", "Inpatient UGX 100M per family, outpatient UGX 5M per person", 180_000),
];

/// Monthly loading per optional health benefit, charged when its field is true.
const BENEFIT_LOADINGS: &[(&str, i64)] = &[
    ("outpatient", 15_000),
    ("maternity", 20_000),
    ("dental", 8_000),
    ("optical", 7_000),
    ("covid19", 5_000),
];

pub fn builtin_products() -> Vec<Product> {
    BUILTIN_PRODUCTS
        .iter()
        .map(|(id, name, category, description, premium)| Product {
            product_id: ProductId((*id).to_string()),
            name: (*name).to_string(),
            category: (*category).to_string(),
            description: (*description).to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
            base_premium: Decimal::from(*premium),
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct MockCatalogueClient {
    products: Vec<Product>,
}

impl Default for MockCatalogueClient {
    fn default() -> Self {
        Self { products: builtin_products() }
    }
}

impl MockCatalogueClient {
    pub fn with_products(products: Vec<Product>) -> Self {
        Self { products }
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }
}

#[async_trait]
impl CatalogueClient for MockCatalogueClient {
    async fn list_products(&self) -> Result<Vec<Product>, IntegrationError> {
        Ok(self.products.clone())
    }

    async fn get_product(&self, product_id: &str) -> Result<Product, IntegrationError> {
        self.products
            .iter()
            .find(|product| product.product_id.0 == product_id)
            .cloned()
            .ok_or_else(|| IntegrationError::not_found("product", product_id))
    }
}

/// Rule-based pricing with no network access.
///
/// Premium is the product's base premium per traveller, or a share of the sum
/// assured / vehicle value when that is larger, plus any optional benefit
/// loadings. Applicants older than 85 are declined. Vehicles older than 25
/// years and declared pre-existing medical conditions are referred.
#[derive(Clone, Debug)]
pub struct MockUnderwritingClient {
    base_premiums: BTreeMap<String, (Decimal, String)>,
}

impl Default for MockUnderwritingClient {
    fn default() -> Self {
        Self::new(builtin_products())
    }
}

impl MockUnderwritingClient {
    pub fn new(products: Vec<Product>) -> Self {
        let base_premiums = products
            .into_iter()
            .map(|product| (product.product_id.0, (product.base_premium, product.currency)))
            .collect();
        Self { base_premiums }
    }

    fn price(&self, request: &QuoteRequest) -> (Decimal, String) {
        let (base, currency) = request
            .product_id
            .as_ref()
            .and_then(|product_id| self.base_premiums.get(product_id))
            .cloned()
            .unwrap_or_else(|| (Decimal::from(DEFAULT_PREMIUM), DEFAULT_CURRENCY.to_string()));

        let premium = if let Some(sum_assured) = decimal_input(&request.inputs, "sum_assured") {
            base.max(sum_assured * Decimal::new(5, 3))
        } else if let Some(vehicle_value) = decimal_input(&request.inputs, "vehicle_value") {
            base.max(vehicle_value * Decimal::new(4, 2))
        } else {
            let travellers = decimal_input(&request.inputs, "num_travellers")
                .filter(|count| *count > Decimal::ZERO)
                .unwrap_or(Decimal::ONE);
            base * travellers
        };
        let loadings: Decimal = BENEFIT_LOADINGS
            .iter()
            .filter(|(field, _)| request.inputs.get(*field).and_then(Value::as_bool) == Some(true))
            .map(|(_, loading)| Decimal::from(*loading))
            .sum();

        ((premium + loadings).round_dp(0), currency)
    }

    fn decide(&self, request: &QuoteRequest) -> QuoteDecision {
        let today = Utc::now().date_naive();
        let applicant_age = request
            .inputs
            .get("date_of_birth")
            .and_then(Value::as_str)
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
            .map(|born| age_on(born, today));
        if applicant_age.is_some_and(|age| age > 85) {
            return QuoteDecision::Declined;
        }

        let vehicle_age = decimal_input(&request.inputs, "year_of_manufacture")
            .and_then(|year| i32::from_str(&year.trunc().to_string()).ok())
            .map(|year| today.year() - year);
        if vehicle_age.is_some_and(|age| age > 25) {
            return QuoteDecision::Referred;
        }

        let declared_condition = request
            .inputs
            .get("medical_conditions")
            .and_then(Value::as_str)
            .is_some_and(|answer| answer.eq_ignore_ascii_case("yes"));
        if declared_condition {
            return QuoteDecision::Referred;
        }

        QuoteDecision::Approved
    }
}

#[async_trait]
impl UnderwritingClient for MockUnderwritingClient {
    async fn submit_quote(&self, request: &QuoteRequest) -> Result<Quote, IntegrationError> {
        let payload = serde_json::to_string(request)
            .map_err(|error| IntegrationError::decode("submit_quote", error.to_string()))?;
        let digest = hash_payload(&payload);
        let (premium, currency) = self.price(request);

        Ok(Quote {
            quote_id: QuoteId(format!("Q-{}", &digest[..12])),
            premium,
            currency,
            status: self.decide(request),
        })
    }
}

/// Payment simulator. Every initiation is pending; the eventual outcome is a
/// pure function of the transaction reference.
#[derive(Debug, Default)]
pub struct MockPaymentClient {
    initiated: AtomicUsize,
}

impl MockPaymentClient {
    pub fn initiated_count(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentClient for MockPaymentClient {
    async fn initiate_payment(
        &self,
        _request: &PaymentRequest,
    ) -> Result<PaymentInitiation, IntegrationError> {
        self.initiated.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentInitiation {
            transaction_ref: format!("MOCKPAY-{}", Uuid::new_v4().simple()),
            status: PaymentStatus::Pending,
        })
    }

    async fn check_status(&self, transaction_ref: &str) -> Result<PaymentStatus, IntegrationError> {
        let digest = Sha256::digest(transaction_ref.as_bytes());
        Ok(match digest[0] % 10 {
            0 => PaymentStatus::Failed,
            1 => PaymentStatus::Pending,
            _ => PaymentStatus::Completed,
        })
    }
}

fn decimal_input(inputs: &BTreeMap<String, Value>, key: &str) -> Option<Decimal> {
    match inputs.get(key)? {
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        Value::String(text) => Decimal::from_str(text.trim()).ok(),
        _ => None,
    }
}

fn age_on(born: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - born.year();
    if (today.month(), today.day()) < (born.month(), born.day()) {
        age -= 1;
    }
    age
}

pub(crate) fn hash_payload(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{MockCatalogueClient, MockPaymentClient, MockUnderwritingClient};
    use crate::domain::payment::{PaymentRequest, PaymentStatus};
    use crate::domain::quote::{QuoteDecision, QuoteRequest};
    use crate::domain::session::SessionId;
    use crate::errors::IntegrationError;
    use crate::integrations::{CatalogueClient, PaymentClient, UnderwritingClient};

    fn payment_request() -> PaymentRequest {
        PaymentRequest {
            session_id: SessionId::from("s-1"),
            amount: Decimal::from(50_000),
            currency: "UGX".to_owned(),
            method: "mobile_money".to_owned(),
            payer_phone: Some("256772123456".to_owned()),
            quote_id: Some("Q-1".to_owned()),
        }
    }

    #[tokio::test]
    async fn catalogue_lookup_reports_unknown_products() {
        let catalogue = MockCatalogueClient::default();

        let product = catalogue.get_product("worldwide_essential").await.expect("known product");
        assert_eq!(product.name, "Worldwide Essential");

        let error = catalogue.get_product("moon_cover").await.expect_err("unknown product");
        assert!(matches!(error, IntegrationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn travel_premium_scales_with_travellers_and_is_deterministic() {
        let underwriting = MockUnderwritingClient::default();
        let mut inputs = BTreeMap::new();
        inputs.insert("num_travellers".to_owned(), json!(3));
        let request = QuoteRequest {
            flow_id: "travel_insurance".to_owned(),
            product_id: Some("worldwide_essential".to_owned()),
            inputs,
        };

        let first = underwriting.submit_quote(&request).await.expect("quote");
        let second = underwriting.submit_quote(&request).await.expect("quote again");

        assert_eq!(first.premium, Decimal::from(150_000));
        assert_eq!(first.status, QuoteDecision::Approved);
        assert_eq!(first.quote_id, second.quote_id);
        assert!(first.quote_id.0.starts_with("Q-"));
    }

    #[tokio::test]
    async fn unknown_product_uses_default_premium() {
        let underwriting = MockUnderwritingClient::default();
        let request = QuoteRequest {
            flow_id: "travel_insurance".to_owned(),
            product_id: None,
            inputs: BTreeMap::new(),
        };

        let quote = underwriting.submit_quote(&request).await.expect("quote");
        assert_eq!(quote.premium, Decimal::from(50_000));
        assert_eq!(quote.currency, "UGX");
    }

    #[tokio::test]
    async fn health_premium_adds_selected_benefits() {
        let underwriting = MockUnderwritingClient::default();
        let mut inputs = BTreeMap::new();
        inputs.insert("outpatient".to_owned(), json!(true));
        inputs.insert("dental".to_owned(), json!(true));
        inputs.insert("maternity".to_owned(), json!(false));
        inputs.insert("medical_conditions".to_owned(), json!("no"));
        let request = QuoteRequest {
            flow_id: "serenicare".to_owned(),
            product_id: Some("serenicare_classic".to_owned()),
            inputs,
        };

        let quote = underwriting.submit_quote(&request).await.expect("quote");

        assert_eq!(quote.premium, Decimal::from(103_000));
        assert_eq!(quote.status, QuoteDecision::Approved);
    }

    #[tokio::test]
    async fn declared_medical_condition_is_referred() {
        let underwriting = MockUnderwritingClient::default();
        let mut inputs = BTreeMap::new();
        inputs.insert("medical_conditions".to_owned(), json!("yes"));
        let request = QuoteRequest {
            flow_id: "serenicare".to_owned(),
            product_id: Some("serenicare_essential".to_owned()),
            inputs,
        };

        let quote = underwriting.submit_quote(&request).await.expect("quote");

        assert_eq!(quote.status, QuoteDecision::Referred);
        assert_eq!(quote.premium, Decimal::from(50_000));
    }

    #[tokio::test]
    async fn elderly_applicants_are_declined() {
        let underwriting = MockUnderwritingClient::default();
        let mut inputs = BTreeMap::new();
        inputs.insert("date_of_birth".to_owned(), json!("1920-05-01"));
        inputs.insert("sum_assured".to_owned(), json!("25000000"));
        let request = QuoteRequest {
            flow_id: "personal_accident".to_owned(),
            product_id: Some("pa_standard".to_owned()),
            inputs,
        };

        let quote = underwriting.submit_quote(&request).await.expect("quote");
        assert_eq!(quote.status, QuoteDecision::Declined);
        assert_eq!(quote.premium, Decimal::from(125_000));
    }

    #[tokio::test]
    async fn payment_initiation_is_always_pending_with_reference() {
        let payments = MockPaymentClient::default();

        let initiation = payments.initiate_payment(&payment_request()).await.expect("initiate");

        assert_eq!(initiation.status, PaymentStatus::Pending);
        assert!(!initiation.transaction_ref.is_empty());
        assert_eq!(payments.initiated_count(), 1);
    }

    #[tokio::test]
    async fn payment_status_is_stable_per_reference() {
        let payments = MockPaymentClient::default();
        let initiation = payments.initiate_payment(&payment_request()).await.expect("initiate");

        let first = payments.check_status(&initiation.transaction_ref).await.expect("status");
        let second = payments.check_status(&initiation.transaction_ref).await.expect("status");
        assert_eq!(first, second);

        let mut seen = std::collections::BTreeSet::new();
        for index in 0..200 {
            let status = payments.check_status(&format!("MOCKPAY-{index}")).await.expect("status");
            seen.insert(status.as_str());
        }
        assert!(seen.contains("completed"));
        assert!(seen.contains("failed"));
    }
}
