use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Immutable description of one product journey.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_id: String,
    pub display_name: String,
    pub triggers: Vec<String>,
    pub product_category: Option<String>,
    pub completion_message: String,
    pub steps: Vec<StepDefinition>,
}

impl FlowDefinition {
    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn steps_total(&self) -> usize {
        self.steps.len()
    }

    pub fn last_step_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_name: String,
    pub prompt: String,
    pub fields: Vec<FieldSpec>,
    /// Present the catalogue products of the flow's category with this step.
    pub lists_products: bool,
    pub action: StepAction,
}

impl StepDefinition {
    pub fn required_fields(&self) -> Vec<&str> {
        self.fields.iter().filter(|field| field.required).map(|field| field.name.as_str()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub label: String,
    pub required: bool,
    pub format: FieldFormat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldFormat {
    Text,
    Email,
    Phone,
    Date { not_future: bool },
    Integer { min: Option<i64>, max: Option<i64> },
    Number { min: Option<Decimal> },
    Boolean { must_be_true: bool },
    OneOf { options: Vec<String> },
    Pattern { pattern: String, hint: Option<String> },
}

/// Integration work performed once a step's fields validate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    None,
    LookupProduct { field: String },
    SubmitQuote,
    InitiatePayment,
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::LookupProduct { .. } => "lookup_product",
            Self::SubmitQuote => "submit_quote",
            Self::InitiatePayment => "initiate_payment",
        }
    }

    /// Whether the action changes state at a provider and must not repeat.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Self::SubmitQuote | Self::InitiatePayment)
    }
}
