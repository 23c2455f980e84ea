use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::config::FlowsConfig;
use crate::flows::definition::{FieldFormat, FieldSpec, FlowDefinition, StepAction, StepDefinition};

/// Flow definitions compiled into the binary.
pub const BUILTIN_FLOWS: &str = include_str!("../../../../config/flows.toml");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not read flow definitions `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse flow definitions: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid flow definition: {0}")]
    Invalid(String),
}

/// Read-only lookup of every flow known to the process.
#[derive(Clone, Debug, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, FlowDefinition>,
    order: Vec<String>,
}

impl FlowRegistry {
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_toml_str(BUILTIN_FLOWS)
    }

    pub fn load(config: &FlowsConfig) -> Result<Self, RegistryError> {
        match &config.definitions_path {
            Some(path) => Self::load_from_path(path),
            None => Self::builtin(),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self, RegistryError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| RegistryError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, RegistryError> {
        let document: RegistryDocument = toml::from_str(raw)?;
        let mut registry = Self::default();

        for raw_flow in document.flows {
            let flow = compile_flow(raw_flow)?;
            if registry.flows.contains_key(&flow.flow_id) {
                return Err(RegistryError::Invalid(format!(
                    "flow `{}` is defined more than once",
                    flow.flow_id
                )));
            }
            registry.order.push(flow.flow_id.clone());
            registry.flows.insert(flow.flow_id.clone(), flow);
        }

        if registry.flows.is_empty() {
            return Err(RegistryError::Invalid("no flows are defined".to_string()));
        }

        Ok(registry)
    }

    pub fn get(&self, flow_id: &str) -> Option<&FlowDefinition> {
        self.flows.get(flow_id)
    }

    /// Flows in declaration order.
    pub fn flows(&self) -> impl Iterator<Item = &FlowDefinition> {
        self.order.iter().filter_map(|flow_id| self.flows.get(flow_id))
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

fn compile_flow(raw: RawFlow) -> Result<FlowDefinition, RegistryError> {
    let flow_id = raw.flow_id.trim().to_string();
    if flow_id.is_empty() {
        return Err(RegistryError::Invalid("flow_id must not be blank".to_string()));
    }
    if raw.steps.is_empty() {
        return Err(RegistryError::Invalid(format!("flow `{flow_id}` has no steps")));
    }
    if raw.triggers.iter().any(|trigger| trigger.trim().is_empty()) {
        return Err(RegistryError::Invalid(format!("flow `{flow_id}` has a blank trigger")));
    }

    let mut step_names = BTreeSet::new();
    let mut steps = Vec::with_capacity(raw.steps.len());
    for raw_step in raw.steps {
        if !step_names.insert(raw_step.step_name.clone()) {
            return Err(RegistryError::Invalid(format!(
                "flow `{flow_id}` repeats step `{}`",
                raw_step.step_name
            )));
        }
        steps.push(compile_step(&flow_id, raw_step)?);
    }

    let lists_products = steps.iter().any(|step| step.lists_products);
    if lists_products && raw.product_category.is_none() {
        return Err(RegistryError::Invalid(format!(
            "flow `{flow_id}` lists products but declares no product_category"
        )));
    }

    Ok(FlowDefinition {
        display_name: raw.display_name.unwrap_or_else(|| flow_id.clone()),
        flow_id,
        triggers: raw.triggers,
        product_category: raw.product_category,
        completion_message: raw
            .completion_message
            .unwrap_or_else(|| "Thank you, all done.".to_string()),
        steps,
    })
}

fn compile_step(flow_id: &str, raw: RawStep) -> Result<StepDefinition, RegistryError> {
    let context = format!("{flow_id}/{}", raw.step_name);
    if raw.fields.is_empty() {
        return Err(RegistryError::Invalid(format!("step `{context}` declares no fields")));
    }

    let mut field_names = BTreeSet::new();
    let mut fields = Vec::with_capacity(raw.fields.len());
    for raw_field in raw.fields {
        if !field_names.insert(raw_field.name.clone()) {
            return Err(RegistryError::Invalid(format!(
                "step `{context}` repeats field `{}`",
                raw_field.name
            )));
        }
        fields.push(compile_field(&context, raw_field)?);
    }

    let action = match raw.action.as_deref().map(str::trim) {
        None | Some("") | Some("none") => StepAction::None,
        Some("lookup_product") => {
            let field = raw.action_field.unwrap_or_else(|| fields[0].name.clone());
            if !field_names.contains(&field) {
                return Err(RegistryError::Invalid(format!(
                    "step `{context}` looks up products from undeclared field `{field}`"
                )));
            }
            StepAction::LookupProduct { field }
        }
        Some("submit_quote") => StepAction::SubmitQuote,
        Some("initiate_payment") => StepAction::InitiatePayment,
        Some(other) => {
            return Err(RegistryError::Invalid(format!(
                "step `{context}` uses unknown action `{other}`"
            )))
        }
    };

    Ok(StepDefinition {
        step_name: raw.step_name,
        prompt: raw.prompt,
        fields,
        lists_products: raw.lists_products,
        action,
    })
}

fn compile_field(context: &str, raw: RawField) -> Result<FieldSpec, RegistryError> {
    let invalid = |message: String| RegistryError::Invalid(format!("step `{context}`: {message}"));
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(invalid("field name must not be blank".to_string()));
    }

    let format = match raw.format.as_deref().unwrap_or("text") {
        "text" => FieldFormat::Text,
        "email" => FieldFormat::Email,
        "phone" => FieldFormat::Phone,
        "date" => FieldFormat::Date { not_future: raw.not_future.unwrap_or(false) },
        "integer" => {
            if let (Some(min), Some(max)) = (raw.min, raw.max) {
                if min > max {
                    return Err(invalid(format!("field `{name}` has min greater than max")));
                }
            }
            FieldFormat::Integer { min: raw.min, max: raw.max }
        }
        "number" => FieldFormat::Number { min: raw.min.map(Decimal::from) },
        "boolean" => FieldFormat::Boolean { must_be_true: raw.must_be_true.unwrap_or(false) },
        "one_of" => {
            let options = raw.options.unwrap_or_default();
            if options.is_empty() {
                return Err(invalid(format!("field `{name}` declares no options")));
            }
            FieldFormat::OneOf { options }
        }
        "pattern" => {
            let pattern = raw
                .pattern
                .ok_or_else(|| invalid(format!("field `{name}` declares no pattern")))?;
            Regex::new(&pattern)
                .map_err(|error| invalid(format!("field `{name}` has a bad pattern: {error}")))?;
            FieldFormat::Pattern { pattern, hint: raw.hint }
        }
        other => return Err(invalid(format!("field `{name}` uses unknown format `{other}`"))),
    };

    Ok(FieldSpec {
        label: raw.label.unwrap_or_else(|| name.replace('_', " ")),
        name,
        required: raw.required.unwrap_or(true),
        format,
    })
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    flows: Vec<RawFlow>,
}

#[derive(Debug, Deserialize)]
struct RawFlow {
    flow_id: String,
    display_name: Option<String>,
    #[serde(default)]
    triggers: Vec<String>,
    product_category: Option<String>,
    completion_message: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    step_name: String,
    prompt: String,
    #[serde(default)]
    lists_products: bool,
    action: Option<String>,
    action_field: Option<String>,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    label: Option<String>,
    required: Option<bool>,
    format: Option<String>,
    not_future: Option<bool>,
    min: Option<i64>,
    max: Option<i64>,
    must_be_true: Option<bool>,
    options: Option<Vec<String>>,
    pattern: Option<String>,
    hint: Option<String>,
}
