use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::errors::FieldError;
use crate::flows::definition::{FieldFormat, FieldSpec, StepDefinition};
use crate::flows::registry::FlowRegistry;

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

/// Checks submitted form data against a step's declared fields.
///
/// Every field is checked in one pass so the user sees all problems at once.
/// Values that pass are normalized (trimmed text, canonical phone digits,
/// typed numbers and booleans) before they are merged into a session.
#[derive(Clone, Debug)]
pub struct StepValidator {
    email: Regex,
    patterns: HashMap<String, Regex>,
}

impl StepValidator {
    pub fn new(registry: &FlowRegistry) -> Result<Self, regex::Error> {
        let mut patterns = HashMap::new();
        for flow in registry.flows() {
            for step in &flow.steps {
                for field in &step.fields {
                    if let FieldFormat::Pattern { pattern, .. } = &field.format {
                        if !patterns.contains_key(pattern) {
                            patterns.insert(pattern.clone(), Regex::new(pattern)?);
                        }
                    }
                }
            }
        }
        Ok(Self { email: Regex::new(EMAIL_PATTERN)?, patterns })
    }

    pub fn validate(&self, step: &StepDefinition, form_data: &Map<String, Value>) -> Vec<FieldError> {
        match self.normalize(step, form_data) {
            Ok(_) => Vec::new(),
            Err(errors) => errors,
        }
    }

    /// Returns the normalized declared fields, or every field error found.
    /// Undeclared keys in `form_data` are dropped.
    pub fn normalize(
        &self,
        step: &StepDefinition,
        form_data: &Map<String, Value>,
    ) -> Result<BTreeMap<String, Value>, Vec<FieldError>> {
        let mut accepted = BTreeMap::new();
        let mut errors = Vec::new();

        for field in &step.fields {
            let value = form_data.get(&field.name).filter(|value| !is_empty(value));
            match value {
                None if field.required => {
                    errors.push(FieldError::new(&field.name, format!("{} is required", field.label)))
                }
                None => {}
                Some(value) => match self.check(field, value) {
                    Ok(normalized) => {
                        accepted.insert(field.name.clone(), normalized);
                    }
                    Err(message) => errors.push(FieldError::new(&field.name, message)),
                },
            }
        }

        if errors.is_empty() {
            Ok(accepted)
        } else {
            Err(errors)
        }
    }

    fn check(&self, field: &FieldSpec, value: &Value) -> Result<Value, String> {
        let label = &field.label;
        match &field.format {
            FieldFormat::Text => match value {
                Value::String(text) => Ok(Value::String(text.trim().to_string())),
                Value::Number(_) | Value::Bool(_) => Ok(Value::String(value.to_string())),
                _ => Err(format!("{label} must be text")),
            },
            FieldFormat::Email => {
                let text = as_text(value).ok_or_else(|| format!("{label} must be text"))?;
                if self.email.is_match(&text) {
                    Ok(Value::String(text))
                } else {
                    Err(format!("{label} must be a valid email address"))
                }
            }
            FieldFormat::Phone => {
                let text = as_text(value).ok_or_else(|| format!("{label} must be text"))?;
                normalize_phone(&text)
                    .map(Value::String)
                    .ok_or_else(|| format!("{label} must be a valid phone number"))
            }
            FieldFormat::Date { not_future } => {
                let text = as_text(value).ok_or_else(|| format!("{label} must be a date"))?;
                let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map_err(|_| format!("{label} must be a date in YYYY-MM-DD format"))?;
                if *not_future && date > Utc::now().date_naive() {
                    return Err(format!("{label} cannot be in the future"));
                }
                Ok(Value::String(date.format("%Y-%m-%d").to_string()))
            }
            FieldFormat::Integer { min, max } => {
                let number = as_integer(value).ok_or_else(|| format!("{label} must be a whole number"))?;
                if let Some(min) = min {
                    if number < *min {
                        return Err(format!("{label} must be at least {min}"));
                    }
                }
                if let Some(max) = max {
                    if number > *max {
                        return Err(format!("{label} must be at most {max}"));
                    }
                }
                Ok(Value::from(number))
            }
            FieldFormat::Number { min } => {
                let number = as_decimal(value).ok_or_else(|| format!("{label} must be a number"))?;
                if let Some(min) = min {
                    if number < *min {
                        return Err(format!("{label} must be at least {min}"));
                    }
                }
                Ok(Value::String(number.normalize().to_string()))
            }
            FieldFormat::Boolean { must_be_true } => {
                let flag = as_bool(value).ok_or_else(|| format!("{label} must be yes or no"))?;
                if *must_be_true && !flag {
                    return Err(format!("{label} must be accepted to continue"));
                }
                Ok(Value::Bool(flag))
            }
            FieldFormat::OneOf { options } => {
                let text = as_text(value).ok_or_else(|| format!("{label} must be text"))?;
                options
                    .iter()
                    .find(|option| option.eq_ignore_ascii_case(&text))
                    .map(|option| Value::String(option.clone()))
                    .ok_or_else(|| format!("{label} must be one of: {}", options.join(", ")))
            }
            FieldFormat::Pattern { pattern, hint } => {
                let text = as_text(value).ok_or_else(|| format!("{label} must be text"))?;
                let regex = self
                    .patterns
                    .get(pattern)
                    .ok_or_else(|| format!("{label} cannot be checked right now"))?;
                if regex.is_match(&text) {
                    Ok(Value::String(text))
                } else {
                    match hint {
                        Some(hint) => Err(format!("{label} must be {hint}")),
                        None => Err(format!("{label} has an invalid format")),
                    }
                }
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        Value::String(text) => Decimal::from_str(&text.trim().replace(',', "")).ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Canonical digits-only phone number, or `None` when it cannot be one.
///
/// Ugandan local numbers (`07XXXXXXXX`) are rewritten to `2567XXXXXXXX`.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let stripped: String =
        raw.chars().filter(|ch| !matches!(ch, ' ' | '-' | '(' | ')')).collect();
    let digits = stripped.strip_prefix('+').unwrap_or(&stripped);
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }

    let canonical = if digits.len() == 10 && digits.starts_with("07") {
        format!("256{}", &digits[1..])
    } else {
        digits.to_string()
    };

    if canonical.starts_with("256") && canonical.len() != 12 {
        return None;
    }
    (9..=15).contains(&canonical.len()).then_some(canonical)
}
