use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::session::SessionId;
use crate::flows::FlowTransitionError;

/// A single field-level validation failure reported back to the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("step validation failed for {} field(s)", .0.len())]
    Validation(Vec<FieldError>),
    #[error("form data was submitted but the session has no active flow")]
    NoActiveFlow,
    #[error("turn carried neither a message nor form data")]
    EmptyTurn,
    #[error("unknown flow `{0}`")]
    UnknownFlow(String),
    #[error("flow `{flow_id}` has no step at index {step}")]
    UnknownStep { flow_id: String, step: usize },
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IntegrationError {
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: String, id: String },
    #[error("{operation} failed upstream: {message}")]
    Upstream { operation: String, message: String },
    #[error("{operation} returned an unreadable payload: {message}")]
    Decode { operation: String, message: String },
}

impl IntegrationError {
    pub fn upstream(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream { operation: operation.into(), message: message.into() }
    }

    pub fn decode(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode { operation: operation.into(), message: message.into() }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound { entity: entity.into(), id: id.into() }
    }

    /// Transient failures worth another attempt on read-only calls.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Upstream { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session `{0}` was not found")]
    NotFound(SessionId),
    #[error("session `{0}` was modified concurrently")]
    Conflict(SessionId),
    #[error("session store failure: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("session `{0}` was not found")]
    SessionNotFound(SessionId),
    #[error("flow `{0}` is not registered")]
    FlowNotFound(String),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error("session `{0}` changed while the turn was in progress")]
    TurnConflict(SessionId),
    #[error("payment initiation at step `{step}` is unconfirmed: {reason}")]
    PaymentUnconfirmed { step: String, reason: String },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(session_id) => Self::SessionNotFound(session_id),
            StoreError::Conflict(session_id) => Self::TurnConflict(session_id),
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("unprocessable input: {message}")]
    Unprocessable { message: String, field_errors: Vec<FieldError>, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("bad gateway: {message}")]
    BadGateway { message: String, requires_confirmation: bool, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Unprocessable { .. } => "Some of the details provided need attention.",
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Unauthorized { .. } => "A valid API key is required.",
            Self::Conflict { .. } => {
                "Your previous message is still being processed. Please send it again."
            }
            Self::BadGateway { requires_confirmation: true, .. } => {
                "We could not confirm your payment. Please confirm again to retry."
            }
            Self::BadGateway { .. } => {
                "A partner service could not complete the request. Please try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    /// Stable machine-readable code for transport bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::Unprocessable { .. } => "validation_failed",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Conflict { .. } => "conflict",
            Self::BadGateway { requires_confirmation: true, .. } => "payment_unconfirmed",
            Self::BadGateway { .. } => "integration_failed",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Unprocessable { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Unauthorized { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::BadGateway { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    fn set_correlation_id(&mut self, value: String) {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Unprocessable { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Unauthorized { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::BadGateway { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => *correlation_id = value,
        }
    }
}

impl ApplicationError {
    /// Failures the caller can resolve by resending the same turn.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TurnConflict(_))
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let mut mapped = InterfaceError::from(self);
        mapped.set_correlation_id(correlation_id.into());
        mapped
    }
}

const UNASSIGNED: &str = "unassigned";

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = UNASSIGNED.to_owned();
        match value {
            ApplicationError::Domain(DomainError::Validation(field_errors)) => {
                Self::Unprocessable {
                    message: "step validation failed".to_owned(),
                    field_errors,
                    correlation_id,
                }
            }
            ApplicationError::Domain(DomainError::NoActiveFlow) => Self::Unprocessable {
                message: DomainError::NoActiveFlow.to_string(),
                field_errors: vec![FieldError::new(
                    "form_data",
                    "Start a flow with a message before submitting form data.",
                )],
                correlation_id,
            },
            ApplicationError::Domain(DomainError::EmptyTurn) => {
                Self::BadRequest { message: DomainError::EmptyTurn.to_string(), correlation_id }
            }
            ApplicationError::Domain(error @ DomainError::FlowTransition(_)) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::Domain(error @ DomainError::UnknownFlow(_))
            | ApplicationError::Domain(error @ DomainError::UnknownStep { .. })
            | ApplicationError::Domain(error @ DomainError::InvariantViolation(_)) => {
                Self::Internal { message: error.to_string(), correlation_id }
            }
            ApplicationError::SessionNotFound(session_id) => {
                Self::NotFound { message: format!("session `{session_id}`"), correlation_id }
            }
            ApplicationError::FlowNotFound(flow_id) => {
                Self::NotFound { message: format!("flow `{flow_id}`"), correlation_id }
            }
            error @ ApplicationError::TurnConflict(_) => {
                Self::Conflict { message: error.to_string(), correlation_id }
            }
            ApplicationError::Integration(IntegrationError::NotFound { entity, id }) => {
                Self::NotFound { message: format!("{entity} `{id}`"), correlation_id }
            }
            ApplicationError::Integration(error) => Self::BadGateway {
                message: error.to_string(),
                requires_confirmation: false,
                correlation_id,
            },
            error @ ApplicationError::PaymentUnconfirmed { .. } => Self::BadGateway {
                message: error.to_string(),
                requires_confirmation: true,
                correlation_id,
            },
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
