use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::session::SessionId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationReason {
    UserRequested,
    ValidationFailures,
    AmbiguousIntent,
    QuoteReferred,
    Other(String),
}

impl EscalationReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserRequested => "user_requested",
            Self::ValidationFailures => "validation_failures",
            Self::AmbiguousIntent => "ambiguous_intent",
            Self::QuoteReferred => "quote_referred",
            Self::Other(reason) => reason,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "user_requested" => Self::UserRequested,
            "validation_failures" => Self::ValidationFailures,
            "ambiguous_intent" => Self::AmbiguousIntent,
            "quote_referred" => Self::QuoteReferred,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handoff request placed on the human-agent queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub escalation_id: String,
    pub session_id: SessionId,
    pub user_id: String,
    pub reason: String,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(
        session_id: SessionId,
        user_id: impl Into<String>,
        reason: &EscalationReason,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            escalation_id: Uuid::new_v4().to_string(),
            session_id,
            user_id: user_id.into(),
            reason: reason.as_str().to_owned(),
            metadata,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStatus {
    pub session_id: SessionId,
    pub escalated: bool,
    pub agent_id: Option<String>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::EscalationReason;

    #[test]
    fn reasons_parse_back_from_their_wire_names() {
        for reason in [
            EscalationReason::UserRequested,
            EscalationReason::ValidationFailures,
            EscalationReason::AmbiguousIntent,
            EscalationReason::QuoteReferred,
        ] {
            assert_eq!(EscalationReason::parse(reason.as_str()), reason);
        }
        assert_eq!(
            EscalationReason::parse("complaint"),
            EscalationReason::Other("complaint".to_owned())
        );
    }
}
