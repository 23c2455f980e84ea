use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Idle,
    InFlow,
    Completed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InFlow => "in_flow",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "in_flow" => Some(Self::InFlow),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// The action was claimed and its provider call has not returned yet.
    Pending,
    #[default]
    Completed,
    /// The provider call failed; the action may be claimed again.
    Released,
}

/// Result of a side-effecting step action, kept so the same input never
/// reaches the provider twice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub action: String,
    pub input_fingerprint: String,
    #[serde(default)]
    pub status: ReceiptStatus,
    pub outputs: BTreeMap<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

impl ActionReceipt {
    pub fn completed(
        action: impl Into<String>,
        input_fingerprint: impl Into<String>,
        outputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            action: action.into(),
            input_fingerprint: input_fingerprint.into(),
            status: ReceiptStatus::Completed,
            outputs,
            recorded_at: Utc::now(),
        }
    }

    pub fn pending(action: impl Into<String>, input_fingerprint: impl Into<String>) -> Self {
        Self {
            status: ReceiptStatus::Pending,
            ..Self::completed(action, input_fingerprint, BTreeMap::new())
        }
    }

    pub fn released(mut self) -> Self {
        self.status = ReceiptStatus::Released;
        self.recorded_at = Utc::now();
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == ReceiptStatus::Completed
    }

    /// A claim younger than `max_age` still blocks other attempts.
    pub fn is_live_claim(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.status == ReceiptStatus::Pending && now - self.recorded_at < max_age
    }
}

/// Derived view of where a session sits in the conversation state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    InFlow { flow_id: String, step_index: usize },
    Escalated { agent_id: Option<String> },
    Completed { flow_id: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub current_flow: Option<String>,
    pub current_step: usize,
    pub flow_status: FlowStatus,
    pub collected_data: BTreeMap<String, Value>,
    pub step_failures: u32,
    pub completed_actions: BTreeMap<String, ActionReceipt>,
    pub escalated: bool,
    pub agent_id: Option<String>,
    pub escalation_reason: Option<String>,
    pub state_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: SessionId, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id: user_id.into(),
            current_flow: None,
            current_step: 0,
            flow_status: FlowStatus::Idle,
            collected_data: BTreeMap::new(),
            step_failures: 0,
            completed_actions: BTreeMap::new(),
            escalated: false,
            agent_id: None,
            escalation_reason: None,
            state_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn conversation_state(&self) -> ConversationState {
        if self.escalated {
            return ConversationState::Escalated { agent_id: self.agent_id.clone() };
        }
        match (self.flow_status, &self.current_flow) {
            (FlowStatus::InFlow, Some(flow_id)) => {
                ConversationState::InFlow { flow_id: flow_id.clone(), step_index: self.current_step }
            }
            (FlowStatus::Completed, Some(flow_id)) => {
                ConversationState::Completed { flow_id: flow_id.clone() }
            }
            _ => ConversationState::Idle,
        }
    }

    /// Merges a patch in place. Collected data and receipts only grow.
    pub fn apply_patch(&mut self, patch: SessionPatch, now: DateTime<Utc>) {
        if let Some(current_flow) = patch.current_flow {
            self.current_flow = current_flow;
        }
        if let Some(current_step) = patch.current_step {
            self.current_step = current_step;
        }
        if let Some(flow_status) = patch.flow_status {
            self.flow_status = flow_status;
        }
        self.collected_data.extend(patch.collected_data);
        if let Some(step_failures) = patch.step_failures {
            self.step_failures = step_failures;
        }
        self.completed_actions.extend(patch.completed_actions);
        if let Some(escalated) = patch.escalated {
            self.escalated = escalated;
        }
        if let Some(agent_id) = patch.agent_id {
            self.agent_id = agent_id;
        }
        if let Some(escalation_reason) = patch.escalation_reason {
            self.escalation_reason = escalation_reason;
        }
        self.state_version += 1;
        self.updated_at = now;
    }
}

/// Partial update applied atomically by a session store.
///
/// With `expected_version` set the store refuses the patch unless the stored
/// session still carries that version.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    pub expected_version: Option<u64>,
    pub current_flow: Option<Option<String>>,
    pub current_step: Option<usize>,
    pub flow_status: Option<FlowStatus>,
    pub collected_data: BTreeMap<String, Value>,
    pub step_failures: Option<u32>,
    pub completed_actions: BTreeMap<String, ActionReceipt>,
    pub escalated: Option<bool>,
    pub agent_id: Option<Option<String>>,
    pub escalation_reason: Option<Option<String>>,
}

impl SessionPatch {
    pub fn expect_version(mut self, state_version: u64) -> Self {
        self.expected_version = Some(state_version);
        self
    }

    /// Whether the patch may be applied on top of `session`.
    pub fn applies_to(&self, session: &Session) -> bool {
        self.expected_version.map_or(true, |expected| expected == session.state_version)
    }

    pub fn enter_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.current_flow = Some(Some(flow_id.into()));
        self.current_step = Some(0);
        self.flow_status = Some(FlowStatus::InFlow);
        self.step_failures = Some(0);
        self
    }

    pub fn leave_flow(mut self) -> Self {
        self.current_flow = Some(None);
        self.current_step = Some(0);
        self.flow_status = Some(FlowStatus::Idle);
        self.step_failures = Some(0);
        self
    }

    pub fn advance_to(mut self, step_index: usize) -> Self {
        self.current_step = Some(step_index);
        self.step_failures = Some(0);
        self
    }

    pub fn complete_flow(mut self) -> Self {
        self.flow_status = Some(FlowStatus::Completed);
        self.step_failures = Some(0);
        self
    }

    pub fn merge_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.collected_data.extend(data);
        self
    }

    pub fn with_step_failures(mut self, step_failures: u32) -> Self {
        self.step_failures = Some(step_failures);
        self
    }

    pub fn record_action(mut self, key: impl Into<String>, receipt: ActionReceipt) -> Self {
        self.completed_actions.insert(key.into(), receipt);
        self
    }

    pub fn escalate(mut self, reason: impl Into<String>) -> Self {
        self.escalated = Some(true);
        self.agent_id = Some(None);
        self.escalation_reason = Some(Some(reason.into()));
        self
    }

    pub fn assign_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.escalated = Some(true);
        self.agent_id = Some(Some(agent_id.into()));
        self
    }

    pub fn clear_escalation(mut self) -> Self {
        self.escalated = Some(false);
        self.agent_id = Some(None);
        self.escalation_reason = Some(None);
        self.step_failures = Some(0);
        self
    }
}
