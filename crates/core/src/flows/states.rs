use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::session::ConversationState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    TriggerMatched { flow_id: String },
    StepAccepted { steps_total: usize },
    ExitRequested,
    EscalationTriggered,
    AgentJoined { agent_id: String },
    EscalationEnded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: ConversationState,
    pub to: ConversationState,
    pub event: FlowEvent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: ConversationState, event: FlowEvent },
    #[error("escalation can only resume into a non-escalated state, got {0:?}")]
    InvalidResume(ConversationState),
}

/// Computes the next conversation state.
///
/// `resume` is the state the session returns to when an escalation ends and
/// is ignored for every other event.
pub fn transition(
    current: &ConversationState,
    event: &FlowEvent,
    resume: Option<&ConversationState>,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use ConversationState::{Completed, Escalated, Idle, InFlow};

    let to = match (current, event) {
        (Idle, FlowEvent::TriggerMatched { flow_id })
        | (Completed { .. }, FlowEvent::TriggerMatched { flow_id }) => {
            InFlow { flow_id: flow_id.clone(), step_index: 0 }
        }
        (InFlow { flow_id, step_index }, FlowEvent::StepAccepted { steps_total }) => {
            if step_index + 1 < *steps_total {
                InFlow { flow_id: flow_id.clone(), step_index: step_index + 1 }
            } else {
                Completed { flow_id: flow_id.clone() }
            }
        }
        (InFlow { .. }, FlowEvent::ExitRequested) => Idle,
        (Idle, FlowEvent::EscalationTriggered)
        | (InFlow { .. }, FlowEvent::EscalationTriggered)
        | (Completed { .. }, FlowEvent::EscalationTriggered) => Escalated { agent_id: None },
        (_, FlowEvent::AgentJoined { agent_id }) => Escalated { agent_id: Some(agent_id.clone()) },
        (Escalated { .. }, FlowEvent::EscalationEnded) => match resume {
            Some(Escalated { .. }) | None => {
                return Err(FlowTransitionError::InvalidResume(
                    resume.cloned().unwrap_or(Escalated { agent_id: None }),
                ))
            }
            Some(state) => state.clone(),
        },
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                state: current.clone(),
                event: event.clone(),
            })
        }
    };

    Ok(TransitionOutcome { from: current.clone(), to, event: event.clone() })
}
