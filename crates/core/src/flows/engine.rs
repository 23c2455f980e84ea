use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tera::{Context, Tera};
use tracing::{info, warn};

use crate::answers::AnswerSource;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::config::FlowsConfig;
use crate::domain::escalation::EscalationReason;
use crate::domain::payment::PaymentRequest;
use crate::domain::product::Product;
use crate::domain::quote::{QuoteDecision, QuoteRequest};
use crate::domain::session::{ActionReceipt, ConversationState, Session, SessionId, SessionPatch};
use crate::errors::{ApplicationError, DomainError, FieldError, IntegrationError};
use crate::escalation::EscalationService;
use crate::flows::definition::{FieldSpec, FlowDefinition, StepAction, StepDefinition};
use crate::flows::registry::FlowRegistry;
use crate::flows::states::{transition, FlowEvent, TransitionOutcome};
use crate::flows::triggers::{PhraseMatcher, TriggerMatch, TriggerMatcher};
use crate::flows::validator::StepValidator;
use crate::integrations::mock::{hash_payload, DEFAULT_CURRENCY};
use crate::integrations::IntegrationGateway;
use crate::store::{SessionLocks, SessionStore};

const ACTOR: &str = "flow-engine";
const HANDOFF_MESSAGE: &str =
    "I'm connecting you with one of our agents. They will continue the conversation here.";
const WAITING_FOR_AGENT: &str = "An agent will be with you shortly.";
const AGENT_ACTIVE: &str = "An agent is handling this conversation.";
const STEP_REJECTED: &str = "Some details need attention. Please check the highlighted fields.";
const STEP_REPLAYED: &str = "We already have those details.";
const FALLBACK_ANSWER: &str =
    "Sorry, I didn't catch that. Tell me which insurance you are looking for, or ask for a human agent.";

/// One inbound user turn. At least one of the two parts must be present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub form_data: Option<Map<String, Value>>,
}

impl Turn {
    pub fn message(text: impl Into<String>) -> Self {
        Self { message: Some(text.into()), form_data: None }
    }

    pub fn form(form_data: Map<String, Value>) -> Self {
        Self { message: None, form_data: Some(form_data) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    FlowStarted,
    StepAdvanced,
    FlowCompleted,
    StepRejected,
    Reprompted,
    Replayed,
    Escalated,
    EscalationActive,
    FlowExited,
    Answered,
}

/// What the client needs to render the step the user is on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub flow_id: String,
    pub step_name: String,
    pub step_index: usize,
    pub steps_total: usize,
    pub prompt: String,
    pub required_fields: Vec<String>,
    pub fields: Vec<FieldSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub message: String,
    pub next_step: Option<StepView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<Product>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
    pub summary: Option<BTreeMap<String, Value>>,
}

impl Reply {
    fn text(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub session: Session,
    pub kind: TurnKind,
    pub reply: Reply,
}

pub struct FlowEngineDeps {
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<FlowRegistry>,
    pub gateway: IntegrationGateway,
    pub escalation: Arc<EscalationService>,
    pub answers: Arc<dyn AnswerSource>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Default)]
struct ActionDone {
    outputs: BTreeMap<String, Value>,
    receipt: Option<(String, ActionReceipt)>,
    referral: Option<EscalationReason>,
    /// The session as stored after the action claimed its step.
    claimed: Option<Session>,
}

enum ActionOutcome {
    Done(ActionDone),
    Rejected(Vec<FieldError>),
}

/// Drives a session through its flow one turn at a time.
///
/// Every turn holds the session's lock from the initial read until its single
/// commit. Validation failures, integration errors and unconfirmed payments
/// leave the session exactly as it was apart from the failure counter.
///
/// Each write carries the `state_version` the turn was decided on, so a turn
/// racing another process on the same session fails with
/// [`ApplicationError::TurnConflict`] instead of overwriting it. Payment steps
/// additionally claim the step with a pending receipt before calling the
/// provider.
pub struct FlowEngine {
    store: Arc<dyn SessionStore>,
    registry: Arc<FlowRegistry>,
    gateway: IntegrationGateway,
    escalation: Arc<EscalationService>,
    answers: Arc<dyn AnswerSource>,
    audit: Arc<dyn AuditSink>,
    locks: Arc<SessionLocks>,
    validator: StepValidator,
    triggers: TriggerMatcher,
    human_requests: PhraseMatcher,
    exits: PhraseMatcher,
    failure_threshold: u32,
}

impl FlowEngine {
    pub fn new(deps: FlowEngineDeps, config: &FlowsConfig) -> Result<Self, ApplicationError> {
        let invalid = |error: regex::Error| {
            ApplicationError::Configuration(format!("invalid flow phrase or field pattern: {error}"))
        };
        let validator = StepValidator::new(&deps.registry).map_err(invalid)?;
        let triggers = TriggerMatcher::new(&deps.registry, config.ambiguity_margin).map_err(invalid)?;
        let human_requests = PhraseMatcher::new(&config.human_request_phrases).map_err(invalid)?;
        let exits = PhraseMatcher::commands(&config.exit_phrases).map_err(invalid)?;

        Ok(Self {
            locks: deps.escalation.locks(),
            store: deps.store,
            registry: deps.registry,
            gateway: deps.gateway,
            escalation: deps.escalation,
            answers: deps.answers,
            audit: deps.audit,
            validator,
            triggers,
            human_requests,
            exits,
            failure_threshold: config.failure_threshold,
        })
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &IntegrationGateway {
        &self.gateway
    }

    pub async fn start_session(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<Session, ApplicationError> {
        let session = self.store.create(user_id).await?;
        self.record(&session, correlation_id, "session.created", AuditCategory::Session, AuditOutcome::Success, &[]);
        info!(
            event_name = "session.created",
            correlation_id = %correlation_id,
            session_id = %session.session_id,
            "chat session created"
        );
        Ok(session)
    }

    pub async fn session(&self, session_id: &SessionId) -> Result<Session, ApplicationError> {
        Ok(self.store.get(session_id).await?)
    }

    /// The step the session is waiting on, if it is inside a flow.
    pub fn current_step(&self, session: &Session) -> Option<StepView> {
        match session.conversation_state() {
            ConversationState::InFlow { flow_id, step_index } => {
                let flow = self.registry.get(&flow_id)?;
                step_view(flow, step_index, &session.collected_data)
            }
            _ => None,
        }
    }

    pub async fn handle_turn(
        &self,
        session_id: &SessionId,
        turn: Turn,
        correlation_id: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let message =
            turn.message.as_deref().map(str::trim).filter(|text| !text.is_empty()).map(str::to_owned);
        let form_data = turn.form_data;
        if message.is_none() && form_data.is_none() {
            return Err(DomainError::EmptyTurn.into());
        }

        let _guard = self.locks.acquire(session_id).await;
        let session = self.store.get(session_id).await?;

        match session.conversation_state() {
            ConversationState::Escalated { agent_id } => {
                info!(
                    event_name = "flow.turn.escalation_active",
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    "turn ignored while a human agent owns the session"
                );
                let reply = if agent_id.is_some() { AGENT_ACTIVE } else { WAITING_FOR_AGENT };
                Ok(TurnOutcome { session, kind: TurnKind::EscalationActive, reply: Reply::text(reply) })
            }
            _ if message.as_deref().is_some_and(|text| self.human_requests.matches(text)) => {
                self.hand_off(session, EscalationReason::UserRequested, BTreeMap::new(), Vec::new(), correlation_id)
                    .await
            }
            ConversationState::InFlow { flow_id, step_index } => {
                let flow = self.flow(&flow_id)?;
                match (form_data, message.as_deref()) {
                    (Some(form), _) => {
                        self.submit_step(session, flow, step_index, &form, correlation_id).await
                    }
                    (None, Some(text)) if self.exits.matches(text) => {
                        self.exit_flow(session, flow, correlation_id).await
                    }
                    (None, _) => {
                        let reply = self.step_reply(flow, step_index, &session, correlation_id).await;
                        Ok(TurnOutcome { session, kind: TurnKind::Reprompted, reply })
                    }
                }
            }
            ConversationState::Idle | ConversationState::Completed { .. } => {
                if let Some(form) = form_data {
                    return self
                        .replay_of_completed(&session, &form, correlation_id)
                        .ok_or_else(|| DomainError::NoActiveFlow.into());
                }
                let text = message.unwrap_or_default();
                self.route_free_text(session, &text, correlation_id).await
            }
        }
    }

    async fn route_free_text(
        &self,
        session: Session,
        text: &str,
        correlation_id: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        match self.triggers.resolve(text) {
            TriggerMatch::Single(flow_id) => self.start_flow(session, &flow_id, correlation_id).await,
            TriggerMatch::Ambiguous(candidates) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("candidates".to_owned(), candidates.join(","));
                self.hand_off(session, EscalationReason::AmbiguousIntent, metadata, Vec::new(), correlation_id)
                    .await
            }
            TriggerMatch::NoMatch => {
                let message = match self.answers.answer(text).await {
                    Ok(answer) => answer,
                    Err(error) => {
                        warn!(
                            event_name = "flow.answer.failed",
                            correlation_id = %correlation_id,
                            session_id = %session.session_id,
                            error = %error,
                            "answer source failed, using fallback reply"
                        );
                        FALLBACK_ANSWER.to_owned()
                    }
                };
                Ok(TurnOutcome { session, kind: TurnKind::Answered, reply: Reply::text(message) })
            }
        }
    }

    async fn start_flow(
        &self,
        session: Session,
        flow_id: &str,
        correlation_id: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let flow = self.flow(flow_id)?;
        check(&session, FlowEvent::TriggerMatched { flow_id: flow.flow_id.clone() })?;

        let updated =
            self.store.update(&session.session_id, versioned(&session).enter_flow(&flow.flow_id)).await?;
        self.record(
            &updated,
            correlation_id,
            "flow.started",
            AuditCategory::Flow,
            AuditOutcome::Success,
            &[("flow_id", flow.flow_id.as_str())],
        );
        info!(
            event_name = "flow.started",
            correlation_id = %correlation_id,
            session_id = %updated.session_id,
            flow_id = %flow.flow_id,
            "flow started"
        );

        let reply = self.step_reply(flow, 0, &updated, correlation_id).await;
        Ok(TurnOutcome { session: updated, kind: TurnKind::FlowStarted, reply })
    }

    async fn exit_flow(
        &self,
        session: Session,
        flow: &FlowDefinition,
        correlation_id: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        check(&session, FlowEvent::ExitRequested)?;
        let updated = self.store.update(&session.session_id, versioned(&session).leave_flow()).await?;
        self.record(
            &updated,
            correlation_id,
            "flow.exited",
            AuditCategory::Flow,
            AuditOutcome::Success,
            &[("flow_id", flow.flow_id.as_str()), ("step_index", session.current_step.to_string().as_str())],
        );

        let message = format!(
            "No problem, I've stopped your {} application. Let me know whenever you want to pick it up again.",
            flow.display_name
        );
        Ok(TurnOutcome { session: updated, kind: TurnKind::FlowExited, reply: Reply::text(message) })
    }

    async fn submit_step(
        &self,
        session: Session,
        flow: &FlowDefinition,
        step_index: usize,
        form: &Map<String, Value>,
        correlation_id: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let step = flow
            .step(step_index)
            .ok_or_else(|| DomainError::UnknownStep { flow_id: flow.flow_id.clone(), step: step_index })?;

        let accepted = match self.validator.normalize(step, form) {
            Ok(accepted) => accepted,
            Err(errors) => {
                return self.reject_step(session, flow, step_index, form, errors, correlation_id).await
            }
        };

        let mut action =
            match self.run_action(&session, flow, step_index, step, &accepted, correlation_id).await? {
                ActionOutcome::Done(done) => done,
                ActionOutcome::Rejected(errors) => {
                    return self.reject_step(session, flow, step_index, form, errors, correlation_id).await
                }
            };
        let session = action.claimed.take().unwrap_or(session);

        let advance = check(&session, FlowEvent::StepAccepted { steps_total: flow.steps_total() })?;
        let mut patch = versioned(&session).merge_data(accepted).merge_data(action.outputs);
        if let Some((key, receipt)) = action.receipt {
            patch = patch.record_action(key, receipt);
        }
        let (patch, kind) = match advance.to {
            ConversationState::InFlow { step_index: next, .. } => {
                (patch.advance_to(next), TurnKind::StepAdvanced)
            }
            ConversationState::Completed { .. } => (patch.complete_flow(), TurnKind::FlowCompleted),
            other => {
                return Err(DomainError::InvariantViolation(format!(
                    "accepting a step cannot lead to {other:?}"
                ))
                .into())
            }
        };

        let updated = self.store.update(&session.session_id, patch).await?;
        self.record(
            &updated,
            correlation_id,
            "flow.step_advanced",
            AuditCategory::Flow,
            AuditOutcome::Success,
            &[("flow_id", flow.flow_id.as_str()), ("step_name", step.step_name.as_str())],
        );
        info!(
            event_name = "flow.step_advanced",
            correlation_id = %correlation_id,
            session_id = %updated.session_id,
            flow_id = %flow.flow_id,
            step_name = %step.step_name,
            "step accepted"
        );

        if let Some(reason) = action.referral {
            let mut metadata = BTreeMap::new();
            metadata.insert("flow_id".to_owned(), flow.flow_id.clone());
            metadata.insert("step_name".to_owned(), step.step_name.clone());
            return self.hand_off(updated, reason, metadata, Vec::new(), correlation_id).await;
        }

        let reply = if kind == TurnKind::FlowCompleted {
            self.record(
                &updated,
                correlation_id,
                "flow.completed",
                AuditCategory::Flow,
                AuditOutcome::Success,
                &[("flow_id", flow.flow_id.as_str())],
            );
            Reply {
                message: render(&flow.completion_message, &updated.collected_data),
                summary: Some(updated.collected_data.clone()),
                ..Reply::default()
            }
        } else {
            self.step_reply(flow, updated.current_step, &updated, correlation_id).await
        };

        Ok(TurnOutcome { session: updated, kind, reply })
    }

    async fn reject_step(
        &self,
        session: Session,
        flow: &FlowDefinition,
        step_index: usize,
        form: &Map<String, Value>,
        errors: Vec<FieldError>,
        correlation_id: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        if let Some(previous) = step_index.checked_sub(1).and_then(|index| flow.step(index)) {
            if self.is_replay(&session, previous, form) {
                let reply = Reply {
                    message: STEP_REPLAYED.to_owned(),
                    next_step: step_view(flow, step_index, &session.collected_data),
                    ..Reply::default()
                };
                self.record(
                    &session,
                    correlation_id,
                    "flow.replayed",
                    AuditCategory::Flow,
                    AuditOutcome::Success,
                    &[("flow_id", flow.flow_id.as_str()), ("step_name", previous.step_name.as_str())],
                );
                return Ok(TurnOutcome { session, kind: TurnKind::Replayed, reply });
            }
        }

        let step_name = flow.step(step_index).map(|step| step.step_name.clone()).unwrap_or_default();
        let failures = session.step_failures.saturating_add(1);
        if failures > self.failure_threshold {
            let mut metadata = BTreeMap::new();
            metadata.insert("flow_id".to_owned(), flow.flow_id.clone());
            metadata.insert("step_name".to_owned(), step_name);
            metadata.insert("failures".to_owned(), failures.to_string());
            return self
                .hand_off(session, EscalationReason::ValidationFailures, metadata, errors, correlation_id)
                .await;
        }

        let updated = self
            .store
            .update(&session.session_id, versioned(&session).with_step_failures(failures))
            .await?;
        self.record(
            &updated,
            correlation_id,
            "flow.step_rejected",
            AuditCategory::Flow,
            AuditOutcome::Rejected,
            &[("flow_id", flow.flow_id.as_str()), ("step_name", step_name.as_str()), ("failures", failures.to_string().as_str())],
        );

        let mut reply = self.step_reply(flow, step_index, &updated, correlation_id).await;
        reply.message = STEP_REJECTED.to_owned();
        reply.errors = errors;
        Ok(TurnOutcome { session: updated, kind: TurnKind::StepRejected, reply })
    }

    /// A form for the final step of a flow that already completed.
    fn replay_of_completed(
        &self,
        session: &Session,
        form: &Map<String, Value>,
        correlation_id: &str,
    ) -> Option<TurnOutcome> {
        let ConversationState::Completed { flow_id } = session.conversation_state() else {
            return None;
        };
        let flow = self.registry.get(&flow_id)?;
        let last = flow.step(flow.last_step_index())?;
        if !self.is_replay(session, last, form) {
            return None;
        }

        let reply = Reply {
            message: render(&flow.completion_message, &session.collected_data),
            summary: Some(session.collected_data.clone()),
            ..Reply::default()
        };
        self.record(
            session,
            correlation_id,
            "flow.replayed",
            AuditCategory::Flow,
            AuditOutcome::Success,
            &[("flow_id", flow.flow_id.as_str()), ("step_name", last.step_name.as_str())],
        );
        Some(TurnOutcome { session: session.clone(), kind: TurnKind::Replayed, reply })
    }

    fn is_replay(&self, session: &Session, step: &StepDefinition, form: &Map<String, Value>) -> bool {
        match self.validator.normalize(step, form) {
            Ok(values) => {
                !values.is_empty()
                    && values.iter().all(|(field, value)| session.collected_data.get(field) == Some(value))
            }
            Err(_) => false,
        }
    }

    async fn hand_off(
        &self,
        session: Session,
        reason: EscalationReason,
        metadata: BTreeMap<String, String>,
        errors: Vec<FieldError>,
        correlation_id: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let reason_name = reason.as_str().to_owned();
        let (updated, record) =
            self.escalation.escalate_locked(&session, reason, metadata, correlation_id).await?;
        self.record(
            &updated,
            correlation_id,
            "flow.escalated",
            AuditCategory::Flow,
            AuditOutcome::Success,
            &[("reason", reason_name.as_str()), ("escalation_id", record.escalation_id.as_str())],
        );
        let reply = Reply { message: HANDOFF_MESSAGE.to_owned(), errors, ..Reply::default() };
        Ok(TurnOutcome { session: updated, kind: TurnKind::Escalated, reply })
    }

    async fn run_action(
        &self,
        session: &Session,
        flow: &FlowDefinition,
        step_index: usize,
        step: &StepDefinition,
        accepted: &BTreeMap<String, Value>,
        correlation_id: &str,
    ) -> Result<ActionOutcome, ApplicationError> {
        match &step.action {
            StepAction::None => Ok(ActionOutcome::Done(ActionDone::default())),
            StepAction::LookupProduct { field } => self.lookup_product(flow, field, accepted).await,
            StepAction::SubmitQuote => {
                self.submit_quote(session, flow, step_index, step, accepted, correlation_id).await
            }
            StepAction::InitiatePayment => {
                self.initiate_payment(session, flow, step, accepted, correlation_id).await
            }
        }
    }

    async fn lookup_product(
        &self,
        flow: &FlowDefinition,
        field: &str,
        accepted: &BTreeMap<String, Value>,
    ) -> Result<ActionOutcome, ApplicationError> {
        let Some(product_id) = accepted.get(field).and_then(Value::as_str) else {
            return Ok(ActionOutcome::Rejected(vec![FieldError::new(field, "Please choose a product")]));
        };

        let product = match self.gateway.get_product(product_id).await {
            Ok(product) => product,
            Err(IntegrationError::NotFound { .. }) => {
                return Ok(ActionOutcome::Rejected(vec![FieldError::new(
                    field,
                    format!("`{product_id}` is not one of our products"),
                )]))
            }
            Err(error) => return Err(error.into()),
        };
        if flow.product_category.as_deref().is_some_and(|category| category != product.category) {
            return Ok(ActionOutcome::Rejected(vec![FieldError::new(
                field,
                format!("{} is not available for {}", product.name, flow.display_name),
            )]));
        }

        let mut outputs = BTreeMap::new();
        outputs.insert("product_name".to_owned(), Value::String(product.name));
        outputs.insert("currency".to_owned(), Value::String(product.currency));
        outputs.insert("base_premium".to_owned(), Value::String(product.base_premium.to_string()));
        Ok(ActionOutcome::Done(ActionDone { outputs, ..ActionDone::default() }))
    }

    async fn submit_quote(
        &self,
        session: &Session,
        flow: &FlowDefinition,
        step_index: usize,
        step: &StepDefinition,
        accepted: &BTreeMap<String, Value>,
        correlation_id: &str,
    ) -> Result<ActionOutcome, ApplicationError> {
        let key = receipt_key(flow, step);
        let inputs = declared_inputs(flow, step_index, &session.collected_data, accepted);
        let request = QuoteRequest {
            flow_id: flow.flow_id.clone(),
            product_id: inputs.get("product_id").and_then(Value::as_str).map(str::to_owned),
            inputs,
        };
        let fingerprint = fingerprint(&request)?;

        if let Some(receipt) = reusable_receipt(session, &key, &fingerprint) {
            self.note_reuse(session, &key, correlation_id);
            let referral = receipt
                .outputs
                .get("quote_status")
                .and_then(Value::as_str)
                .and_then(QuoteDecision::parse)
                .and_then(referral_for);
            return Ok(ActionOutcome::Done(ActionDone {
                outputs: receipt.outputs.clone(),
                referral,
                ..ActionDone::default()
            }));
        }

        let quote = self.gateway.submit_quote(&request).await?;
        let mut outputs = BTreeMap::new();
        outputs.insert("quote_id".to_owned(), Value::String(quote.quote_id.0.clone()));
        outputs.insert("premium".to_owned(), Value::String(quote.premium.to_string()));
        outputs.insert("currency".to_owned(), Value::String(quote.currency.clone()));
        outputs.insert("quote_status".to_owned(), Value::String(quote.status.as_str().to_owned()));
        self.record(
            session,
            correlation_id,
            "integration.quote_submitted",
            AuditCategory::Integration,
            AuditOutcome::Success,
            &[("quote_id", quote.quote_id.0.as_str()), ("decision", quote.status.as_str())],
        );

        let receipt = ActionReceipt::completed(step.action.name(), fingerprint, outputs.clone());
        Ok(ActionOutcome::Done(ActionDone {
            outputs,
            receipt: Some((key, receipt)),
            referral: referral_for(quote.status),
            claimed: None,
        }))
    }

    async fn initiate_payment(
        &self,
        session: &Session,
        flow: &FlowDefinition,
        step: &StepDefinition,
        accepted: &BTreeMap<String, Value>,
        correlation_id: &str,
    ) -> Result<ActionOutcome, ApplicationError> {
        let key = receipt_key(flow, step);
        let amount = session.collected_data.get("premium").and_then(decimal_value).ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "step `{}` needs a quoted premium before payment",
                step.step_name
            ))
        })?;
        let request = PaymentRequest {
            session_id: session.session_id.clone(),
            amount,
            currency: text_value(&session.collected_data, "currency")
                .unwrap_or(DEFAULT_CURRENCY)
                .to_owned(),
            method: text_value(accepted, "payment_method").unwrap_or("mobile_money").to_owned(),
            payer_phone: text_value(accepted, "payer_phone").map(str::to_owned),
            quote_id: text_value(&session.collected_data, "quote_id").map(str::to_owned),
        };
        let fingerprint = fingerprint(&request)?;

        if let Some(receipt) = reusable_receipt(session, &key, &fingerprint) {
            self.note_reuse(session, &key, correlation_id);
            return Ok(ActionOutcome::Done(ActionDone {
                outputs: receipt.outputs.clone(),
                ..ActionDone::default()
            }));
        }

        let claimed = self.claim_step(session, &key, step, &fingerprint, correlation_id).await?;
        let initiation = match self.gateway.initiate_payment(&request).await {
            Ok(initiation) => initiation,
            Err(error) => {
                self.release_claim(&claimed, &key, correlation_id).await;
                warn!(
                    event_name = "integration.payment.unconfirmed",
                    correlation_id = %correlation_id,
                    session_id = %session.session_id,
                    error = %error,
                    "payment initiation outcome unknown, step not advanced"
                );
                self.record(
                    session,
                    correlation_id,
                    "integration.payment_unconfirmed",
                    AuditCategory::Integration,
                    AuditOutcome::Failed,
                    &[("step_name", step.step_name.as_str())],
                );
                return Err(ApplicationError::PaymentUnconfirmed {
                    step: step.step_name.clone(),
                    reason: error.to_string(),
                });
            }
        };

        let mut outputs = BTreeMap::new();
        outputs.insert("transaction_ref".to_owned(), Value::String(initiation.transaction_ref.clone()));
        outputs.insert("payment_status".to_owned(), Value::String(initiation.status.as_str().to_owned()));
        self.record(
            session,
            correlation_id,
            "integration.payment_initiated",
            AuditCategory::Integration,
            AuditOutcome::Success,
            &[("transaction_ref", initiation.transaction_ref.as_str())],
        );

        let receipt = ActionReceipt::completed(step.action.name(), fingerprint, outputs.clone());
        Ok(ActionOutcome::Done(ActionDone {
            outputs,
            receipt: Some((key, receipt)),
            referral: None,
            claimed: Some(claimed),
        }))
    }

    /// Writes a pending receipt for `key` so no other turn, in this process or
    /// another, starts the same side effect while the provider call runs.
    async fn claim_step(
        &self,
        session: &Session,
        key: &str,
        step: &StepDefinition,
        fingerprint: &str,
        correlation_id: &str,
    ) -> Result<Session, ApplicationError> {
        let max_age = chrono::Duration::from_std(self.gateway.call_timeout() * 2)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        if session
            .completed_actions
            .get(key)
            .is_some_and(|receipt| receipt.is_live_claim(Utc::now(), max_age))
        {
            info!(
                event_name = "flow.action.in_progress",
                correlation_id = %correlation_id,
                session_id = %session.session_id,
                action_key = %key,
                "step action already claimed by another turn"
            );
            return Err(ApplicationError::TurnConflict(session.session_id.clone()));
        }

        let claim = ActionReceipt::pending(step.action.name(), fingerprint);
        Ok(self.store.update(&session.session_id, versioned(session).record_action(key, claim)).await?)
    }

    async fn release_claim(&self, claimed: &Session, key: &str, correlation_id: &str) {
        let Some(claim) = claimed.completed_actions.get(key) else {
            return;
        };
        let patch = versioned(claimed).record_action(key, claim.clone().released());
        if let Err(error) = self.store.update(&claimed.session_id, patch).await {
            warn!(
                event_name = "flow.action.release_failed",
                correlation_id = %correlation_id,
                session_id = %claimed.session_id,
                action_key = %key,
                error = %error,
                "claim left to expire"
            );
        }
    }

    async fn step_reply(
        &self,
        flow: &FlowDefinition,
        step_index: usize,
        session: &Session,
        correlation_id: &str,
    ) -> Reply {
        let Some(view) = step_view(flow, step_index, &session.collected_data) else {
            return Reply::default();
        };
        let products = match flow.step(step_index) {
            Some(step) if step.lists_products => self.products_for(flow, correlation_id).await,
            _ => Vec::new(),
        };
        Reply { message: view.prompt.clone(), next_step: Some(view), products, ..Reply::default() }
    }

    async fn products_for(&self, flow: &FlowDefinition, correlation_id: &str) -> Vec<Product> {
        match self.gateway.list_products().await {
            Ok(products) => products
                .into_iter()
                .filter(|product| {
                    flow.product_category.as_deref().map_or(true, |category| product.category == category)
                })
                .collect(),
            Err(error) => {
                warn!(
                    event_name = "integration.catalogue.unavailable",
                    correlation_id = %correlation_id,
                    flow_id = %flow.flow_id,
                    error = %error,
                    "could not list products for step"
                );
                Vec::new()
            }
        }
    }

    fn flow(&self, flow_id: &str) -> Result<&FlowDefinition, ApplicationError> {
        self.registry.get(flow_id).ok_or_else(|| ApplicationError::FlowNotFound(flow_id.to_owned()))
    }

    fn note_reuse(&self, session: &Session, key: &str, correlation_id: &str) {
        self.record(
            session,
            correlation_id,
            "flow.action.reused",
            AuditCategory::Flow,
            AuditOutcome::Success,
            &[("action_key", key)],
        );
        info!(
            event_name = "flow.action.reused",
            correlation_id = %correlation_id,
            session_id = %session.session_id,
            action_key = %key,
            "reusing recorded action result for identical input"
        );
    }

    fn record(
        &self,
        session: &Session,
        correlation_id: &str,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, &str)],
    ) {
        let event = metadata.iter().fold(
            AuditEvent::new(
                Some(session.session_id.clone()),
                correlation_id,
                event_type,
                category,
                ACTOR,
                outcome,
            ),
            |event, (key, value)| event.with_metadata(*key, *value),
        );
        self.audit.emit(event);
    }
}

fn check(session: &Session, event: FlowEvent) -> Result<TransitionOutcome, ApplicationError> {
    Ok(transition(&session.conversation_state(), &event, None).map_err(DomainError::from)?)
}

fn step_view(
    flow: &FlowDefinition,
    step_index: usize,
    collected: &BTreeMap<String, Value>,
) -> Option<StepView> {
    let step = flow.step(step_index)?;
    Some(StepView {
        flow_id: flow.flow_id.clone(),
        step_name: step.step_name.clone(),
        step_index,
        steps_total: flow.steps_total(),
        prompt: render(&step.prompt, collected),
        required_fields: step.required_fields().into_iter().map(str::to_owned).collect(),
        fields: step.fields.clone(),
    })
}

/// Renders a prompt against the collected data, falling back to the raw text
/// when a placeholder has no value yet.
fn render(template: &str, collected: &BTreeMap<String, Value>) -> String {
    let rendered = Context::from_serialize(collected)
        .and_then(|context| Tera::one_off(template, &context, false));
    match rendered {
        Ok(text) => text,
        Err(error) => {
            warn!(event_name = "flow.prompt.render_failed", error = %error, "prompt rendered as raw text");
            template.to_owned()
        }
    }
}

fn versioned(session: &Session) -> SessionPatch {
    SessionPatch::default().expect_version(session.state_version)
}

/// Answers to the fields declared by the steps up to and including
/// `step_index`. Action outputs never enter it, so the same answers always
/// produce the same request.
fn declared_inputs(
    flow: &FlowDefinition,
    step_index: usize,
    collected: &BTreeMap<String, Value>,
    accepted: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    flow.steps
        .iter()
        .take(step_index + 1)
        .flat_map(|step| step.fields.iter())
        .filter_map(|field| {
            accepted
                .get(&field.name)
                .or_else(|| collected.get(&field.name))
                .map(|value| (field.name.clone(), value.clone()))
        })
        .collect()
}

fn receipt_key(flow: &FlowDefinition, step: &StepDefinition) -> String {
    format!("{}/{}", flow.flow_id, step.step_name)
}

fn fingerprint<T: Serialize>(request: &T) -> Result<String, ApplicationError> {
    let payload = serde_json::to_string(request).map_err(|error| {
        DomainError::InvariantViolation(format!("action input is not serializable: {error}"))
    })?;
    Ok(hash_payload(&payload))
}

fn reusable_receipt<'a>(session: &'a Session, key: &str, fingerprint: &str) -> Option<&'a ActionReceipt> {
    session
        .completed_actions
        .get(key)
        .filter(|receipt| receipt.is_completed() && receipt.input_fingerprint == fingerprint)
}

fn referral_for(decision: QuoteDecision) -> Option<EscalationReason> {
    match decision {
        QuoteDecision::Approved => None,
        QuoteDecision::Referred => Some(EscalationReason::QuoteReferred),
        QuoteDecision::Declined => Some(EscalationReason::Other("quote_declined".to_owned())),
    }
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(text) => Decimal::from_str(text).ok(),
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        _ => None,
    }
}

fn text_value<'a>(data: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::{FlowEngine, FlowEngineDeps, Turn, TurnKind};
    use crate::answers::FlowMenuAnswerSource;
    use crate::audit::InMemoryAuditSink;
    use crate::config::AppConfig;
    use crate::domain::payment::{PaymentInitiation, PaymentRequest, PaymentStatus};
    use crate::domain::quote::{Quote, QuoteRequest};
    use crate::domain::session::{ConversationState, FlowStatus, ReceiptStatus, SessionId};
    use crate::errors::{ApplicationError, DomainError, IntegrationError};
    use crate::escalation::EscalationService;
    use crate::flows::registry::FlowRegistry;
    use crate::integrations::{
        GatewaySettings, IntegrationClients, IntegrationGateway, MockCatalogueClient,
        MockPaymentClient, MockUnderwritingClient, PaymentClient, UnderwritingClient,
    };
    use crate::store::{InMemoryEscalationQueue, InMemorySessionStore, SessionLocks, SessionStore};

    struct SlowUnderwriting;

    #[async_trait]
    impl UnderwritingClient for SlowUnderwriting {
        async fn submit_quote(&self, _request: &QuoteRequest) -> Result<Quote, IntegrationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(IntegrationError::upstream("submit_quote", "unreachable"))
        }
    }

    #[derive(Default)]
    struct RejectingPayments {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PaymentClient for RejectingPayments {
        async fn initiate_payment(
            &self,
            _request: &PaymentRequest,
        ) -> Result<PaymentInitiation, IntegrationError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(IntegrationError::upstream("initiate_payment", "provider returned 503"))
        }

        async fn check_status(&self, _transaction_ref: &str) -> Result<PaymentStatus, IntegrationError> {
            Ok(PaymentStatus::Pending)
        }
    }

    /// Holds every initiation long enough for a second engine to read the session.
    struct DelayedPayments(Arc<MockPaymentClient>);

    #[async_trait]
    impl PaymentClient for DelayedPayments {
        async fn initiate_payment(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentInitiation, IntegrationError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.initiate_payment(request).await
        }

        async fn check_status(&self, transaction_ref: &str) -> Result<PaymentStatus, IntegrationError> {
            self.0.check_status(transaction_ref).await
        }
    }

    struct Harness {
        engine: Arc<FlowEngine>,
        store: Arc<InMemorySessionStore>,
        queue: Arc<InMemoryEscalationQueue>,
        escalation: Arc<EscalationService>,
        audit: Arc<InMemoryAuditSink>,
    }

    fn harness_with(
        underwriting: Arc<dyn UnderwritingClient>,
        payment: Arc<dyn PaymentClient>,
        timeout: Duration,
    ) -> Harness {
        harness_on(Arc::new(InMemorySessionStore::default()), underwriting, payment, timeout)
    }

    /// An engine with its own locks over `store`, like a second server process.
    fn harness_on(
        store: Arc<InMemorySessionStore>,
        underwriting: Arc<dyn UnderwritingClient>,
        payment: Arc<dyn PaymentClient>,
        timeout: Duration,
    ) -> Harness {
        let config = AppConfig::default();
        let registry = Arc::new(FlowRegistry::builtin().expect("builtin flows"));
        let queue = Arc::new(InMemoryEscalationQueue::default());
        let audit = Arc::new(InMemoryAuditSink::default());
        let escalation = Arc::new(EscalationService::new(
            store.clone(),
            Some(queue.clone()),
            Arc::new(SessionLocks::default()),
            audit.clone(),
        ));
        let gateway = IntegrationGateway::new(
            IntegrationClients {
                catalogue: Arc::new(MockCatalogueClient::default()),
                underwriting,
                payment,
            },
            GatewaySettings { timeout, read_retries: 0 },
        );
        let engine = FlowEngine::new(
            FlowEngineDeps {
                store: store.clone(),
                registry: registry.clone(),
                gateway,
                escalation: escalation.clone(),
                answers: Arc::new(FlowMenuAnswerSource::new(registry)),
                audit: audit.clone(),
            },
            &config.flows,
        )
        .expect("engine");

        Harness { engine: Arc::new(engine), store, queue, escalation, audit }
    }

    fn harness() -> (Harness, Arc<MockPaymentClient>) {
        let payments = Arc::new(MockPaymentClient::default());
        let harness = harness_with(
            Arc::new(MockUnderwritingClient::default()),
            payments.clone(),
            Duration::from_secs(5),
        );
        (harness, payments)
    }

    fn form(value: Value) -> Turn {
        match value {
            Value::Object(map) => Turn::form(map),
            _ => Turn::form(Map::new()),
        }
    }

    fn travel_step(index: usize) -> Turn {
        match index {
            0 => form(json!({ "product_id": "worldwide_essential" })),
            1 => form(json!({
                "first_name": "Jane",
                "surname": "Doe",
                "phone_number": "0772 123 456",
                "email": "jane@example.com"
            })),
            2 => form(json!({
                "departure_country": "Uganda",
                "destination_country": "Kenya",
                "departure_date": "2030-01-10",
                "return_date": "2030-01-20",
                "num_travellers": 2
            })),
            3 => form(json!({ "consent": true })),
            _ => form(json!({ "payment_method": "mobile_money", "payer_phone": "0772123456" })),
        }
    }

    async fn travel_session_at(harness: &Harness, step: usize) -> SessionId {
        let session = harness.engine.start_session("u1", "req-0").await.expect("session");
        harness
            .engine
            .handle_turn(&session.session_id, Turn::message("I need travel insurance"), "req-1")
            .await
            .expect("start flow");
        for index in 0..step {
            let outcome = harness
                .engine
                .handle_turn(&session.session_id, travel_step(index), "req-2")
                .await
                .expect("step");
            assert_eq!(outcome.kind, TurnKind::StepAdvanced, "step {index}");
        }
        session.session_id
    }

    #[tokio::test]
    async fn travel_purchase_runs_to_completion() {
        let (harness, payments) = harness();
        let session_id = travel_session_at(&harness, 0).await;

        let step_one = harness.engine.handle_turn(&session_id, travel_step(0), "req-3").await.expect("product");
        assert_eq!(step_one.kind, TurnKind::StepAdvanced);
        let view = step_one.reply.next_step.expect("next step");
        assert_eq!(view.step_name, "about_you");
        assert!(view.prompt.contains("Worldwide Essential"));

        for index in 1..4 {
            harness.engine.handle_turn(&session_id, travel_step(index), "req-4").await.expect("step");
        }
        let consent = harness.store.get(&session_id).await.expect("session");
        assert_eq!(consent.collected_data["premium"], json!("100000"));
        assert_eq!(consent.collected_data["phone_number"], json!("256772123456"));

        let done = harness.engine.handle_turn(&session_id, travel_step(4), "req-5").await.expect("payment");
        assert_eq!(done.kind, TurnKind::FlowCompleted);
        assert_eq!(done.session.flow_status, FlowStatus::Completed);
        let summary = done.reply.summary.expect("summary");
        let reference = summary["transaction_ref"].as_str().expect("reference");
        assert!(done.reply.message.contains(reference));
        assert_eq!(payments.initiated_count(), 1);
        assert!(harness.audit.event_types().contains(&"flow.completed".to_owned()));
    }

    #[tokio::test]
    async fn starting_a_flow_lists_products_of_its_category() {
        let (harness, _) = harness();
        let session = harness.engine.start_session("u1", "req-0").await.expect("session");

        let outcome = harness
            .engine
            .handle_turn(&session.session_id, Turn::message("Do you sell travel insurance?"), "req-1")
            .await
            .expect("start");

        assert_eq!(outcome.kind, TurnKind::FlowStarted);
        assert_eq!(outcome.reply.products.len(), 7);
        assert!(outcome.reply.products.iter().all(|product| product.category == "travel"));
        assert_eq!(
            outcome.session.conversation_state(),
            ConversationState::InFlow { flow_id: "travel_insurance".to_owned(), step_index: 0 }
        );
    }

    #[tokio::test]
    async fn invalid_fields_are_all_reported_and_step_holds() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 1).await;

        let outcome = harness
            .engine
            .handle_turn(
                &session_id,
                form(json!({ "first_name": "Jane", "phone_number": "12", "email": "not-an-email" })),
                "req-3",
            )
            .await
            .expect("rejected turn");

        assert_eq!(outcome.kind, TurnKind::StepRejected);
        let fields: Vec<&str> = outcome.reply.errors.iter().map(|error| error.field.as_str()).collect();
        assert_eq!(fields, vec!["surname", "phone_number", "email"]);
        assert_eq!(outcome.session.current_step, 1);
        assert_eq!(outcome.session.step_failures, 1);
        assert!(!outcome.session.collected_data.contains_key("first_name"));
    }

    #[tokio::test]
    async fn repeated_failures_escalate_after_threshold() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 1).await;
        let bad = || form(json!({ "email": "nope" }));

        for _ in 0..2 {
            let outcome = harness.engine.handle_turn(&session_id, bad(), "req-3").await.expect("turn");
            assert_eq!(outcome.kind, TurnKind::StepRejected);
        }
        let third = harness.engine.handle_turn(&session_id, bad(), "req-4").await.expect("turn");

        assert_eq!(third.kind, TurnKind::Escalated);
        assert!(third.session.escalated);
        assert!(!third.reply.errors.is_empty());
        let records = harness.queue.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "validation_failures");
        let events = harness.audit.event_types();
        assert_eq!(events.iter().filter(|event| *event == "flow.step_rejected").count(), 2);
        assert!(events.contains(&"flow.escalated".to_owned()));
    }

    #[tokio::test]
    async fn escalated_session_ignores_turns_until_released() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 2).await;

        let escalated = harness
            .engine
            .handle_turn(&session_id, Turn::message("can I talk to a real person?"), "req-3")
            .await
            .expect("handoff");
        assert_eq!(escalated.kind, TurnKind::Escalated);
        let version = escalated.session.state_version;

        let ignored = harness.engine.handle_turn(&session_id, travel_step(2), "req-4").await.expect("turn");
        assert_eq!(ignored.kind, TurnKind::EscalationActive);
        assert_eq!(ignored.session.state_version, version);
        assert!(!ignored.session.collected_data.contains_key("premium"));

        harness.escalation.agent_join(&session_id, "agent-1", "req-5").await.expect("join");
        harness.escalation.end_escalation(&session_id, "req-6").await.expect("end");

        let resumed = harness.engine.handle_turn(&session_id, travel_step(2), "req-7").await.expect("turn");
        assert_eq!(resumed.kind, TurnKind::StepAdvanced);
        assert_eq!(resumed.session.current_step, 3);
    }

    #[tokio::test]
    async fn exit_phrase_leaves_the_flow() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 1).await;

        let outcome =
            harness.engine.handle_turn(&session_id, Turn::message("cancel"), "req-3").await.expect("exit");

        assert_eq!(outcome.kind, TurnKind::FlowExited);
        assert_eq!(outcome.session.conversation_state(), ConversationState::Idle);
        assert_eq!(outcome.session.collected_data["product_id"], json!("worldwide_essential"));
    }

    #[tokio::test]
    async fn question_containing_an_exit_word_stays_in_flow() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 2).await;

        let outcome = harness
            .engine
            .handle_turn(&session_id, Turn::message("Does cover stop at the border?"), "req-3")
            .await
            .expect("reprompt");

        assert_eq!(outcome.kind, TurnKind::Reprompted);
        assert_eq!(outcome.session.current_step, 2);
        assert!(!harness.audit.event_types().contains(&"flow.exited".to_owned()));
    }

    #[tokio::test]
    async fn plain_message_inside_flow_reprompts() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 1).await;
        let before = harness.store.get(&session_id).await.expect("session");

        let outcome = harness
            .engine
            .handle_turn(&session_id, Turn::message("what does this cover?"), "req-3")
            .await
            .expect("reprompt");

        assert_eq!(outcome.kind, TurnKind::Reprompted);
        assert_eq!(outcome.reply.next_step.expect("step").step_name, "about_you");
        assert_eq!(outcome.session.state_version, before.state_version);
    }

    #[tokio::test]
    async fn ambiguous_intent_escalates() {
        let (harness, _) = harness();
        let session = harness.engine.start_session("u1", "req-0").await.expect("session");

        let outcome = harness
            .engine
            .handle_turn(&session.session_id, Turn::message("travel or car, not sure"), "req-1")
            .await
            .expect("turn");

        assert_eq!(outcome.kind, TurnKind::Escalated);
        assert_eq!(outcome.session.escalation_reason.as_deref(), Some("ambiguous_intent"));
    }

    #[tokio::test]
    async fn unmatched_message_gets_an_answer() {
        let (harness, _) = harness();
        let session = harness.engine.start_session("u1", "req-0").await.expect("session");

        let outcome = harness
            .engine
            .handle_turn(&session.session_id, Turn::message("hello there"), "req-1")
            .await
            .expect("turn");

        assert_eq!(outcome.kind, TurnKind::Answered);
        assert!(outcome.reply.message.contains("Travel Insurance"));
        assert_eq!(outcome.session.conversation_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn form_without_flow_and_empty_turns_are_rejected() {
        let (harness, _) = harness();
        let session = harness.engine.start_session("u1", "req-0").await.expect("session");

        let no_flow = harness
            .engine
            .handle_turn(&session.session_id, travel_step(0), "req-1")
            .await
            .expect_err("no active flow");
        assert_eq!(no_flow, ApplicationError::Domain(DomainError::NoActiveFlow));

        let empty = harness
            .engine
            .handle_turn(&session.session_id, Turn::message("   "), "req-2")
            .await
            .expect_err("empty turn");
        assert_eq!(empty, ApplicationError::Domain(DomainError::EmptyTurn));
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let (harness, _) = harness();

        let error = harness
            .engine
            .handle_turn(&SessionId::from("missing"), Turn::message("travel"), "req-1")
            .await
            .expect_err("missing session");

        assert!(matches!(error, ApplicationError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn product_from_another_category_is_rejected() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 0).await;

        let outcome = harness
            .engine
            .handle_turn(&session_id, form(json!({ "product_id": "motor_comprehensive" })), "req-3")
            .await
            .expect("turn");

        assert_eq!(outcome.kind, TurnKind::StepRejected);
        assert_eq!(outcome.reply.errors[0].field, "product_id");
        assert_eq!(outcome.session.current_step, 0);
    }

    #[tokio::test]
    async fn resubmitted_step_is_replayed_without_changes() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 1).await;
        let before = harness.store.get(&session_id).await.expect("session");

        let outcome = harness.engine.handle_turn(&session_id, travel_step(0), "req-3").await.expect("replay");

        assert_eq!(outcome.kind, TurnKind::Replayed);
        assert_eq!(outcome.session, before);
        assert_eq!(outcome.reply.next_step.expect("step").step_name, "about_you");
        assert!(harness.audit.event_types().contains(&"flow.replayed".to_owned()));
    }

    #[tokio::test]
    async fn quote_timeout_leaves_session_untouched() {
        let harness = harness_with(
            Arc::new(SlowUnderwriting),
            Arc::new(MockPaymentClient::default()),
            Duration::from_millis(50),
        );
        let session_id = travel_session_at(&harness, 2).await;
        let before = harness.store.get(&session_id).await.expect("session");

        let error = harness.engine.handle_turn(&session_id, travel_step(2), "req-3").await.expect_err("timeout");

        assert!(matches!(error, ApplicationError::Integration(IntegrationError::Timeout { .. })));
        assert_eq!(harness.store.get(&session_id).await.expect("session"), before);
    }

    #[tokio::test]
    async fn failed_payment_is_unconfirmed_and_not_advanced() {
        let payments = Arc::new(RejectingPayments::default());
        let harness = harness_with(
            Arc::new(MockUnderwritingClient::default()),
            payments.clone(),
            Duration::from_secs(5),
        );
        let session_id = travel_session_at(&harness, 4).await;

        let error =
            harness.engine.handle_turn(&session_id, travel_step(4), "req-3").await.expect_err("payment");

        assert!(matches!(error, ApplicationError::PaymentUnconfirmed { ref step, .. } if step == "payment"));
        let session = harness.store.get(&session_id).await.expect("session");
        assert_eq!(session.current_step, 4);
        assert!(!session.collected_data.contains_key("transaction_ref"));
        assert_eq!(session.completed_actions["travel_insurance/payment"].status, ReceiptStatus::Released);

        harness.engine.handle_turn(&session_id, travel_step(4), "req-4").await.expect_err("retry");
        assert_eq!(payments.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_payment_submissions_initiate_one_payment() {
        let (harness, payments) = harness();
        let session_id = travel_session_at(&harness, 4).await;

        let handles: Vec<_> = (0..8)
            .map(|attempt| {
                let engine = harness.engine.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    engine.handle_turn(&session_id, travel_step(4), &format!("req-{attempt}")).await
                })
            })
            .collect();

        let mut kinds = Vec::new();
        for handle in handles {
            kinds.push(handle.await.expect("join").expect("turn").kind);
        }

        assert_eq!(kinds.iter().filter(|kind| **kind == TurnKind::FlowCompleted).count(), 1);
        assert_eq!(kinds.iter().filter(|kind| **kind == TurnKind::Replayed).count(), 7);
        assert_eq!(payments.initiated_count(), 1);
    }

    #[tokio::test]
    async fn engines_sharing_a_store_initiate_one_payment() {
        let payments = Arc::new(MockPaymentClient::default());
        let first = harness_with(
            Arc::new(MockUnderwritingClient::default()),
            Arc::new(DelayedPayments(payments.clone())),
            Duration::from_secs(5),
        );
        let second = harness_on(
            first.store.clone(),
            Arc::new(MockUnderwritingClient::default()),
            Arc::new(DelayedPayments(payments.clone())),
            Duration::from_secs(5),
        );
        let session_id = travel_session_at(&first, 4).await;

        let (left, right) = tokio::join!(
            first.engine.handle_turn(&session_id, travel_step(4), "req-a"),
            second.engine.handle_turn(&session_id, travel_step(4), "req-b"),
        );

        let mut completed = Vec::new();
        for result in [left, right] {
            match result {
                Ok(outcome) if outcome.kind == TurnKind::FlowCompleted => completed.push(outcome),
                Ok(outcome) => assert_eq!(outcome.kind, TurnKind::Replayed),
                Err(error) => assert!(error.is_retryable(), "unexpected error: {error}"),
            }
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(payments.initiated_count(), 1);

        let retried =
            second.engine.handle_turn(&session_id, travel_step(4), "req-c").await.expect("retry");
        assert_eq!(retried.kind, TurnKind::Replayed);
        assert_eq!(payments.initiated_count(), 1);

        let stored = first.store.get(&session_id).await.expect("session");
        assert_eq!(stored.collected_data["transaction_ref"], completed[0].session.collected_data["transaction_ref"]);
        assert_eq!(stored.completed_actions["travel_insurance/payment"].status, ReceiptStatus::Completed);
    }

    #[tokio::test]
    async fn restarted_flow_reuses_recorded_quote() {
        let (harness, _) = harness();
        let session_id = travel_session_at(&harness, 3).await;

        let exited =
            harness.engine.handle_turn(&session_id, Turn::message("cancel"), "req-3").await.expect("exit");
        assert_eq!(exited.kind, TurnKind::FlowExited);
        let restarted = harness
            .engine
            .handle_turn(&session_id, Turn::message("I need travel insurance"), "req-4")
            .await
            .expect("restart");
        assert_eq!(restarted.kind, TurnKind::FlowStarted);
        for index in 0..3 {
            let outcome =
                harness.engine.handle_turn(&session_id, travel_step(index), "req-5").await.expect("step");
            assert_eq!(outcome.kind, TurnKind::StepAdvanced, "step {index}");
        }

        let events = harness.audit.event_types();
        assert_eq!(events.iter().filter(|event| *event == "integration.quote_submitted").count(), 1);
        assert!(events.contains(&"flow.action.reused".to_owned()));
        let session = harness.store.get(&session_id).await.expect("session");
        assert_eq!(session.current_step, 3);
        assert!(session.collected_data.contains_key("quote_id"));
    }

    async fn serenicare_session_at_quote(harness: &Harness) -> SessionId {
        let session = harness.engine.start_session("u1", "req-0").await.expect("session");
        let id = session.session_id;
        let started = harness
            .engine
            .handle_turn(&id, Turn::message("I need health insurance"), "req-1")
            .await
            .expect("start");
        assert_eq!(started.kind, TurnKind::FlowStarted);
        assert_eq!(started.reply.products.len(), 4);
        for step in [
            json!({ "product_id": "serenicare_classic" }),
            json!({ "date_of_birth": "1990-04-01", "include_children": true }),
            json!({ "outpatient": true, "dental": true }),
        ] {
            let outcome = harness.engine.handle_turn(&id, form(step), "req-2").await.expect("step");
            assert_eq!(outcome.kind, TurnKind::StepAdvanced);
        }
        id
    }

    #[tokio::test]
    async fn serenicare_quote_prices_selected_benefits() {
        let (harness, _) = harness();
        let id = serenicare_session_at_quote(&harness).await;

        let outcome = harness
            .engine
            .handle_turn(&id, form(json!({ "medical_conditions": "No" })), "req-3")
            .await
            .expect("quote");

        assert_eq!(outcome.kind, TurnKind::StepAdvanced);
        assert_eq!(outcome.session.collected_data["premium"], json!("103000"));
        assert_eq!(outcome.reply.next_step.expect("step").step_name, "about_you");
    }

    #[tokio::test]
    async fn serenicare_condition_hands_off_for_review() {
        let (harness, _) = harness();
        let id = serenicare_session_at_quote(&harness).await;

        let outcome = harness
            .engine
            .handle_turn(&id, form(json!({ "medical_conditions": "yes" })), "req-3")
            .await
            .expect("quote");

        assert_eq!(outcome.kind, TurnKind::Escalated);
        assert_eq!(outcome.session.escalation_reason.as_deref(), Some("quote_referred"));
    }

    #[tokio::test]
    async fn referred_motor_quote_hands_off_with_quote_kept() {
        let (harness, _) = harness();
        let session = harness.engine.start_session("u1", "req-0").await.expect("session");
        let id = session.session_id;
        harness.engine.handle_turn(&id, Turn::message("car insurance please"), "req-1").await.expect("start");
        harness
            .engine
            .handle_turn(&id, form(json!({ "product_id": "motor_comprehensive" })), "req-2")
            .await
            .expect("product");
        harness
            .engine
            .handle_turn(
                &id,
                form(json!({ "full_name": "John Okello", "phone_number": "0701234567", "email": "john@example.com" })),
                "req-3",
            )
            .await
            .expect("owner");

        let outcome = harness
            .engine
            .handle_turn(
                &id,
                form(json!({
                    "registration_number": "UBA 123A",
                    "make": "Toyota",
                    "model": "Corolla",
                    "year_of_manufacture": 1990,
                    "vehicle_value": "12,000,000"
                })),
                "req-4",
            )
            .await
            .expect("vehicle");

        assert_eq!(outcome.kind, TurnKind::Escalated);
        assert_eq!(outcome.session.escalation_reason.as_deref(), Some("quote_referred"));
        assert!(outcome.session.collected_data.contains_key("quote_id"));
        assert_eq!(outcome.session.completed_actions.len(), 1);
    }
}
