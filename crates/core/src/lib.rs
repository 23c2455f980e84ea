pub mod answers;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod flows;
pub mod integrations;
pub mod store;

pub use answers::{AnswerSource, FlowMenuAnswerSource};
pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use domain::escalation::{EscalationReason, EscalationRecord, EscalationStatus};
pub use domain::product::{Product, ProductId};
pub use domain::quote::{Quote, QuoteDecision, QuoteId};
pub use domain::session::{ConversationState, FlowStatus, Session, SessionId, SessionPatch};
pub use errors::{
    ApplicationError, DomainError, FieldError, IntegrationError, InterfaceError, StoreError,
};
pub use escalation::EscalationService;
pub use flows::{FlowEngine, FlowEngineDeps, FlowRegistry, Turn, TurnKind, TurnOutcome};
pub use integrations::{IntegrationClients, IntegrationGateway};
pub use store::{EscalationQueue, SessionLocks, SessionStore};
