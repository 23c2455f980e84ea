//! Flow registry, step validation, trigger matching and the turn engine.

pub mod definition;
pub mod engine;
pub mod registry;
pub mod states;
pub mod triggers;
pub mod validator;

pub use definition::{FieldFormat, FieldSpec, FlowDefinition, StepAction, StepDefinition};
pub use engine::{FlowEngine, FlowEngineDeps, Reply, StepView, Turn, TurnKind, TurnOutcome};
pub use registry::{FlowRegistry, RegistryError};
pub use states::{transition, FlowEvent, FlowTransitionError, TransitionOutcome};
pub use triggers::{PhraseMatcher, TriggerMatch, TriggerMatcher};
pub use validator::{normalize_phone, StepValidator};
