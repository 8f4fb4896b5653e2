//! flowbot Engine - stateless flow logic
//!
//! The engine resolves steps from a `FlowSource`, validates input, picks the
//! next step from branch conditions and runs named handlers, keyboard
//! providers and validators from an immutable `Capabilities` table.

pub mod capabilities;
pub mod condition;
pub mod engine;
pub mod validation;

pub use capabilities::{
    Capabilities, ConditionEvaluator, KeyboardProvider, StepHandler, Validator,
};
pub use condition::Condition;
pub use engine::{FlowEngine, StepInput, StepOutcome};
pub use validation::ValidationError;
