//! Application state machine seam.

pub mod dictionary;
pub mod traits;

pub use dictionary::{DictionaryCommand, DictionaryStateMachine};
pub use traits::{SharedStateMachine, StateMachine, StateMachineError};
