//! Order ownership and lifecycle state machine.

mod machine;

pub use machine::{OrderError, OrderStateMachine, TransitionData, is_valid_transition, valid_next_states};
