//! # State Machine Module
//!
//! Closed-enumeration job and item states with compile-time-checkable
//! transitions. Job transitions are event-driven and persisted with an audit
//! trail; item transitions are simple enough to live in the checkpoint
//! store's conditional updates.

pub mod events;
pub mod job_state_machine;
pub mod states;

pub use events::JobEvent;
pub use job_state_machine::{determine_target_state, JobStateMachine};
pub use states::{ItemState, JobState};
