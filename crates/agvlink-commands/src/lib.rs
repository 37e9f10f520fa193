//! Movement command handling for vehicles.
//!
//! Provides:
//! - Movement command data structures
//! - Per-vehicle command sequencing against position reports
//! - Load-state capability rules
//! - Retransmission of responses until acknowledged

pub mod capability;
pub mod movement;
pub mod retransmit;
pub mod sequencer;

// Re-exports
pub use capability::{can_process, ExplainedBool, LoadState};
pub use movement::{MovementCommand, NO_OPERATION};
pub use retransmit::{RetransmissionQueue, RetryEntry, RetryKey};
pub use sequencer::{CommandQueueSequencer, PositionOutcome};
