//! Per-vehicle movement command sequencing.
//!
//! Every command handed to a vehicle sits in two queues:
//!
//! - the position queue, consumed when the vehicle reports standing on the
//!   command's source point;
//! - the completion queue, consumed when the step is reported back to the
//!   orchestrator as executed.
//!
//! Both are FIFO and only ever compared at their head, so a report that skips
//! a step is detected instead of being applied out of order.

use std::collections::VecDeque;

use agvlink_core::SequenceMismatchError;
use parking_lot::Mutex;

use crate::movement::MovementCommand;

/// Result of applying a position report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionOutcome {
    /// No command was outstanding; only the position was recorded.
    Untracked,
    /// The head step was confirmed and its completion is reported.
    Advanced(MovementCommand),
    /// The head step was confirmed; its completion waits for a station
    /// action, after which [`CommandQueueSequencer::advance`] must be called.
    ActionRequired(MovementCommand),
    /// The head step was confirmed while a station action is still running.
    Confirmed(MovementCommand),
}

#[derive(Debug, Default)]
struct SequencerState {
    positions: VecDeque<MovementCommand>,
    completions: VecDeque<MovementCommand>,
    unsent: Vec<MovementCommand>,
    last_position: Option<String>,
    idle: bool,
    action: Option<MovementCommand>,
}

/// Command queues of one vehicle.
#[derive(Debug)]
pub struct CommandQueueSequencer {
    vehicle: String,
    state: Mutex<SequencerState>,
}

impl CommandQueueSequencer {
    /// Create an empty sequencer for `vehicle`.
    pub fn new(vehicle: impl Into<String>) -> Self {
        Self {
            vehicle: vehicle.into(),
            state: Mutex::new(SequencerState {
                idle: true,
                ..Default::default()
            }),
        }
    }

    pub fn vehicle(&self) -> &str {
        &self.vehicle
    }

    /// Append a command; it stays unsent until [`take_unsent`](Self::take_unsent).
    pub fn enqueue(&self, cmd: MovementCommand) {
        let mut state = self.state.lock();
        tracing::debug!(
            vehicle = %self.vehicle,
            source = %cmd.source_point,
            destination = %cmd.destination_point,
            queued = state.positions.len() + 1,
            "Movement command enqueued"
        );
        state.positions.push_back(cmd.clone());
        state.completions.push_back(cmd.clone());
        state.unsent.push(cmd);
    }

    /// Take every command enqueued since the last call.
    pub fn take_unsent(&self) -> Vec<MovementCommand> {
        std::mem::take(&mut self.state.lock().unsent)
    }

    /// Put a batch that could not be sent back in front of the unsent steps.
    ///
    /// Steps dropped from the position queue in the meantime are discarded.
    pub fn requeue_unsent(&self, batch: Vec<MovementCommand>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut restored: Vec<MovementCommand> = batch
            .into_iter()
            .filter(|cmd| state.positions.iter().any(|p| p.id == cmd.id))
            .collect();
        if restored.is_empty() {
            return;
        }
        tracing::debug!(vehicle = %self.vehicle, steps = restored.len(), "Unsent steps restored");
        restored.append(&mut state.unsent);
        state.unsent = restored;
    }

    /// Number of steps waiting for the next flush.
    pub fn unsent_len(&self) -> usize {
        self.state.lock().unsent.len()
    }

    /// Apply a position report from the vehicle.
    ///
    /// On mismatch the queues are left untouched.
    pub fn on_position_report(
        &self,
        position: &str,
    ) -> Result<PositionOutcome, SequenceMismatchError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.idle = false;

        let head = match state.positions.front() {
            Some(head) => head,
            None => {
                state.last_position = Some(position.to_string());
                return Ok(PositionOutcome::Untracked);
            }
        };

        if head.source_point != position {
            return Err(SequenceMismatchError {
                vehicle: self.vehicle.clone(),
                expected: head.source_point.clone(),
                reported: position.to_string(),
            });
        }

        let confirmed = state.positions.pop_front();
        state.last_position = Some(position.to_string());
        tracing::debug!(
            vehicle = %self.vehicle,
            position,
            remaining = state.positions.len(),
            "Position report matches queue head"
        );

        if state.action.is_some() {
            return Ok(confirmed
                .map(PositionOutcome::Confirmed)
                .unwrap_or(PositionOutcome::Untracked));
        }

        match state.completions.front() {
            Some(done) if done.needs_action() => {
                let done = done.clone();
                state.action = Some(done.clone());
                Ok(PositionOutcome::ActionRequired(done))
            }
            Some(_) => Ok(state
                .completions
                .pop_front()
                .map(PositionOutcome::Advanced)
                .unwrap_or(PositionOutcome::Untracked)),
            None => Ok(confirmed
                .map(PositionOutcome::Confirmed)
                .unwrap_or(PositionOutcome::Untracked)),
        }
    }

    /// Finish the pending station action.
    ///
    /// Pops the completion head and returns it only if it is the command the
    /// action was started for.
    pub fn advance(&self) -> Option<MovementCommand> {
        let mut state = self.state.lock();
        let expected = state.action.take();
        let popped = state.completions.pop_front();
        match (expected, popped) {
            (Some(expected), Some(popped)) if expected == popped => Some(popped),
            (expected, popped) => {
                tracing::warn!(
                    vehicle = %self.vehicle,
                    expected = ?expected.map(|c| c.id),
                    popped = ?popped.map(|c| c.id),
                    "Completion head does not match the finished action"
                );
                None
            }
        }
    }

    /// Give up on the pending station action.
    ///
    /// The step it was started for is dropped from the completion queue
    /// without being reported as executed, so later reports advance again.
    pub fn abort_action(&self) -> Option<MovementCommand> {
        let mut state = self.state.lock();
        let action = state.action.take()?;
        if state.completions.front().map(|c| c.id == action.id) == Some(true) {
            state.completions.pop_front();
        }
        tracing::warn!(vehicle = %self.vehicle, operation = %action.operation, "Station action aborted");
        Some(action)
    }

    /// Command whose station action is running, if any.
    pub fn pending_action(&self) -> Option<MovementCommand> {
        self.state.lock().action.clone()
    }

    /// Drop every outstanding command.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.positions.len();
        state.positions.clear();
        state.completions.clear();
        state.unsent.clear();
        state.action = None;
        if dropped > 0 {
            tracing::info!(vehicle = %self.vehicle, dropped, "Command queues cleared");
        }
    }

    /// Number of steps awaiting a position report.
    pub fn len(&self) -> usize {
        self.state.lock().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().positions.is_empty()
    }

    /// Number of steps not yet reported as executed.
    pub fn completion_len(&self) -> usize {
        self.state.lock().completions.len()
    }

    /// Source point of the next expected step.
    pub fn head_source(&self) -> Option<String> {
        self.state
            .lock()
            .positions
            .front()
            .map(|c| c.source_point.clone())
    }

    pub fn last_position(&self) -> Option<String> {
        self.state.lock().last_position.clone()
    }

    /// No step is outstanding and no station action is running.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.positions.is_empty() && state.completions.is_empty() && state.action.is_none()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().idle
    }

    pub fn set_idle(&self, idle: bool) {
        self.state.lock().idle = idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_on_empty_queue_is_untracked() {
        let seq = CommandQueueSequencer::new("agv-1");
        assert_eq!(seq.on_position_report("P1").unwrap(), PositionOutcome::Untracked);
        assert_eq!(seq.last_position().as_deref(), Some("P1"));
        assert!(!seq.is_idle());
    }

    #[test]
    fn test_matching_report_advances() {
        let seq = CommandQueueSequencer::new("agv-1");
        let cmd = MovementCommand::new("A", "B");
        seq.enqueue(cmd.clone());

        assert_eq!(
            seq.on_position_report("A").unwrap(),
            PositionOutcome::Advanced(cmd)
        );
        assert!(seq.is_empty());
        assert_eq!(seq.completion_len(), 0);
    }

    #[test]
    fn test_mismatch_leaves_queue_intact() {
        let seq = CommandQueueSequencer::new("agv-1");
        seq.enqueue(MovementCommand::new("A", "B"));

        let err = seq.on_position_report("Z").unwrap_err();
        assert_eq!(err.expected, "A");
        assert_eq!(err.reported, "Z");
        assert_eq!(seq.len(), 1);
        assert_eq!(seq.head_source().as_deref(), Some("A"));
        assert_eq!(seq.last_position(), None);
    }

    #[test]
    fn test_reports_must_follow_queue_order() {
        let seq = CommandQueueSequencer::new("agv-1");
        seq.enqueue(MovementCommand::new("A", "B"));
        seq.enqueue(MovementCommand::new("B", "C"));

        assert!(seq.on_position_report("B").is_err());
        assert!(seq.on_position_report("A").is_ok());
        assert!(seq.on_position_report("B").is_ok());
        assert!(seq.is_empty());
    }

    #[test]
    fn test_final_step_with_operation_waits_for_action() {
        let seq = CommandQueueSequencer::new("agv-1");
        let cmd = MovementCommand::new("A", "B").with_operation("Load").as_final();
        seq.enqueue(cmd.clone());

        assert_eq!(
            seq.on_position_report("A").unwrap(),
            PositionOutcome::ActionRequired(cmd.clone())
        );
        assert_eq!(seq.completion_len(), 1);
        assert_eq!(seq.pending_action(), Some(cmd.clone()));

        assert_eq!(seq.advance(), Some(cmd));
        assert_eq!(seq.completion_len(), 0);
        assert!(seq.pending_action().is_none());
    }

    #[test]
    fn test_advance_without_action_reports_nothing() {
        let seq = CommandQueueSequencer::new("agv-1");
        seq.enqueue(MovementCommand::new("A", "B"));
        assert_eq!(seq.advance(), None);
        assert_eq!(seq.completion_len(), 0);
    }

    #[test]
    fn test_take_unsent_and_clear() {
        let seq = CommandQueueSequencer::new("agv-1");
        seq.enqueue(MovementCommand::new("A", "B"));
        seq.enqueue(MovementCommand::new("B", "C"));
        assert_eq!(seq.take_unsent().len(), 2);
        assert!(seq.take_unsent().is_empty());

        seq.enqueue(MovementCommand::new("C", "D"));
        seq.clear();
        assert!(seq.is_empty());
        assert_eq!(seq.completion_len(), 0);
        assert!(seq.take_unsent().is_empty());
    }

    #[test]
    fn test_requeue_unsent_keeps_order() {
        let seq = CommandQueueSequencer::new("agv-1");
        seq.enqueue(MovementCommand::new("A", "B"));
        seq.enqueue(MovementCommand::new("B", "C"));
        let batch = seq.take_unsent();

        seq.enqueue(MovementCommand::new("C", "D"));
        seq.requeue_unsent(batch);

        let sources: Vec<String> = seq
            .take_unsent()
            .into_iter()
            .map(|c| c.source_point)
            .collect();
        assert_eq!(sources, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_requeue_skips_cleared_steps() {
        let seq = CommandQueueSequencer::new("agv-1");
        seq.enqueue(MovementCommand::new("A", "B"));
        let batch = seq.take_unsent();
        seq.clear();

        seq.requeue_unsent(batch);
        assert_eq!(seq.unsent_len(), 0);
    }

    #[test]
    fn test_aborted_action_lets_later_reports_advance() {
        let seq = CommandQueueSequencer::new("agv-1");
        let weld = MovementCommand::new("A", "B").with_operation("Weld").as_final();
        let next = MovementCommand::new("B", "C");
        seq.enqueue(weld.clone());
        seq.enqueue(next.clone());

        assert_eq!(
            seq.on_position_report("A").unwrap(),
            PositionOutcome::ActionRequired(weld.clone())
        );
        assert_eq!(seq.abort_action(), Some(weld));
        assert!(seq.pending_action().is_none());
        assert_eq!(seq.completion_len(), 1);

        assert_eq!(
            seq.on_position_report("B").unwrap(),
            PositionOutcome::Advanced(next)
        );
        assert!(seq.is_drained());
        assert_eq!(seq.abort_action(), None);
    }
}
