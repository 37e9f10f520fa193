//! Sequencer tests across threads and full drive orders.

use std::sync::Arc;

use agvlink_commands::{CommandQueueSequencer, MovementCommand, PositionOutcome};

/// Helper to build a drive order through `points`, with an optional final operation.
fn make_route(points: &[&str], operation: Option<&str>) -> Vec<MovementCommand> {
    let steps = points.len().saturating_sub(1);
    points
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let cmd = MovementCommand::new(pair[0], pair[1]);
            match (i + 1 == steps, operation) {
                (true, Some(op)) => cmd.with_operation(op).as_final(),
                (true, None) => cmd.as_final(),
                _ => cmd,
            }
        })
        .collect()
}

#[test]
fn test_full_route_without_operation() {
    let seq = CommandQueueSequencer::new("agv-1");
    let route = make_route(&["A", "B", "C", "D"], None);
    for cmd in route.iter().cloned() {
        seq.enqueue(cmd);
    }

    for (cmd, report) in route.iter().zip(["A", "B", "C"]) {
        assert_eq!(
            seq.on_position_report(report).unwrap(),
            PositionOutcome::Advanced(cmd.clone())
        );
    }
    assert!(seq.is_empty());
    assert_eq!(seq.last_position().as_deref(), Some("C"));

    // Arrival at the destination is outside the queue.
    assert_eq!(seq.on_position_report("D").unwrap(), PositionOutcome::Untracked);
}

#[test]
fn test_route_ending_in_station_action() {
    let seq = CommandQueueSequencer::new("agv-1");
    let route = make_route(&["A", "B", "C"], Some("Unload"));
    for cmd in route.iter().cloned() {
        seq.enqueue(cmd);
    }

    assert!(matches!(
        seq.on_position_report("A").unwrap(),
        PositionOutcome::Advanced(_)
    ));
    let outcome = seq.on_position_report("B").unwrap();
    assert_eq!(outcome, PositionOutcome::ActionRequired(route[1].clone()));

    assert_eq!(seq.advance(), Some(route[1].clone()));
    assert_eq!(seq.completion_len(), 0);
}

#[test]
fn test_mismatch_midway_keeps_remaining_steps() {
    let seq = CommandQueueSequencer::new("agv-1");
    for cmd in make_route(&["A", "B", "C"], None) {
        seq.enqueue(cmd);
    }
    seq.on_position_report("A").unwrap();

    let err = seq.on_position_report("X").unwrap_err();
    assert_eq!(err.vehicle, "agv-1");
    assert_eq!(err.expected, "B");
    assert_eq!(seq.len(), 1);
    assert_eq!(seq.last_position().as_deref(), Some("A"));
}

#[test]
fn test_vehicles_are_independent() {
    let first = Arc::new(CommandQueueSequencer::new("agv-1"));
    let second = Arc::new(CommandQueueSequencer::new("agv-2"));

    let handles: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|seq| {
            std::thread::spawn(move || {
                for i in 0..100 {
                    seq.enqueue(MovementCommand::new(format!("P{i}"), format!("P{}", i + 1)));
                }
                for i in 0..100 {
                    seq.on_position_report(&format!("P{i}")).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(first.is_empty());
    assert!(second.is_empty());
    assert_eq!(first.last_position().as_deref(), Some("P99"));
}
