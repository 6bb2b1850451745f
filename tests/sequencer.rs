// Dispense sequence ordering, completion predicates, and abort behavior.

mod common;

use std::sync::Arc;

use common::MockLink;
use feeder_rs::config::MechanicsConfig;
use feeder_rs::motion::{MotionController, ProtocolState};
use feeder_rs::sequencer::{DispensePhase, DispenseSequencer};

async fn rig() -> (DispenseSequencer, MotionController, Arc<MockLink>) {
    let link = Arc::new(MockLink::default());
    let mut machine = MotionController::new(link.clone(), false);
    machine.connect().await.unwrap();
    let sequencer = DispenseSequencer::new(MechanicsConfig::default());
    (sequencer, machine, link)
}

/// Feed the machine acks until it reaches a settled state, mirroring what
/// the firmware would send for the command the current phase issued.
async fn settle(machine: &mut MotionController) {
    for _ in 0..4 {
        match machine.state() {
            ProtocolState::HomingX
            | ProtocolState::HomingZ
            | ProtocolState::ZMoveStarted
            | ProtocolState::ZMoveAwaitComplete1
            | ProtocolState::ZMoveAwaitComplete2
            | ProtocolState::MoveStarted
            | ProtocolState::MoveAwaitComplete
            | ProtocolState::AwaitingPosition => machine.on_line("ok").await.unwrap(),
            _ => return,
        }
    }
}

#[tokio::test]
async fn full_sequence_visits_phases_in_order_and_decrements_cans() {
    let (mut seq, mut machine, link) = rig().await;
    let mut cans = 3u32;

    seq.start(&mut machine).await.unwrap();
    assert_eq!(seq.phase(), DispensePhase::XHoming);

    let expected_order = [
        DispensePhase::XHoming,
        DispensePhase::XToStart,
        DispensePhase::TabLifting,
        DispensePhase::LidPeeling,
        DispensePhase::XRehoming,
        DispensePhase::ZLiftToEject,
        DispensePhase::XEject,
        DispensePhase::XRehomingFinal,
        DispensePhase::ZNextCan,
    ];
    let mut visited = Vec::new();

    while seq.is_active() {
        visited.push(seq.phase());
        // Entry pass issues the phase's command
        assert!(seq.tick(&mut machine, &mut cans).await.unwrap());
        // Nothing advances until the completion predicate holds
        assert!(!seq.tick(&mut machine, &mut cans).await.unwrap());
        settle(&mut machine).await;
        // Predicate satisfied exactly once advances exactly one phase
        assert!(seq.tick(&mut machine, &mut cans).await.unwrap());
    }

    assert_eq!(visited, expected_order);
    assert_eq!(cans, 2);
    assert_eq!(seq.phase(), DispensePhase::Idle);
    assert_eq!(machine.state(), ProtocolState::Idle);

    // The exact command transcript for one dispense, in order.
    assert_eq!(
        link.sent_lines(),
        vec![
            "G90",
            "M106 P0 S255",
            "M106 P1 S255",
            "G28 X",
            "G0 X165.000 F600",
            "M400",
            "G0 X248.000 F150",
            "M400",
            "G0 X25.000 F150",
            "M400",
            "G28 X",
            "G0 Z21.000 F300",
            "M400",
            "G0 X248.000 F600",
            "M400",
            "G28 X",
            "G0 Z58.000 F300",
            "M400",
        ]
    );
}

#[tokio::test]
async fn phases_do_not_advance_without_their_predicate() {
    let (mut seq, mut machine, _link) = rig().await;
    let mut cans = 1u32;

    seq.start(&mut machine).await.unwrap();
    assert!(seq.tick(&mut machine, &mut cans).await.unwrap()); // home X issued

    // A lone ack in HomingX yields XHomed, but an unrelated busy echo first
    // must change nothing.
    machine.on_line("echo:busy: processing").await.unwrap();
    assert!(!seq.tick(&mut machine, &mut cans).await.unwrap());
    assert_eq!(seq.phase(), DispensePhase::XHoming);

    machine.on_line("ok").await.unwrap();
    assert!(seq.tick(&mut machine, &mut cans).await.unwrap());
    assert_eq!(seq.phase(), DispensePhase::XToStart);
}

#[tokio::test]
async fn eject_only_skips_opening_phases() {
    let (mut seq, mut machine, link) = rig().await;
    let mut cans = 1u32;

    seq.start_eject_only(&mut machine).await.unwrap();
    assert_eq!(seq.phase(), DispensePhase::ZLiftToEject);

    let mut visited = Vec::new();
    while seq.is_active() {
        visited.push(seq.phase());
        assert!(seq.tick(&mut machine, &mut cans).await.unwrap());
        settle(&mut machine).await;
        assert!(seq.tick(&mut machine, &mut cans).await.unwrap());
    }

    assert_eq!(
        visited,
        [
            DispensePhase::ZLiftToEject,
            DispensePhase::XEject,
            DispensePhase::XRehomingFinal,
            DispensePhase::ZNextCan,
        ]
    );
    assert_eq!(cans, 0);
    // No opening moves were issued
    let sent = link.sent_lines();
    assert!(!sent.iter().any(|l| l.starts_with("G0 X165")));
    assert!(!sent.iter().any(|l| l.starts_with("G0 X25")));
}

#[tokio::test]
async fn abort_from_any_phase_returns_to_idle_with_latches_clear() {
    for phases_to_run in 0..5 {
        let (mut seq, mut machine, link) = rig().await;
        let mut cans = 2u32;

        seq.start(&mut machine).await.unwrap();
        for _ in 0..phases_to_run {
            seq.tick(&mut machine, &mut cans).await.unwrap();
            settle(&mut machine).await;
            seq.tick(&mut machine, &mut cans).await.unwrap();
        }

        assert!(seq.abort(&mut machine).await.unwrap());
        assert_eq!(seq.phase(), DispensePhase::Idle);
        assert_eq!(machine.state(), ProtocolState::Idle);
        let sent = link.sent_lines();
        assert!(sent.contains(&"M112".to_string()));
        assert!(sent.contains(&"M106 P0 S0".to_string()));
        assert!(sent.contains(&"M106 P1 S0".to_string()));
        assert_eq!(cans, 2, "abort must not consume a can");

        // Abort is a no-op once idle
        assert!(!seq.abort(&mut machine).await.unwrap());

        // Latches are clear: a fresh start re-runs phase 1's entry action
        seq.start(&mut machine).await.unwrap();
        let before = link.sent_lines().len();
        assert!(seq.tick(&mut machine, &mut cans).await.unwrap());
        let after = link.sent_lines();
        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last().unwrap(), "G28 X");
    }
}

#[tokio::test]
async fn restored_phase_reruns_its_entry_action() {
    let (mut seq, mut machine, link) = rig().await;
    let mut cans = 2u32;

    // As after a restart: phase restored from the snapshot, machine idle.
    seq.set_phase(DispensePhase::XEject);
    assert!(seq.tick(&mut machine, &mut cans).await.unwrap());
    assert_eq!(link.last_sent().unwrap(), "G0 X248.000 F600");
    assert_eq!(machine.state(), ProtocolState::MoveStarted);
}
