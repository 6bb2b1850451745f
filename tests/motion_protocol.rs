// Protocol state machine behavior against injected firmware lines.

mod common;

use std::sync::Arc;

use common::MockLink;
use feeder_rs::motion::{MotionController, MotionError, ProtocolState};

async fn connected_machine(arm_extra_z_ack: bool) -> (MotionController, Arc<MockLink>) {
    let link = Arc::new(MockLink::default());
    let mut machine = MotionController::new(link.clone(), arm_extra_z_ack);
    machine.connect().await.unwrap();
    (machine, link)
}

#[tokio::test]
async fn link_up_sends_absolute_positioning_once() {
    let (machine, link) = connected_machine(false).await;
    assert!(machine.is_connected());
    assert_eq!(machine.state(), ProtocolState::Idle);
    assert_eq!(link.sent_lines(), vec!["G90"]);
}

#[tokio::test]
async fn commands_rejected_while_disconnected() {
    let link = Arc::new(MockLink::default());
    let mut machine = MotionController::new(link.clone(), false);
    assert!(matches!(machine.home_x().await, Err(MotionError::NotConnected)));
    assert!(matches!(
        machine.move_x_to(10.0, 600.0).await,
        Err(MotionError::NotConnected)
    ));
    assert!(matches!(machine.move_z_to(10.0).await, Err(MotionError::NotConnected)));
    assert!(link.sent_lines().is_empty());
    assert_eq!(machine.state(), ProtocolState::Disconnected);
}

#[tokio::test]
async fn homing_completes_on_ack() {
    let (mut machine, link) = connected_machine(false).await;

    machine.home_x().await.unwrap();
    assert_eq!(machine.state(), ProtocolState::HomingX);
    assert_eq!(link.last_sent().unwrap(), "G28 X");
    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::XHomed);

    machine.home_z().await.unwrap();
    assert_eq!(machine.state(), ProtocolState::HomingZ);
    assert_eq!(link.last_sent().unwrap(), "G28 Z");
    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::Idle);
}

#[tokio::test]
async fn position_reports_never_transition_state() {
    let report = "X:12.50 Y:370.00 Z:99.25 E:0.00 Count X:0 Y:29600 Z:0";
    let states = [
        ProtocolState::Disconnected,
        ProtocolState::Idle,
        ProtocolState::HomingZ,
        ProtocolState::ZMoveStarted,
        ProtocolState::ZMoveAwaitComplete1,
        ProtocolState::ZMoveAwaitComplete2,
        ProtocolState::ZMoveCompleted,
        ProtocolState::HomingX,
        ProtocolState::XHomed,
        ProtocolState::MoveStarted,
        ProtocolState::MoveAwaitComplete,
        ProtocolState::MoveCompleted,
        ProtocolState::AwaitingPosition,
    ];
    for state in states {
        let (mut machine, _link) = connected_machine(false).await;
        machine.set_state(state);
        machine.on_line(report).await.unwrap();
        assert_eq!(machine.state(), state, "report must not transition {:?}", state);
        assert_eq!(machine.position().x, 12.5);
        assert_eq!(machine.position().z, 99.25);
    }
}

#[tokio::test]
async fn busy_echoes_are_ignored() {
    let (mut machine, link) = connected_machine(false).await;
    machine.move_x_to(165.0, 600.0).await.unwrap();
    let before = link.sent_lines();
    machine.on_line("echo:busy: processing").await.unwrap();
    machine.on_line("echo:busy: processing").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::MoveStarted);
    assert_eq!(link.sent_lines(), before);
}

#[tokio::test]
async fn x_move_requires_probe_then_second_ack() {
    let (mut machine, link) = connected_machine(false).await;
    machine.move_x_to(165.0, 600.0).await.unwrap();
    assert_eq!(machine.state(), ProtocolState::MoveStarted);
    assert_eq!(link.last_sent().unwrap(), "G0 X165.000 F600");
    // Optimistic position update on issue
    assert_eq!(machine.position().x, 165.0);

    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::MoveAwaitComplete);
    assert_eq!(link.last_sent().unwrap(), "M400");

    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::MoveCompleted);
}

#[tokio::test]
async fn z_move_without_quirk_takes_two_acks() {
    let (mut machine, link) = connected_machine(false).await;
    machine.move_z_to(100.0).await.unwrap();
    assert_eq!(machine.state(), ProtocolState::ZMoveStarted);
    assert_eq!(link.last_sent().unwrap(), "G0 Z100.000 F300");
    assert_eq!(machine.position().z, 100.0);

    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::ZMoveAwaitComplete1);
    assert_eq!(link.last_sent().unwrap(), "M400");

    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::Idle);
}

#[tokio::test]
async fn quirk_latch_consumes_exactly_one_extra_ack() {
    let (mut machine, _link) = connected_machine(true).await;
    machine.move_z_to(50.0).await.unwrap();
    assert!(machine.extra_ack_pending());

    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::ZMoveAwaitComplete1);

    // First wait-state ack is burned by the latch
    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::ZMoveAwaitComplete2);
    assert!(!machine.extra_ack_pending());

    // Second one completes the move
    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::Idle);

    // And never more than one: further acks in Idle change nothing
    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::Idle);
}

#[tokio::test]
async fn transitions_are_deterministic_over_a_line_sequence() {
    let lines = [
        "ok",
        "echo:busy: processing",
        "X:0.00 Y:370.00 Z:0.00 E:0.00 Count X:0 Y:29600 Z:0",
        "ok",
        "garbage",
        "ok",
    ];

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let (mut machine, link) = connected_machine(false).await;
        machine.move_x_to(25.0, 150.0).await.unwrap();
        for line in lines {
            machine.on_line(line).await.unwrap();
        }
        outcomes.push((machine.state(), machine.position(), link.sent_lines()));
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0, ProtocolState::MoveCompleted);
}

#[tokio::test]
async fn position_request_round_trip() {
    let (mut machine, link) = connected_machine(false).await;
    machine.request_position().await.unwrap();
    assert_eq!(machine.state(), ProtocolState::AwaitingPosition);
    assert_eq!(link.last_sent().unwrap(), "M114");

    machine.on_line("X:1.25 Y:0.00 Z:2.75 E:0.00 Count X:0 Y:0 Z:0").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::AwaitingPosition);
    assert_eq!(machine.position().x, 1.25);
    assert_eq!(machine.position().z, 2.75);

    machine.on_line("ok").await.unwrap();
    assert_eq!(machine.state(), ProtocolState::Idle);
}

#[tokio::test]
async fn fan_duty_uses_round_half_up() {
    let (machine, link) = connected_machine(false).await;
    // round(50 * 255 / 100) = round(127.5) = 128
    machine.set_fan_speed(0, 50).await.unwrap();
    assert_eq!(link.last_sent().unwrap(), "M106 P0 S128");

    machine.set_fan_speed(1, 100).await.unwrap();
    assert_eq!(link.last_sent().unwrap(), "M106 P1 S255");

    // Out-of-range percentages clamp
    machine.set_fan_speed(0, 150).await.unwrap();
    assert_eq!(link.last_sent().unwrap(), "M106 P0 S255");
    machine.set_fan_speed(0, -5).await.unwrap();
    assert_eq!(link.last_sent().unwrap(), "M106 P0 S0");

    assert_eq!(machine.state(), ProtocolState::Idle);
}

#[tokio::test]
async fn malformed_position_report_is_ignored() {
    let (mut machine, _link) = connected_machine(false).await;
    machine.set_state(ProtocolState::MoveAwaitComplete);
    machine.on_line("X:not-a-number Z:1.0").await.unwrap();
    assert_eq!(machine.position().x, 0.0);
    assert_eq!(machine.state(), ProtocolState::MoveAwaitComplete);
}
