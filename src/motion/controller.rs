//! Protocol state machine for the motion-controller firmware.
//!
//! The firmware acknowledges every command with a bare `ok`, but commands
//! finish at different times: homing and fan commands are done when the ack
//! arrives, while `G0` moves ack immediately and keep moving. For moves we
//! follow the ack with an `M400` (block until the motion queue drains) and
//! treat *its* ack as the real completion. That two-step is why move phases
//! carry a `...Started` and a `...AwaitComplete` state while homing has one.
//!
//! This type is the only component allowed to transition [`ProtocolState`]
//! and the only writer of [`Position`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::MotionError;
use crate::hardware::LineSink;

/// Exact acknowledgment token emitted by the firmware.
const ACK: &str = "ok";

/// Fixed feed rate for all Z moves, mm/min.
const Z_FEED: f64 = 300.0;

/// What acknowledgment or report the machine is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Disconnected,
    Idle,
    HomingZ,
    ZMoveStarted,
    ZMoveAwaitComplete1,
    ZMoveAwaitComplete2,
    ZMoveCompleted,
    HomingX,
    XHomed,
    MoveStarted,
    MoveAwaitComplete,
    MoveCompleted,
    AwaitingPosition,
}

/// Best-known actuator position. Written optimistically when a move is
/// issued and overwritten atomically whenever the firmware reports.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub z: f64,
}

pub struct MotionController {
    link: Arc<dyn LineSink>,
    state: ProtocolState,
    position: Position,
    /// Quirk latch: some Z move sequences produce one extra, otherwise
    /// indistinguishable `ok`. When set, exactly one extra ack is consumed
    /// before leaving the Z-move wait state. Armed per Z move from config.
    extra_ack_pending: bool,
    arm_extra_z_ack: bool,
}

impl MotionController {
    pub fn new(link: Arc<dyn LineSink>, arm_extra_z_ack: bool) -> Self {
        Self {
            link,
            state: ProtocolState::Disconnected,
            position: Position::default(),
            extra_ack_pending: false,
            arm_extra_z_ack,
        }
    }

    /// Bring the link up: put the firmware in absolute positioning mode and
    /// enter `Idle`.
    pub async fn connect(&mut self) -> Result<(), MotionError> {
        self.state = ProtocolState::Idle;
        self.send_command("G90").await?;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.state = ProtocolState::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        self.state != ProtocolState::Disconnected
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Explicit state override, used by the sequencer to stage what it
    /// expects before issuing a command, and by snapshot restore.
    pub fn set_state(&mut self, state: ProtocolState) {
        self.state = state;
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    pub fn extra_ack_pending(&self) -> bool {
        self.extra_ack_pending
    }

    pub fn set_extra_ack_pending(&mut self, pending: bool) {
        self.extra_ack_pending = pending;
    }

    /// Write one command line through the link. Rejected (not queued) while
    /// disconnected.
    pub async fn send_command(&self, gcode: &str) -> Result<(), MotionError> {
        if !self.is_connected() {
            tracing::error!("Rejected '{}': not connected to motion controller", gcode);
            return Err(MotionError::NotConnected);
        }
        self.link.send_line(gcode).await?;
        Ok(())
    }

    pub async fn home_x(&mut self) -> Result<(), MotionError> {
        if !self.is_connected() {
            tracing::error!("Rejected X home: not connected to motion controller");
            return Err(MotionError::NotConnected);
        }
        self.state = ProtocolState::HomingX;
        self.send_command("G28 X").await
    }

    pub async fn home_z(&mut self) -> Result<(), MotionError> {
        if !self.is_connected() {
            tracing::error!("Rejected Z home: not connected to motion controller");
            return Err(MotionError::NotConnected);
        }
        self.state = ProtocolState::HomingZ;
        self.send_command("G28 Z").await
    }

    pub async fn move_x_to(&mut self, position: f64, feed_rate: f64) -> Result<(), MotionError> {
        if !self.is_connected() {
            tracing::error!("Rejected X move: not connected to motion controller");
            return Err(MotionError::NotConnected);
        }
        self.state = ProtocolState::MoveStarted;
        self.send_command(&format!("G0 X{:.3} F{:.0}", position, feed_rate))
            .await?;
        // Forward estimate until the next position report overwrites it.
        self.position.x = position;
        Ok(())
    }

    pub async fn move_z_to(&mut self, position: f64) -> Result<(), MotionError> {
        if !self.is_connected() {
            tracing::error!("Rejected Z move: not connected to motion controller");
            return Err(MotionError::NotConnected);
        }
        self.state = ProtocolState::ZMoveStarted;
        if self.arm_extra_z_ack {
            self.extra_ack_pending = true;
        }
        self.send_command(&format!("G0 Z{:.3} F{:.0}", position, Z_FEED))
            .await?;
        self.position.z = position;
        Ok(())
    }

    /// Ask the firmware for a position report (`M114`). The report itself is
    /// handled by `on_line`; the trailing ack returns the machine to `Idle`.
    pub async fn request_position(&mut self) -> Result<(), MotionError> {
        if !self.is_connected() {
            tracing::error!("Rejected position request: not connected to motion controller");
            return Err(MotionError::NotConnected);
        }
        self.state = ProtocolState::AwaitingPosition;
        self.send_command("M114").await
    }

    /// Set a fan's duty from a 0..=100 percentage. The duty byte is
    /// `round(percent * 255 / 100)`, so 50% maps to 128. Does not touch the
    /// protocol state.
    pub async fn set_fan_speed(&self, fan: u8, percent: i32) -> Result<(), MotionError> {
        let percent = percent.clamp(0, 100);
        let duty = ((percent as f64) * 255.0 / 100.0).round() as u8;
        tracing::info!("Setting fan {} to {}% (duty {})", fan, percent, duty);
        self.send_command(&format!("M106 P{} S{}", fan, duty)).await
    }

    pub async fn emergency_stop(&self) -> Result<(), MotionError> {
        self.send_command("M112").await
    }

    /// Feed one received line through the state machine.
    ///
    /// Position reports overwrite both axes and never drive a transition;
    /// the bare ack token advances the current state per the firmware's
    /// completion semantics; anything else is logged and ignored.
    pub async fn on_line(&mut self, line: &str) -> Result<(), MotionError> {
        if line.starts_with("X:") {
            if let Some(position) = parse_position_report(line) {
                self.position = position;
                tracing::info!("Position updated: X={} Z={}", position.x, position.z);
            } else {
                tracing::warn!("Malformed position report: {}", line);
            }
            // Homing falls through to its ack on a later line.
            return Ok(());
        }

        if line != ACK {
            tracing::debug!("Ignoring line: {}", line);
            return Ok(());
        }

        match self.state {
            ProtocolState::HomingX => {
                tracing::info!("X homing complete");
                self.state = ProtocolState::XHomed;
            }
            ProtocolState::HomingZ => {
                tracing::info!("Z homing complete");
                self.state = ProtocolState::Idle;
            }
            ProtocolState::ZMoveStarted => {
                tracing::debug!("Z move acknowledged, probing with M400");
                self.send_command("M400").await?;
                self.state = ProtocolState::ZMoveAwaitComplete1;
            }
            ProtocolState::ZMoveAwaitComplete1 => {
                if self.extra_ack_pending {
                    tracing::debug!("Z move burning excess ack");
                    self.extra_ack_pending = false;
                    self.state = ProtocolState::ZMoveAwaitComplete2;
                } else {
                    tracing::info!("Z move complete");
                    self.state = ProtocolState::Idle;
                }
            }
            ProtocolState::ZMoveAwaitComplete2 => {
                tracing::info!("Z move complete");
                self.state = ProtocolState::Idle;
            }
            ProtocolState::MoveStarted => {
                tracing::debug!("X move acknowledged, probing with M400");
                self.send_command("M400").await?;
                self.state = ProtocolState::MoveAwaitComplete;
            }
            ProtocolState::MoveAwaitComplete => {
                tracing::info!("X move complete");
                self.state = ProtocolState::MoveCompleted;
            }
            ProtocolState::AwaitingPosition => {
                self.state = ProtocolState::Idle;
            }
            _ => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for MotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionController")
            .field("state", &self.state)
            .field("position", &self.position)
            .field("extra_ack_pending", &self.extra_ack_pending)
            .finish()
    }
}

/// Parse a firmware position report such as
/// `X:0.00 Y:370.00 Z:0.00 E:0.00 Count X:0 Y:29600 Z:0`: the float after
/// `X:` and the float after `Z:`, each running to the next space.
fn parse_position_report(line: &str) -> Option<Position> {
    let x = parse_axis(line, "X:")?;
    let z = parse_axis(line, "Z:")?;
    Some(Position { x, z })
}

fn parse_axis(line: &str, tag: &str) -> Option<f64> {
    let start = line.find(tag)? + tag.len();
    let rest = &line[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    rest[..end].parse().ok()
}
