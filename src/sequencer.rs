//! Nine-phase dispense sequence: open the can lid on the X axis, then lift
//! and eject on Z. Each phase is an enter/poll pair: the entry action fires
//! once (issuing its motion commands), then every control-loop pass checks a
//! completion predicate against the protocol machine's state. Only one
//! command chain is ever in flight; a phase never advances until the machine
//! has reached its target state.

use serde::{Deserialize, Serialize};

use crate::config::MechanicsConfig;
use crate::motion::{MotionController, MotionError, ProtocolState};

/// Current step of the dispense sequence. `Idle` means no sequence active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispensePhase {
    Idle,
    XHoming,
    XToStart,
    TabLifting,
    LidPeeling,
    XRehoming,
    ZLiftToEject,
    XEject,
    XRehomingFinal,
    ZNextCan,
}

const PHASE_COUNT: usize = 9;

impl DispensePhase {
    fn index(self) -> Option<usize> {
        match self {
            DispensePhase::Idle => None,
            DispensePhase::XHoming => Some(0),
            DispensePhase::XToStart => Some(1),
            DispensePhase::TabLifting => Some(2),
            DispensePhase::LidPeeling => Some(3),
            DispensePhase::XRehoming => Some(4),
            DispensePhase::ZLiftToEject => Some(5),
            DispensePhase::XEject => Some(6),
            DispensePhase::XRehomingFinal => Some(7),
            DispensePhase::ZNextCan => Some(8),
        }
    }
}

pub struct DispenseSequencer {
    phase: DispensePhase,
    started: [bool; PHASE_COUNT],
    mechanics: MechanicsConfig,
}

impl DispenseSequencer {
    pub fn new(mechanics: MechanicsConfig) -> Self {
        Self {
            phase: DispensePhase::Idle,
            started: [false; PHASE_COUNT],
            mechanics,
        }
    }

    pub fn phase(&self) -> DispensePhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != DispensePhase::Idle
    }

    /// Restore a phase from a persisted snapshot. Latches stay clear so the
    /// restored phase re-runs its entry action on the next tick.
    pub fn set_phase(&mut self, phase: DispensePhase) {
        self.phase = phase;
        self.started = [false; PHASE_COUNT];
    }

    /// Begin a full dispense from phase 1. Fans come up to full for the
    /// duration of the sequence.
    pub async fn start(&mut self, machine: &mut MotionController) -> Result<(), MotionError> {
        tracing::info!("Starting food dispense sequence");
        machine.set_fan_speed(0, 100).await?;
        machine.set_fan_speed(1, 100).await?;
        self.started = [false; PHASE_COUNT];
        self.phase = DispensePhase::XHoming;
        Ok(())
    }

    /// Begin at the eject phase, skipping the lid-opening moves. Used for
    /// operator-triggered ejection of an already-opened can.
    pub async fn start_eject_only(
        &mut self,
        machine: &mut MotionController,
    ) -> Result<(), MotionError> {
        tracing::info!("Starting eject-only sequence");
        machine.set_fan_speed(0, 100).await?;
        machine.set_fan_speed(1, 100).await?;
        self.started = [false; PHASE_COUNT];
        self.phase = DispensePhase::ZLiftToEject;
        Ok(())
    }

    /// Stop a running sequence: immediate firmware halt, fans off, every
    /// latch cleared, both state machines back to idle. No-op when no
    /// sequence is active. Returns whether anything was aborted.
    pub async fn abort(&mut self, machine: &mut MotionController) -> Result<bool, MotionError> {
        if self.phase == DispensePhase::Idle {
            return Ok(false);
        }
        tracing::warn!("Aborting dispense sequence in {:?}", self.phase);
        machine.emergency_stop().await?;
        machine.set_fan_speed(0, 0).await?;
        machine.set_fan_speed(1, 0).await?;
        self.started = [false; PHASE_COUNT];
        self.phase = DispensePhase::Idle;
        machine.set_state(ProtocolState::Idle);
        Ok(true)
    }

    /// Drive the sequence one step. Returns true when a latch or phase
    /// changed, which is the owner's cue to checkpoint the snapshot.
    pub async fn tick(
        &mut self,
        machine: &mut MotionController,
        cans_loaded: &mut u32,
    ) -> Result<bool, MotionError> {
        let Some(index) = self.phase.index() else {
            return Ok(false);
        };

        if !self.started[index] {
            self.started[index] = true;
            self.enter_phase(machine).await?;
            return Ok(true);
        }

        if !self.phase_complete(machine.state()) {
            return Ok(false);
        }

        tracing::info!("Phase {:?} complete", self.phase);
        self.started[index] = false;
        self.phase = match self.phase {
            DispensePhase::XHoming => DispensePhase::XToStart,
            DispensePhase::XToStart => DispensePhase::TabLifting,
            DispensePhase::TabLifting => DispensePhase::LidPeeling,
            DispensePhase::LidPeeling => DispensePhase::XRehoming,
            DispensePhase::XRehoming => DispensePhase::ZLiftToEject,
            DispensePhase::ZLiftToEject => DispensePhase::XEject,
            DispensePhase::XEject => DispensePhase::XRehomingFinal,
            DispensePhase::XRehomingFinal => DispensePhase::ZNextCan,
            DispensePhase::ZNextCan => {
                *cans_loaded = cans_loaded.saturating_sub(1);
                tracing::info!("Dispense sequence complete, {} cans left", cans_loaded);
                DispensePhase::Idle
            }
            DispensePhase::Idle => DispensePhase::Idle,
        };
        Ok(true)
    }

    async fn enter_phase(&self, machine: &mut MotionController) -> Result<(), MotionError> {
        let m = &self.mechanics;
        tracing::info!("Entering phase {:?}", self.phase);
        match self.phase {
            DispensePhase::XHoming | DispensePhase::XRehoming | DispensePhase::XRehomingFinal => {
                machine.home_x().await
            }
            DispensePhase::XToStart => machine.move_x_to(m.x_start, m.feed_fast).await,
            DispensePhase::TabLifting => machine.move_x_to(m.x_tab_lift, m.feed_slow).await,
            DispensePhase::LidPeeling => machine.move_x_to(m.x_lid_peel, m.feed_slow).await,
            DispensePhase::ZLiftToEject => {
                let target = machine.position().z + m.can_to_eject;
                machine.move_z_to(target).await
            }
            DispensePhase::XEject => machine.move_x_to(m.x_eject, m.feed_fast).await,
            DispensePhase::ZNextCan => {
                let target = machine.position().z + m.next_can;
                machine.move_z_to(target).await
            }
            DispensePhase::Idle => Ok(()),
        }
    }

    fn phase_complete(&self, state: ProtocolState) -> bool {
        match self.phase {
            DispensePhase::XHoming | DispensePhase::XRehoming | DispensePhase::XRehomingFinal => {
                state == ProtocolState::XHomed
            }
            DispensePhase::XToStart
            | DispensePhase::TabLifting
            | DispensePhase::LidPeeling
            | DispensePhase::XEject => state == ProtocolState::MoveCompleted,
            DispensePhase::ZLiftToEject | DispensePhase::ZNextCan => state == ProtocolState::Idle,
            DispensePhase::Idle => false,
        }
    }
}
