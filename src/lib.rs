//! Host-side controller for a mechanized canned-food dispenser driven by
//! motion-controller firmware over a line-oriented serial protocol.

pub mod config;
pub mod feeder;
pub mod hardware;
pub mod motion;
pub mod scheduler;
pub mod sequencer;
pub mod snapshot;
pub mod trigger;
pub mod web;

pub use config::{Config, load_config};
pub use feeder::{Feeder, FeederError, FeederStatus};
pub use motion::{MotionController, MotionError, Position, ProtocolState};
pub use scheduler::{FeedScheduler, ScheduleMode};
pub use sequencer::{DispensePhase, DispenseSequencer};
pub use snapshot::{JsonFileStore, MachineSnapshot, StateStore};
pub use trigger::{PendingCommandFile, TriggerAction};
