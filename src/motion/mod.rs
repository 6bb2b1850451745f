// src/motion/mod.rs
pub mod controller;

pub use controller::{MotionController, Position, ProtocolState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("Not connected to motion controller")]
    NotConnected,
    #[error("Link error: {0}")]
    Link(#[from] crate::hardware::LinkError),
}
