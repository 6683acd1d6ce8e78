//! Device layer.
//!
//! - [`capabilities`]: the collaborator traits ([`StageDevice`], [`LaserTransport`])
//! - [`motion`] and [`laser`]: scan semantics on top of them
//! - [`esp300`] and [`tcp`]: real collaborators
//! - [`mock`]: simulated collaborators for tests and dry runs

pub mod capabilities;
pub mod esp300;
pub mod laser;
pub mod mock;
pub mod motion;
pub mod tcp;

pub use capabilities::{LaserTransport, StageDevice, Units};
pub use esp300::Esp300Stage;
pub use laser::{Flashlamp, LaserCommand, LaserLink, LaserState, LaserTiming, Shutter};
pub use mock::{RecordingTransport, SimulatedStage};
pub use motion::{MotionController, MotionSettings, StagePosition, StageStatus};
pub use tcp::TcpTransport;
