//! `xfrd`: the inbound transfer client. One [`zone::ZoneState`] per
//! configured zone, driven by [`engine::ZoneEngine`] through the shared
//! [`crate::netio::Reactor`].

pub mod engine;
pub mod transfer;
pub mod zone;

pub use engine::{PacketOutcome, StatusSnapshot, ZoneEngine};
pub use transfer::{run_one_attempt, AttemptOutcome, TransferError};
pub use zone::{RefreshTimerState, ZoneState};
