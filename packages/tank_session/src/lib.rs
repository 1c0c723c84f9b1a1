//! Tanks - a small multiplayer tank session built on `peer_mesh`.
//!
//! - `profile` - player metadata announced on connect
//! - `tank` - the replicated vehicle entity
//! - `events` - discrete game-event channels
//! - `commands` - console input parsing
//! - `config` - layered file/env configuration
//! - `session` - wiring of network, tank, chat and events for one player

pub mod commands;
pub mod config;
pub mod events;
pub mod profile;
pub mod session;
pub mod tank;

pub use profile::Profile;
pub use session::{Flow, Session};
pub use tank::Tank;
