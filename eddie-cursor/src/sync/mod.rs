//! Background refresh and mutation sequencing
//!
//! - `backend`: injected snapshot source and mutation backend traits
//! - `refresh`: fetch/swap state machine with gated listener delivery
//! - `sequencer`: batch stamping, local-first application, per-authority dispatch
//! - `undo`: tracking of the most recent destructive batch

pub mod backend;
pub mod refresh;
pub mod sequencer;
pub mod undo;
