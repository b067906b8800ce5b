//! # General description
//!
//! The consensus worker runs the dBFT state machine on its own thread. A
//! committee of `n = 3f + 1` validators takes turns proposing blocks: the
//! primary of the current view broadcasts a prepare request, backups
//! acknowledge it, and once `n - f` preparations are gathered each validator
//! commits. A block is decided when `n - f` commits of the same view are
//! collected. Views change when a primary stalls, commits never do: a node
//! that committed saves its state to a recovery log before telling anyone,
//! and resumes that commitment after a restart.
//!
//! The worker is started with [start_consensus_worker] which returns:
//! - a [ConsensusController](dbft_consensus_exports::ConsensusController) to
//!   feed it payloads and transactions
//! - a [ConsensusManager](dbft_consensus_exports::ConsensusManager) to stop it

#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

mod commands;
mod context;
mod controller;
mod manager;
mod worker;

pub use worker::start_consensus_worker;

#[cfg(test)]
mod tests;
