//! The consensus worker thread.
//!
//! The worker owns the consensus context and processes, one at a time, the
//! commands sent by the controller and the expiry of the view timer.

pub mod checks;
pub mod init;
pub mod main_loop;
pub mod on_message;

use crate::commands::ConsensusCommand;
use crate::context::ConsensusContext;
use crate::controller::ConsensusControllerImpl;
use crate::manager::ConsensusManagerImpl;
use dbft_channel::{DbftChannel, DbftReceiver};
use dbft_consensus_exports::{
    ConsensusChannels, ConsensusConfig, ConsensusController, ConsensusManager,
};
use dbft_models::payload::PayloadId;
use std::collections::HashSet;
use std::time::Instant;
use tracing::log::error;

/// Size of the command channel between the controller and the worker.
const COMMAND_CHANNEL_SIZE: usize = 1024;

pub(crate) struct ConsensusWorker {
    pub(crate) config: ConsensusConfig,
    pub(crate) channels: ConsensusChannels,
    pub(crate) command_receiver: DbftReceiver<ConsensusCommand>,
    pub(crate) context: ConsensusContext,
    /// when the view timer fires
    pub(crate) timer_deadline: Instant,
    /// height the armed timer belongs to
    pub(crate) timer_height: u64,
    /// view the armed timer belongs to
    pub(crate) timer_view: u8,
    /// recovery requests already answered at this height, by payload id
    pub(crate) known_payloads: HashSet<PayloadId>,
    /// true while the compacts of a recovery message are being replayed
    pub(crate) is_recovering: bool,
}

/// Launches the consensus worker thread and returns a command sender
/// controller and a manager to stop it.
pub fn start_consensus_worker(
    config: ConsensusConfig,
    channels: ConsensusChannels,
) -> (Box<dyn ConsensusController>, Box<dyn ConsensusManager>) {
    let (command_sender, command_receiver) =
        DbftChannel::new("consensus_command".to_string(), Some(COMMAND_CHANNEL_SIZE));

    let thread_builder = std::thread::Builder::new().name("consensus".into());
    let thread_join_handle = thread_builder
        .spawn(move || {
            let mut worker = ConsensusWorker::new(config, channels, command_receiver);
            if let Err(err) = worker.on_start() {
                error!("error launching consensus worker: {}", err);
                return;
            }
            worker.run();
        })
        .expect("failed to spawn thread : consensus");

    let manager = ConsensusManagerImpl {
        consensus_thread: Some((command_sender.clone(), thread_join_handle)),
    };
    let controller = ConsensusControllerImpl::new(command_sender);

    (Box::new(controller), Box::new(manager))
}
