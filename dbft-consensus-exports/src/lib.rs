//! Exports of the consensus interface: controller traits, configuration,
//! events and the consensus message wire format.
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

/// controllers the consensus worker depends on
pub mod channels;
/// consensus controller and manager traits
pub mod controller_trait;
/// consensus error
pub mod error;
/// events emitted by consensus
pub mod events;
/// consensus message wire format
pub mod messages;
/// consensus configuration
pub mod settings;

pub use channels::ConsensusChannels;
pub use controller_trait::{ConsensusController, ConsensusManager};
pub use error::{ConsensusError, ConsensusResult};
pub use events::ConsensusEvent;
pub use settings::ConsensusConfig;
