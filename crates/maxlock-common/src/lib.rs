pub mod error;
pub mod time;
pub mod types;

pub use error::{MaxlockError, NodeError, Result};
pub use types::{NodeId, RoundStats, quorum_size};
