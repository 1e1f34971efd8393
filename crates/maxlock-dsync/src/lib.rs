pub mod attempt;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod lock;
pub mod memory;
pub mod node;
pub mod retry;
pub mod round;
pub mod scripts;
pub mod token;

pub use attempt::{Vote, attempt};
pub use config::CoordinatorConfig;
pub use coordinator::LockCoordinator;
pub use events::{ChannelSink, EventSink, EventStream, LockEvent, NoopSink, TracingSink};
pub use lock::Lock;
pub use memory::MemoryNode;
pub use node::{Node, SharedNode};
pub use retry::RetryPolicy;
pub use round::{Decision, PendingRound, QuorumRound, RoundOutcome};
pub use scripts::{Script, ScriptKind, ScriptSet};
pub use token::LockToken;

pub use maxlock_common::{MaxlockError, NodeError, NodeId, Result, RoundStats};
