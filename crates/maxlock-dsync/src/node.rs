use std::sync::Arc;

use async_trait::async_trait;
use maxlock_common::{NodeError, NodeId};

/// One independent key-value endpoint taking part in the lock protocol.
///
/// Implementations are shared across every in-flight operation and must
/// accept concurrent calls.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> &NodeId;

    /// Evaluates a cached script by its content hash. A cache miss must be
    /// reported as [`NodeError::NoScript`].
    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, NodeError>;

    /// Evaluates a script by sending its full body.
    async fn eval(
        &self,
        body: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, NodeError>;

    /// Tears the connection down. Calls still in flight fail with
    /// [`NodeError::Closed`].
    async fn close(&self) -> Result<(), NodeError>;
}

pub type SharedNode = Arc<dyn Node>;
