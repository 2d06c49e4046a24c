use quorum_core::ids::{AgentId, ToolCallId};
use quorum_core::provider::ProviderError;
use quorum_core::records::TransitionError;
use quorum_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool call transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("permission not pending: {0}")]
    NotPending(ToolCallId),

    #[error("agent already exists: {0}")]
    AlreadyExists(AgentId),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("pool at capacity ({0} agents)")]
    PoolFull(usize),

    #[error("interrupted")]
    Interrupted,

    #[error("max steps exceeded: {0}")]
    MaxStepsExceeded(u64),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("input queue closed")]
    QueueClosed,

    #[error("{0}")]
    Internal(String),
}
