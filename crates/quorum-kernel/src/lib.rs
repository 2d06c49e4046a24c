//! The quorum agent runtime kernel.
//!
//! An embeddable core that drives long-lived model conversations:
//! per-agent execution loop with persisted breakpoints, concurrent tool
//! dispatch with permission and hook gating, a totally-ordered
//! three-channel event bus with replay, crash recovery via auto-seal,
//! and pool/room lifecycle management. Applications wrap it with their
//! own I/O, authentication, and UI; network exposure is the embedder's
//! concern.

pub mod agent;
pub mod breakpoints;
pub mod bus;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod hooks;
pub mod permissions;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod room;
pub mod scheduler;
pub mod todo;
pub mod truncate;
pub mod watcher;

pub use agent::{Agent, AgentDeps, ChatOutcome, ChatStatus};
pub use bus::{EventBus, ListenerHandle};
pub use dispatcher::{DispatcherConfig, PendingCall, ToolDispatcher};
pub use error::KernelError;
pub use permissions::{PermissionManager, PermissionOutcome};
pub use pool::{AgentPool, ShutdownOptions, ShutdownReport};
pub use registry::ToolRegistry;
pub use room::Room;
pub use scheduler::Scheduler;
