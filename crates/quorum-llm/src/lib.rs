//! Model provider adapters for quorum.
//!
//! Concrete HTTP/SSE transports live outside the kernel; this crate
//! carries what the kernel itself needs: [`ScriptedProvider`] for
//! deterministic tests and [`ReliableProvider`], the retry/circuit-breaker
//! decorator applied to any transport.

pub mod reliable;
pub mod scripted;

pub use reliable::{ReliableConfig, ReliableProvider};
pub use scripted::{ScriptedProvider, ScriptedResponse};
