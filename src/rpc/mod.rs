//! RPC messaging core
//!
//! Correlated request/response, command dispatch and statistics on top of a
//! [`crate::transport::Transport`].

pub mod commands;
mod device;
pub mod message;
mod pending;
pub mod stats;

pub use commands::{CommandHandler, CommandRegistry, FnHandler};
pub use device::{STATUS_COMMAND, VirtualDevice};
pub use message::{
    Devices, Envelope, RET_OK, RET_TIMEOUT, RET_UNKNOWN_COMMAND, RET_VALIDATION_FAILED,
    RpcBackPayload, RpcCallPayload, Topic, ValidationError,
};
pub use pending::PendingCalls;
pub use stats::Statistics;
