//! Tokio utilities shared by scribe services: named task handles which
//! propagate panics, and a clonable one-shot shutdown channel.

pub mod shutdown;
pub mod task;

pub use shutdown::ShutdownChannel;
pub use task::NamedTask;
