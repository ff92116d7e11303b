//! Long-lived render worker driven over line-delimited JSON on stdin/stdout.

pub mod bounded;
pub mod drain;
pub mod guard;
pub mod locate;
pub mod protocol;
mod session;

pub use session::{SessionState, WorkerSession};
