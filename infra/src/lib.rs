//! Remote execution plumbing shared by every step that touches cluster hosts.

pub mod agent;
pub mod error;
pub mod exec;
pub mod hosts;
pub mod logging;

pub use agent::{Agent, Output, SshAuth, quote};
pub use error::{BoxError, HostFailure, InfraError};
pub use exec::{execute, retry, wait_ready};
