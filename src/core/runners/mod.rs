//! Execution backends: the warm pool, the local runner and the remote CI
//! runner, plus the agent seam they all execute through.

mod executor;
mod github;
mod local;
mod remote;
mod warm;

#[cfg(test)]
pub mod testing;

pub use executor::{AgentExecutor, ShellAgent};
pub use github::GitHubClient;
pub use local::LocalRunner;
pub use remote::RemoteRunner;
pub use warm::{PoolStatus, WarmPool, WorkerInfo};
