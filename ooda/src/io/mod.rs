//! Side-effecting seams: filesystem, git, processes, tracker, agent, store.

pub mod agent;
pub mod config;
pub mod git;
pub mod learnings_store;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod retry;
pub mod signal;
pub mod store;
pub mod test_runner;
pub mod tracker;
pub mod transcripts;
