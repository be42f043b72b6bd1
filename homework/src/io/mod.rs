//! Side-effecting adapters: state files, the datastore, the job queue,
//! notifications, and the completion backend.

pub mod codex;
pub mod completion;
pub mod config;
pub mod init;
pub mod notify;
pub mod process;
pub mod prompt;
pub mod queue;
pub mod state_file;
pub mod store;
