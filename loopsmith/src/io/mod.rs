//! Side-effecting collaborators used by the orchestration commands.

pub mod artifacts;
pub mod backlog;
pub mod config;
pub mod dispatch;
pub mod gates;
pub mod lock;
pub mod notify;
pub mod opencode;
pub mod paths;
pub mod platform;
pub mod process;
pub mod prompts;
pub mod session;
pub mod shell;
pub mod state_store;
pub mod task_store;
pub mod ui_verify;
