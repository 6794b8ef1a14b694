//! Side-effecting collaborators: model transport, interpreter, logs, config.

pub mod config;
pub mod delegate;
pub mod model;
pub mod prompt;
pub mod run_log;
pub mod sandbox;
