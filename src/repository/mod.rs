//! Persistent metadata stores.

pub mod run_history;
