//! Keyport CLI library.
//!
//! Terminal front end for the keyport connection manager.

pub mod connect;

pub use connect::{ConnectArgs, run_connect};
