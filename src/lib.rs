//! WAGERHALL: pari-mutuel wagering events for community chat spaces.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod error;
pub mod storage;
pub mod engine;
pub mod platform;
pub mod session;
pub mod actions;
pub mod console;
pub mod dashboard;
