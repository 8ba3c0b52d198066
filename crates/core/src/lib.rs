//! Core crate for the stemsplit job service.

pub mod config;
pub mod download;
pub mod logging;
pub mod pipeline;
pub mod probe;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod separator;
pub mod server;
pub mod signing;
pub mod storage;
pub mod types;
pub mod webhook;
