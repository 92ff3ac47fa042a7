//! Stream API (Low-level)
//!
//! Provides maximum control for users who want to manually manage frame send/receive.

mod client;

pub use client::StreamClient;
